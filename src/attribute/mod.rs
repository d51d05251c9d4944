mod channel;
mod set;

use std::fmt;

use slotmap::SlotMap;
use smol_str::SmolStr;
use tracing::error;

use crate::math::floor_to_i32;
use crate::subscription::{EffectSubscriber, SubscriptionKey};

pub use channel::{ChannelData, OverrideId};
pub use set::{AttributeDef, AttributeMap, AttributeSetDef};

pub(crate) use channel::OverrideRecord;

/// Fully-qualified attribute name, `"<SetName>.<FieldName>"`.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AttributeKey(SmolStr);

impl AttributeKey {
    pub const fn new(text: SmolStr) -> Self {
        Self(text)
    }

    pub const fn new_static(text: &'static str) -> Self {
        Self(SmolStr::new_static(text))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for AttributeKey {
    fn from(text: &str) -> Self {
        Self(SmolStr::new(text))
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({:?})", self.0)
    }
}

/// A bounded integer gameplay value with a per-channel modifier stack.
///
/// `base` is the permanent value; temporary modifiers accumulate in the
/// channels and are folded into `current` by [`Attribute::recompute`].
/// Intermediates are carried as `f32` and floored once at the end of the
/// channel pipeline, then clamped into `[min, max]`.
pub struct Attribute {
    key: AttributeKey,
    base: i32,
    min: i32,
    max: i32,
    channels: Vec<ChannelData>,
    overrides: Vec<OverrideRecord>,
    next_override_id: u64,
    current: i32,
    modifier: i32,
    overflow: i32,
    pending: i32,
    pub(crate) subscribers: SlotMap<SubscriptionKey, EffectSubscriber>,
}

impl Attribute {
    pub fn new(key: AttributeKey, base: i32, min: i32, max: i32, channel_count: usize) -> Self {
        debug_assert!(min <= max, "attribute {key}: min {min} above max {max}");
        debug_assert!(
            (min..=max).contains(&base),
            "attribute {key}: base {base} outside [{min}, {max}]"
        );
        debug_assert!(channel_count >= 1, "attribute {key}: no channels");

        let mut attribute = Self {
            key,
            base,
            min,
            max,
            channels: vec![ChannelData::default(); channel_count.max(1)],
            overrides: Vec::new(),
            next_override_id: 0,
            current: base,
            modifier: 0,
            overflow: 0,
            pending: 0,
            subscribers: SlotMap::with_key(),
        };
        attribute.recompute();
        attribute.pending = 0;
        attribute
    }

    pub fn key(&self) -> &AttributeKey {
        &self.key
    }

    pub fn base_value(&self) -> i32 {
        self.base
    }

    pub fn current_value(&self) -> i32 {
        self.current
    }

    pub fn min_value(&self) -> i32 {
        self.min
    }

    pub fn max_value(&self) -> i32 {
        self.max
    }

    /// Unclamped channel result minus base.
    pub fn modifier(&self) -> i32 {
        self.modifier
    }

    /// Signed magnitude past the nearest bound, zero when in range.
    pub fn overflow(&self) -> i32 {
        self.overflow
    }

    /// The part of the modifier that survived clamping.
    pub fn valid_modifier(&self) -> i32 {
        self.modifier - self.overflow
    }

    /// Accumulated current-value change since the last flush.
    pub fn pending_value_change(&self) -> i32 {
        self.pending
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: u8) -> Option<&ChannelData> {
        self.channels.get(index as usize)
    }

    pub fn set_min(&mut self, value: i32) {
        debug_assert!(value <= self.max, "attribute {}: min above max", self.key);
        self.min = value.min(self.max);
        self.base = self.base.clamp(self.min, self.max);
        self.recompute();
    }

    pub fn set_max(&mut self, value: i32) {
        debug_assert!(value >= self.min, "attribute {}: max below min", self.key);
        self.max = value.max(self.min);
        self.base = self.base.clamp(self.min, self.max);
        self.recompute();
    }

    /// Permanently shifts the base value.
    pub fn execute_flat(&mut self, value: i32) {
        self.base = self.base.saturating_add(value).clamp(self.min, self.max);
        self.recompute();
    }

    /// Permanently scales the base value by `1.0 + percent`.
    pub fn execute_percent(&mut self, percent: f32) {
        let scaled = floor_to_i32(self.base as f32 * (1.0 + percent));
        self.base = scaled.clamp(self.min, self.max);
        self.recompute();
    }

    /// Permanently replaces the base value.
    pub fn execute_override(&mut self, value: i32) {
        self.base = value.clamp(self.min, self.max);
        self.recompute();
    }

    pub fn add_flat_modifier(&mut self, value: i32, channel: u8) {
        let Some(data) = self.channels.get_mut(channel as usize) else {
            self.missing_channel(channel);
            return;
        };
        data.flat += value;
        self.recompute();
    }

    pub fn add_percent_modifier(&mut self, percent: f32, channel: u8) {
        let Some(data) = self.channels.get_mut(channel as usize) else {
            self.missing_channel(channel);
            return;
        };
        data.percent += percent;
        self.recompute();
    }

    /// Pushes an override record and makes it the channel's active override.
    pub fn add_override(&mut self, magnitude: i32, channel: u8) -> Option<OverrideId> {
        if channel as usize >= self.channels.len() {
            self.missing_channel(channel);
            return None;
        }
        let id = OverrideId(self.next_override_id);
        self.next_override_id += 1;
        self.overrides.push(OverrideRecord {
            id,
            magnitude,
            channel,
        });
        self.refresh_override_slot(channel);
        self.recompute();
        Some(id)
    }

    /// Removes an override record; the next most recent record for the same
    /// channel, if any, takes over.
    pub fn clear_override(&mut self, id: OverrideId) {
        let Some(position) = self.overrides.iter().position(|record| record.id == id) else {
            return;
        };
        let channel = self.overrides.remove(position).channel;
        self.refresh_override_slot(channel);
        self.recompute();
    }

    /// Partial evaluation through the channels below `channel`, unclamped.
    pub fn calculate_magnitude_up_to_channel(&self, channel: u8) -> f32 {
        let mut value = self.base as f32;
        for data in self.channels.iter().take(channel as usize) {
            value = match data.override_slot {
                Some(active) => active as f32,
                None => (value + data.flat as f32) * data.percent,
            };
        }
        value
    }

    pub(crate) fn take_pending(&mut self) -> i32 {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn subscribe(&mut self, subscriber: EffectSubscriber) -> SubscriptionKey {
        self.subscribers.insert(subscriber)
    }

    fn refresh_override_slot(&mut self, channel: u8) {
        self.channels[channel as usize].override_slot = self
            .overrides
            .iter()
            .rev()
            .find(|record| record.channel == channel)
            .map(|record| record.magnitude);
    }

    fn missing_channel(&self, channel: u8) {
        debug_assert!(false, "attribute {}: no channel {channel}", self.key);
        error!(
            attribute = %self.key,
            channel,
            "modifier addressed a channel the attribute does not have"
        );
    }

    fn evaluate_channels(&self) -> f32 {
        let mut value = self.base as f32;
        for data in &self.channels {
            value = match data.override_slot {
                Some(active) => active as f32,
                None => (value + data.flat as f32) * data.percent,
            };
        }
        value
    }

    fn recompute(&mut self) {
        let previous = self.current;
        let floored = floor_to_i32(self.evaluate_channels());
        self.current = floored.clamp(self.min, self.max);
        self.modifier = floored - self.base;
        self.overflow = if floored > self.max {
            floored - self.max
        } else if floored < self.min {
            floored - self.min
        } else {
            0
        };
        self.pending += self.current - previous;
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("key", &self.key)
            .field("base", &self.base)
            .field("current", &self.current)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("channels", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health() -> Attribute {
        Attribute::new(AttributeKey::new_static("Combat.Health"), 100, 0, 100, 1)
    }

    #[test]
    fn construction_is_clean() {
        let attribute = health();
        assert_eq!(attribute.current_value(), 100);
        assert_eq!(attribute.modifier(), 0);
        assert_eq!(attribute.overflow(), 0);
        assert_eq!(attribute.pending_value_change(), 0);
    }

    #[test]
    fn execute_flat_clamps_and_accumulates_pending() {
        let mut attribute = health();
        attribute.execute_flat(-25);
        assert_eq!(attribute.base_value(), 75);
        assert_eq!(attribute.current_value(), 75);
        assert_eq!(attribute.pending_value_change(), -25);

        attribute.execute_flat(-200);
        assert_eq!(attribute.base_value(), 0);
        assert_eq!(attribute.take_pending(), -100);
        assert_eq!(attribute.pending_value_change(), 0);
    }

    #[test]
    fn flat_then_percent_on_one_channel() {
        let mut attribute =
            Attribute::new(AttributeKey::new_static("Combat.Attack"), 10, 0, 1000, 1);
        attribute.add_flat_modifier(5, 0);
        attribute.add_percent_modifier(0.2, 0);
        assert_eq!(attribute.current_value(), 18);
        assert_eq!(attribute.modifier(), 8);
    }

    #[test]
    fn percent_before_flat_across_channels() {
        let mut attribute =
            Attribute::new(AttributeKey::new_static("Combat.Attack"), 10, 0, 1000, 2);
        attribute.add_percent_modifier(0.2, 0);
        attribute.add_flat_modifier(5, 1);
        assert_eq!(attribute.current_value(), 17);
    }

    #[test]
    fn overflow_is_signed() {
        let mut attribute = health();
        attribute.add_flat_modifier(40, 0);
        assert_eq!(attribute.current_value(), 100);
        assert_eq!(attribute.modifier(), 40);
        assert_eq!(attribute.overflow(), 40);
        assert_eq!(attribute.valid_modifier(), 0);

        attribute.add_flat_modifier(-190, 0);
        assert_eq!(attribute.current_value(), 0);
        assert_eq!(attribute.overflow(), -50);
    }

    #[test]
    fn override_records_restore_in_order() {
        let mut attribute = health();
        let first = attribute.add_override(40, 0).unwrap();
        let second = attribute.add_override(60, 0).unwrap();
        assert_eq!(attribute.current_value(), 60);

        attribute.clear_override(second);
        assert_eq!(attribute.current_value(), 40);
        attribute.clear_override(first);
        assert_eq!(attribute.current_value(), 100);
    }

    #[test]
    fn override_shadows_prior_channels() {
        let mut attribute =
            Attribute::new(AttributeKey::new_static("Combat.Attack"), 10, 0, 1000, 2);
        attribute.add_flat_modifier(500, 0);
        attribute.add_override(20, 1).unwrap();
        assert_eq!(attribute.current_value(), 20);

        // Later channels resume from the override value.
        attribute.add_flat_modifier(500, 0);
        assert_eq!(attribute.current_value(), 20);
    }

    #[test]
    fn partial_evaluation_stops_before_channel() {
        let mut attribute =
            Attribute::new(AttributeKey::new_static("Combat.Attack"), 10, 0, 1000, 2);
        attribute.add_flat_modifier(5, 0);
        attribute.add_percent_modifier(0.5, 1);
        assert_eq!(attribute.calculate_magnitude_up_to_channel(0), 10.0);
        assert_eq!(attribute.calculate_magnitude_up_to_channel(1), 15.0);
        assert_eq!(attribute.calculate_magnitude_up_to_channel(2), 22.5);
    }

    #[test]
    fn shrinking_bounds_reclamps_base() {
        let mut attribute = health();
        attribute.set_max(80);
        assert_eq!(attribute.base_value(), 80);
        assert_eq!(attribute.current_value(), 80);

        attribute.set_min(50);
        assert_eq!(attribute.base_value(), 80);
        assert_eq!(attribute.min_value(), 50);
    }
}
