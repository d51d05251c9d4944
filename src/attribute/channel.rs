/// One calculation lane within an attribute.
///
/// Channels are evaluated in index order. A channel with an active override
/// discards all prior-channel work; otherwise the running value picks up the
/// flat bonus and is scaled by the percent accumulator.
#[derive(Clone, Copy, Debug)]
pub struct ChannelData {
    /// The winning override for this channel, if any. Derived from the
    /// attribute's override record list.
    pub(crate) override_slot: Option<i32>,
    pub(crate) flat: i32,
    /// Multiplier with identity `1.0`. Percent bonuses accumulate
    /// additively (`+0.2` and `+0.3` combine to `1.5`) so that detaching a
    /// bonus restores the previous value exactly.
    pub(crate) percent: f32,
}

impl Default for ChannelData {
    fn default() -> Self {
        Self {
            override_slot: None,
            flat: 0,
            percent: 1.0,
        }
    }
}

impl ChannelData {
    pub fn override_value(&self) -> Option<i32> {
        self.override_slot
    }

    pub fn flat_modifier(&self) -> i32 {
        self.flat
    }

    pub fn percent_modifier(&self) -> f32 {
        self.percent
    }
}

/// Identifies one override record on one attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OverrideId(pub(crate) u64);

/// An active override: `(magnitude, channel)` plus its identity.
///
/// Records live in one insertion-ordered list per attribute; the most recent
/// record for a channel provides that channel's override slot, and removing
/// it falls back to the next most recent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OverrideRecord {
    pub id: OverrideId,
    pub magnitude: i32,
    pub channel: u8,
}
