use std::collections::HashMap;
use std::rc::Rc;

use tracing::warn;

use crate::actor::ActorId;
use crate::attribute::{AttributeKey, AttributeMap, OverrideId};
use crate::effect::runtime::{EffectOwnership, RuntimeEffect};
use crate::effect::{DurationPolicy, EffectData, ModOp, StackMagnitudePolicy};
use crate::magnitude::{CaptureKey, EvalSides, MagnitudeContext, SourceAttributes};
use crate::math::floor_to_i32;
use crate::subscription::SubscriptionToken;

/// One modifier with its magnitude frozen by the latest evaluation.
///
/// Attach and detach both derive the integer contribution from the stored
/// `f32`, so a detach subtracts exactly what the attach added.
pub(crate) struct EvaluatedModifier {
    pub attribute: AttributeKey,
    pub operation: ModOp,
    pub magnitude: f32,
    pub channel: u8,
    pub override_id: Option<OverrideId>,
}

/// Everything an application has evaluated from its configuration.
#[derive(Default)]
pub(crate) struct EvaluatedSnapshot {
    pub duration: f64,
    pub period: f64,
    pub modifiers: Vec<EvaluatedModifier>,
}

impl EvaluatedSnapshot {
    /// Whether re-evaluation produced observably identical results.
    pub fn matches(&self, other: &EvaluatedSnapshot) -> bool {
        self.duration == other.duration
            && self.period == other.period
            && self.modifiers.len() == other.modifiers.len()
            && self
                .modifiers
                .iter()
                .zip(&other.modifiers)
                .all(|(a, b)| {
                    a.attribute == b.attribute
                        && a.operation == b.operation
                        && a.channel == b.channel
                        && a.magnitude == b.magnitude
                })
    }
}

/// Runtime state of one application of an effect to one target.
pub(crate) struct ActiveEffect {
    pub runtime: RuntimeEffect,
    pub data: Rc<EffectData>,
    /// The effective level, which stack merges may move away from the
    /// runtime effect's own level.
    pub level: i32,
    pub stack_count: i32,
    pub remaining_duration: f64,
    pub internal_time: f64,
    pub next_periodic_tick: f64,
    pub execution_count: u64,
    pub inhibited: bool,
    /// Whether this application's modifiers are currently attached.
    pub attached: bool,
    pub tags_granted: bool,
    pub snapshot_cache: HashMap<CaptureKey, f32>,
    pub subscriptions: Vec<SubscriptionToken>,
    pub evaluated: EvaluatedSnapshot,
}

impl ActiveEffect {
    pub fn is_periodic(&self) -> bool {
        self.data.periodic().is_some()
    }

    pub fn has_duration(&self) -> bool {
        matches!(self.data.duration(), DurationPolicy::HasDuration(_))
    }

    /// Attaches every evaluated modifier to the target's attributes.
    /// Periodic effects never call this; their ticks mutate base values.
    pub fn attach(&mut self, attributes: &mut AttributeMap) {
        debug_assert!(!self.attached);
        for modifier in &mut self.evaluated.modifiers {
            let Some(attribute) = attributes.get_mut(&modifier.attribute) else {
                warn!(attribute = %modifier.attribute, "modifier targets a missing attribute");
                continue;
            };
            match modifier.operation {
                ModOp::FlatBonus => {
                    attribute.add_flat_modifier(floor_to_i32(modifier.magnitude), modifier.channel)
                }
                ModOp::PercentBonus => {
                    attribute.add_percent_modifier(modifier.magnitude, modifier.channel)
                }
                ModOp::Override => {
                    modifier.override_id =
                        attribute.add_override(floor_to_i32(modifier.magnitude), modifier.channel)
                }
            }
        }
        self.attached = true;
    }

    /// Exactly reverses [`ActiveEffect::attach`].
    pub fn detach(&mut self, attributes: &mut AttributeMap) {
        if !self.attached {
            return;
        }
        for modifier in &mut self.evaluated.modifiers {
            let Some(attribute) = attributes.get_mut(&modifier.attribute) else {
                continue;
            };
            match modifier.operation {
                ModOp::FlatBonus => {
                    attribute.add_flat_modifier(-floor_to_i32(modifier.magnitude), modifier.channel)
                }
                ModOp::PercentBonus => {
                    attribute.add_percent_modifier(-modifier.magnitude, modifier.channel)
                }
                ModOp::Override => {
                    if let Some(id) = modifier.override_id.take() {
                        attribute.clear_override(id);
                    }
                }
            }
        }
        self.attached = false;
    }
}

/// Runs `f` with both sides of an evaluation resolved.
///
/// A source identical to the target reuses the already-borrowed map; a
/// distinct live source is borrowed for the duration of the call; a dead
/// source reads as missing.
pub(crate) fn with_sides<R>(
    attributes: &AttributeMap,
    target_id: ActorId,
    ownership: &EffectOwnership,
    f: impl FnOnce(&EvalSides<'_>) -> R,
) -> R {
    if ownership.source_id == target_id {
        return f(&EvalSides::new(attributes, SourceAttributes::SameAsTarget));
    }
    match ownership.source.upgrade() {
        Some(source) => {
            let borrow = source.borrow();
            f(&EvalSides::new(attributes, SourceAttributes::Borrowed(borrow)))
        }
        None => f(&EvalSides::new(attributes, SourceAttributes::Gone)),
    }
}

/// Evaluates an effect's modifiers, duration and period at one point in
/// time. The stack multiplier applies to modifier magnitudes only, after the
/// full affine evaluation.
pub(crate) fn evaluate_effect(
    attributes: &AttributeMap,
    target_id: ActorId,
    runtime: &RuntimeEffect,
    level: i32,
    stack_count: i32,
    snapshot_cache: Option<&HashMap<CaptureKey, f32>>,
) -> EvaluatedSnapshot {
    let state = runtime.inner.borrow();
    let data = Rc::clone(&state.data);

    let multiplier = match data.stacking().map(|stacking| stacking.magnitude_policy) {
        Some(StackMagnitudePolicy::Sum) => stack_count as f32,
        _ => 1.0,
    };

    let modifiers = with_sides(attributes, target_id, &state.ownership, |sides| {
        let context = MagnitudeContext {
            sides,
            level,
            stack_count,
            caller_magnitudes: &state.caller_magnitudes,
            snapshot_cache,
        };
        data.modifiers()
            .iter()
            .map(|modifier| EvaluatedModifier {
                attribute: modifier.attribute.clone(),
                operation: modifier.operation,
                magnitude: modifier.magnitude.evaluate(&context) * multiplier,
                channel: modifier.channel,
                override_id: None,
            })
            .collect()
    });

    let duration = match data.duration() {
        DurationPolicy::HasDuration(scalable) => scalable.eval(level) as f64,
        _ => 0.0,
    };
    let period = data
        .periodic()
        .map(|periodic| periodic.period.eval(level) as f64)
        .unwrap_or(0.0);

    EvaluatedSnapshot {
        duration,
        period,
        modifiers,
    }
}

/// Resolves every snapshot capture once, at application time.
pub(crate) fn resolve_snapshot_cache(
    attributes: &AttributeMap,
    target_id: ActorId,
    runtime: &RuntimeEffect,
) -> HashMap<CaptureKey, f32> {
    let state = runtime.inner.borrow();
    let mut cache = HashMap::new();
    with_sides(attributes, target_id, &state.ownership, |sides| {
        for modifier in state.data.modifiers() {
            if let Some(based) = modifier.magnitude.snapshot_capture() {
                let value = sides.resolve(&based.capture, based.calculation, based.final_channel);
                cache.insert(based.capture_key(), value);
            }
        }
    });
    cache
}
