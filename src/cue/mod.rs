//! Presentation hooks.
//!
//! The engine signals cue lifecycle events with a derived magnitude; what a
//! cue looks or sounds like lives entirely in host handlers registered on
//! the [`CueManager`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::trace;

use crate::actor::{Actor, ActorId};
use crate::attribute::{AttributeKey, AttributeMap};
use crate::math::floor_to_i32;
use crate::tag::Tag;

/// Which scalar a cue reports as its magnitude.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CueMagnitude {
    EffectLevel,
    StackCount,
    /// The designated attribute's accumulated pending change, sampled before
    /// the operation's flush resets it.
    AttributeValueChange,
    AttributeBaseValue,
    AttributeCurrentValue,
    AttributeModifier,
    AttributeOverflow,
    AttributeValidModifier,
    AttributeMin,
    AttributeMax,
    AttributeMagnitudeEvaluatedUpToChannel(u8),
}

impl CueMagnitude {
    /// Whether this magnitude reads a designated attribute.
    pub fn needs_attribute(&self) -> bool {
        !matches!(self, Self::EffectLevel | Self::StackCount)
    }
}

/// One cue attached to an effect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CueData {
    pub tag: Tag,
    pub magnitude: CueMagnitude,
    /// The designated attribute for attribute-keyed magnitudes.
    pub attribute: Option<AttributeKey>,
}

impl CueData {
    pub fn new(tag: impl Into<Tag>, magnitude: CueMagnitude) -> Self {
        Self {
            tag: tag.into(),
            magnitude,
            attribute: None,
        }
    }

    pub fn attribute(mut self, key: impl Into<AttributeKey>) -> Self {
        self.attribute = Some(key.into());
        self
    }
}

/// Payload delivered with every cue dispatch.
#[derive(Clone)]
pub struct CueParameters {
    pub magnitude: i32,
    /// `magnitude` mapped into `[0, 1]` against the designated attribute's
    /// bounds; `1.0` when there is no meaningful range.
    pub normalized: f32,
    pub source: Option<ActorId>,
    pub custom: HashMap<SmolStr, Rc<dyn Any>>,
}

impl fmt::Debug for CueParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CueParameters")
            .field("magnitude", &self.magnitude)
            .field("normalized", &self.normalized)
            .field("source", &self.source)
            .field("custom", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Host-side receiver for one cue tag. All hooks default to no-ops.
pub trait CueHandler {
    fn on_apply(&self, target: &Actor, parameters: &CueParameters) {
        let _ = (target, parameters);
    }

    fn on_execute(&self, target: &Actor, parameters: &CueParameters) {
        let _ = (target, parameters);
    }

    fn on_update(&self, target: &Actor, parameters: &CueParameters) {
        let _ = (target, parameters);
    }

    fn on_remove(&self, target: &Actor, parameters: &CueParameters, interrupted: bool) {
        let _ = (target, parameters, interrupted);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CueEventKind {
    Apply,
    Execute,
    Update,
    Remove { interrupted: bool },
}

/// A queued cue dispatch; built while the engine holds its internal borrow,
/// delivered after it is released.
pub(crate) struct CueEvent {
    pub tag: Tag,
    pub kind: CueEventKind,
    pub parameters: CueParameters,
}

/// Fans cue lifecycle events out to registered handlers by tag.
#[derive(Default)]
pub struct CueManager {
    handlers: RefCell<HashMap<Tag, Vec<Rc<dyn CueHandler>>>>,
}

impl CueManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tag: impl Into<Tag>, handler: Rc<dyn CueHandler>) {
        self.handlers
            .borrow_mut()
            .entry(tag.into())
            .or_default()
            .push(handler);
    }

    pub(crate) fn dispatch(&self, event: &CueEvent, target: &Actor) {
        let handlers = {
            let map = self.handlers.borrow();
            match map.get(&event.tag) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };
        trace!(tag = %event.tag, kind = ?event.kind, "dispatching cue");
        for handler in handlers {
            match event.kind {
                CueEventKind::Apply => handler.on_apply(target, &event.parameters),
                CueEventKind::Execute => handler.on_execute(target, &event.parameters),
                CueEventKind::Update => handler.on_update(target, &event.parameters),
                CueEventKind::Remove { interrupted } => {
                    handler.on_remove(target, &event.parameters, interrupted)
                }
            }
        }
    }
}

/// Samples a cue's magnitude and normalization against current state.
pub(crate) fn sample_parameters(
    data: &CueData,
    attributes: &AttributeMap,
    level: i32,
    stack_count: i32,
    source: Option<ActorId>,
) -> CueParameters {
    let (magnitude, min, max) = match data.magnitude {
        CueMagnitude::EffectLevel => (level, 0, 0),
        CueMagnitude::StackCount => (stack_count, 0, 0),
        attribute_magnitude => {
            match data
                .attribute
                .as_ref()
                .and_then(|key| attributes.get(key))
            {
                None => (0, 0, 0),
                Some(attribute) => {
                    let value = match attribute_magnitude {
                        CueMagnitude::AttributeValueChange => attribute.pending_value_change(),
                        CueMagnitude::AttributeBaseValue => attribute.base_value(),
                        CueMagnitude::AttributeCurrentValue => attribute.current_value(),
                        CueMagnitude::AttributeModifier => attribute.modifier(),
                        CueMagnitude::AttributeOverflow => attribute.overflow(),
                        CueMagnitude::AttributeValidModifier => attribute.valid_modifier(),
                        CueMagnitude::AttributeMin => attribute.min_value(),
                        CueMagnitude::AttributeMax => attribute.max_value(),
                        CueMagnitude::AttributeMagnitudeEvaluatedUpToChannel(channel) => {
                            floor_to_i32(attribute.calculate_magnitude_up_to_channel(channel))
                        }
                        CueMagnitude::EffectLevel | CueMagnitude::StackCount => unreachable!(),
                    };
                    (value, attribute.min_value(), attribute.max_value())
                }
            }
        }
    };

    let range = max as f32 - min as f32;
    let normalized = if range <= 0.01 {
        1.0
    } else {
        ((magnitude as f32 - min as f32) / range).clamp(0.0, 1.0)
    };

    CueParameters {
        magnitude,
        normalized,
        source,
        custom: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeDef, AttributeSetDef};

    fn attributes() -> AttributeMap {
        let mut map = AttributeMap::default();
        map.install(
            &AttributeSetDef::new("Combat")
                .attribute(AttributeDef::new("Health", 75).range(0, 100)),
        );
        map
    }

    #[test]
    fn attribute_magnitudes_normalize_against_bounds() {
        let map = attributes();
        let data =
            CueData::new("cue.health", CueMagnitude::AttributeCurrentValue).attribute("Combat.Health");
        let parameters = sample_parameters(&data, &map, 1, 1, None);
        assert_eq!(parameters.magnitude, 75);
        assert_eq!(parameters.normalized, 0.75);
    }

    #[test]
    fn rangeless_magnitudes_normalize_to_one() {
        let map = attributes();
        let data = CueData::new("cue.level", CueMagnitude::EffectLevel);
        let parameters = sample_parameters(&data, &map, 4, 1, None);
        assert_eq!(parameters.magnitude, 4);
        assert_eq!(parameters.normalized, 1.0);
    }

    #[test]
    fn pending_change_is_sampled_not_flushed() {
        let mut map = attributes();
        let key = AttributeKey::new_static("Combat.Health");
        map.get_mut(&key).unwrap().execute_flat(-25);

        let data =
            CueData::new("cue.damage", CueMagnitude::AttributeValueChange).attribute("Combat.Health");
        let parameters = sample_parameters(&data, &map, 1, 1, None);
        assert_eq!(parameters.magnitude, -25);

        // Sampling leaves the pending accumulator untouched.
        assert_eq!(map.get(&key).unwrap().pending_value_change(), -25);
    }
}
