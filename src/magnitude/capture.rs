use std::cell::Ref;

use serde::{Deserialize, Serialize};

use crate::actor::ActorInner;
use crate::attribute::{AttributeKey, AttributeMap};

/// Which side of an application a capture reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Who {
    Source,
    Target,
}

/// Which scalar an attribute capture extracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeCalculation {
    CurrentValue,
    BaseValue,
    Modifier,
    Overflow,
    ValidModifier,
    Min,
    Max,
    /// Partial channel evaluation; the channel bound comes from the
    /// magnitude's `final_channel` (all channels when unset).
    MagnitudeEvaluatedUpToChannel,
}

/// Declares an attribute to capture from the source or target actor.
///
/// `snapshot` captures resolve once at application and are served from the
/// active effect's cache afterwards; live captures re-read the attribute and
/// keep a change subscription on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeCapture {
    pub attribute: AttributeKey,
    pub who: Who,
    pub snapshot: bool,
}

impl AttributeCapture {
    pub fn source(attribute: impl Into<AttributeKey>) -> Self {
        Self {
            attribute: attribute.into(),
            who: Who::Source,
            snapshot: false,
        }
    }

    pub fn target(attribute: impl Into<AttributeKey>) -> Self {
        Self {
            attribute: attribute.into(),
            who: Who::Target,
            snapshot: false,
        }
    }

    pub fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }
}

/// Identifies one captured scalar in an active effect's snapshot cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CaptureKey {
    pub attribute: AttributeKey,
    pub who: Who,
    pub calculation: AttributeCalculation,
    pub final_channel: Option<u8>,
}

/// Read access to the source side of an evaluation.
///
/// The target's map is always borrowed by the running operation; the source
/// is the same map, a short borrow of another actor, or gone entirely (the
/// source actor was dropped), in which case captures read as missing.
pub(crate) enum SourceAttributes<'a> {
    SameAsTarget,
    Borrowed(Ref<'a, ActorInner>),
    Gone,
}

/// The attribute maps visible to one magnitude evaluation.
pub(crate) struct EvalSides<'a> {
    pub target: &'a AttributeMap,
    pub source: SourceAttributes<'a>,
}

impl<'a> EvalSides<'a> {
    pub fn new(target: &'a AttributeMap, source: SourceAttributes<'a>) -> Self {
        Self { target, source }
    }

    pub fn attributes(&self, who: Who) -> Option<&AttributeMap> {
        match who {
            Who::Target => Some(self.target),
            Who::Source => match &self.source {
                SourceAttributes::SameAsTarget => Some(self.target),
                SourceAttributes::Borrowed(inner) => Some(&inner.attributes),
                SourceAttributes::Gone => None,
            },
        }
    }

    /// Resolves a capture against the live attribute state. Missing
    /// attributes (or a missing side) yield zero.
    pub fn resolve(
        &self,
        capture: &AttributeCapture,
        calculation: AttributeCalculation,
        final_channel: Option<u8>,
    ) -> f32 {
        let Some(attribute) = self
            .attributes(capture.who)
            .and_then(|map| map.get(&capture.attribute))
        else {
            return 0.0;
        };
        match calculation {
            AttributeCalculation::CurrentValue => attribute.current_value() as f32,
            AttributeCalculation::BaseValue => attribute.base_value() as f32,
            AttributeCalculation::Modifier => attribute.modifier() as f32,
            AttributeCalculation::Overflow => attribute.overflow() as f32,
            AttributeCalculation::ValidModifier => attribute.valid_modifier() as f32,
            AttributeCalculation::Min => attribute.min_value() as f32,
            AttributeCalculation::Max => attribute.max_value() as f32,
            AttributeCalculation::MagnitudeEvaluatedUpToChannel => {
                let channel = final_channel.unwrap_or(attribute.channel_count() as u8);
                attribute.calculate_magnitude_up_to_channel(channel)
            }
        }
    }
}
