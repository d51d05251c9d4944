pub mod active;
pub mod builder;
pub mod components;
pub mod duration;
pub mod runtime;
pub mod stacking;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::attribute::AttributeKey;
use crate::cue::CueData;
use crate::magnitude::{CustomExecution, Magnitude};
use crate::tag::Tag;

pub use builder::EffectBuilder;
pub use components::{
    AbilityGrants, ChanceToApplyComponent, EffectComponent, EffectComponentDef,
    GrantAbilityComponent, ModifierTagsComponent, TargetTagRequirementsComponent,
};
pub use duration::{DurationPolicy, InhibitionRemovedPolicy, PeriodicData};
pub use runtime::{EffectOwnership, RuntimeEffect};
pub use stacking::{
    ApplicationRefreshPolicy, ApplicationResetPeriodPolicy, LevelComparison, OwnerDenialPolicy,
    OwnerOverridePolicy, StackCountOverridePolicy, StackExpirationPolicy, StackLevelPolicy,
    StackMagnitudePolicy, StackOverflowPolicy, StackPolicy, StackingData,
};

/// How a modifier combines with its target attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModOp {
    FlatBonus,
    PercentBonus,
    Override,
}

impl fmt::Display for ModOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModOp::FlatBonus => write!(f, "+"),
            ModOp::PercentBonus => write!(f, "%"),
            ModOp::Override => write!(f, "="),
        }
    }
}

/// One attribute modification within an effect.
#[derive(Clone, Debug, PartialEq)]
pub struct Modifier {
    pub attribute: AttributeKey,
    pub operation: ModOp,
    pub magnitude: Magnitude,
    pub channel: u8,
}

impl Modifier {
    pub fn new(attribute: impl Into<AttributeKey>, operation: ModOp, magnitude: Magnitude) -> Self {
        Self {
            attribute: attribute.into(),
            operation,
            magnitude,
            channel: 0,
        }
    }

    pub fn channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ch{}", self.attribute, self.operation, self.channel)
    }
}

/// A rejected effect configuration.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum EffectDefError {
    #[error("effect '{0}': instant effects cannot be periodic")]
    InstantPeriodic(SmolStr),
    #[error("effect '{0}': instant effects cannot stack")]
    InstantStacking(SmolStr),
    #[error("effect '{0}': instant effects must snapshot their level")]
    InstantLevelNotSnapshot(SmolStr),
    #[error("effect '{0}': instant effects cannot capture '{1}' without snapshotting")]
    InstantLiveCapture(SmolStr, AttributeKey),
    #[error("effect '{0}': aggregate-by-target stacking requires an owner denial policy")]
    MissingOwnerPolicies(SmolStr),
    #[error("effect '{0}': aggregate-levels stacking requires the level policy triple")]
    MissingLevelPolicies(SmolStr),
    #[error("effect '{0}': level denial and override policies overlap on {1:?}")]
    LevelPolicyOverlap(SmolStr, LevelComparison),
    #[error("effect '{0}': modifier-tags components cannot ride instant effects")]
    InstantModifierTags(SmolStr),
    #[error("effect '{0}': stack-count cue magnitude requires stacking data")]
    StackCountCueWithoutStacking(SmolStr),
    #[error("effect '{0}': stack-count cue magnitude with stacking cues suppressed")]
    StackCountCueSuppressed(SmolStr),
    #[error("effect '{0}': cue '{1}' needs a designated attribute for its magnitude")]
    CueMissingAttribute(SmolStr, Tag),
}

/// The immutable configuration of one effect.
///
/// Built through [`EffectBuilder`], which validates the cross-field
/// invariants, and shared as `Rc<EffectData>`. Equality and hashing are
/// structural so host tooling can intern configurations; trait-object fields
/// (custom executions, custom components, calculators) compare by identity.
pub struct EffectData {
    pub(crate) name: SmolStr,
    pub(crate) duration: DurationPolicy,
    pub(crate) modifiers: Vec<Modifier>,
    pub(crate) stacking: Option<StackingData>,
    pub(crate) periodic: Option<PeriodicData>,
    pub(crate) snapshot_level: bool,
    pub(crate) components: Vec<EffectComponentDef>,
    pub(crate) require_modifier_success_to_trigger_cue: bool,
    pub(crate) suppress_stacking_cues: bool,
    pub(crate) custom_executions: Vec<Rc<dyn CustomExecution>>,
    pub(crate) cues: Vec<CueData>,
}

impl EffectData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> &DurationPolicy {
        &self.duration
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    pub fn stacking(&self) -> Option<&StackingData> {
        self.stacking.as_ref()
    }

    pub fn periodic(&self) -> Option<&PeriodicData> {
        self.periodic.as_ref()
    }

    pub fn snapshot_level(&self) -> bool {
        self.snapshot_level
    }

    pub fn components(&self) -> &[EffectComponentDef] {
        &self.components
    }

    pub fn require_modifier_success_to_trigger_cue(&self) -> bool {
        self.require_modifier_success_to_trigger_cue
    }

    pub fn suppress_stacking_cues(&self) -> bool {
        self.suppress_stacking_cues
    }

    pub fn custom_executions(&self) -> &[Rc<dyn CustomExecution>] {
        &self.custom_executions
    }

    pub fn cues(&self) -> &[CueData] {
        &self.cues
    }

    pub(crate) fn validate(&self) -> Result<(), EffectDefError> {
        let name = &self.name;
        if self.duration.is_instant() {
            if self.periodic.is_some() {
                return Err(EffectDefError::InstantPeriodic(name.clone()));
            }
            if self.stacking.is_some() {
                return Err(EffectDefError::InstantStacking(name.clone()));
            }
            if !self.snapshot_level {
                return Err(EffectDefError::InstantLevelNotSnapshot(name.clone()));
            }
            for modifier in &self.modifiers {
                if let Some((capture, _)) = modifier.magnitude.live_capture() {
                    return Err(EffectDefError::InstantLiveCapture(
                        name.clone(),
                        capture.attribute.clone(),
                    ));
                }
            }
            for component in &self.components {
                if matches!(component, EffectComponentDef::ModifierTags(_)) {
                    return Err(EffectDefError::InstantModifierTags(name.clone()));
                }
            }
        }

        if let Some(stacking) = &self.stacking {
            if stacking.stack_policy == StackPolicy::AggregateByTarget
                && stacking.owner_denial_policy.is_none()
            {
                return Err(EffectDefError::MissingOwnerPolicies(name.clone()));
            }
            if stacking.stack_level_policy == StackLevelPolicy::AggregateLevels {
                let complete = stacking.level_denial_policy.is_some()
                    && stacking.level_override_policy.is_some()
                    && stacking.level_override_stack_count_policy.is_some();
                if !complete {
                    return Err(EffectDefError::MissingLevelPolicies(name.clone()));
                }
                let overlap = stacking.level_denial_policy.unwrap()
                    & stacking.level_override_policy.unwrap();
                if !overlap.is_empty() {
                    return Err(EffectDefError::LevelPolicyOverlap(name.clone(), overlap));
                }
            }
        }

        for cue in &self.cues {
            if cue.magnitude == crate::cue::CueMagnitude::StackCount {
                if self.stacking.is_none() {
                    return Err(EffectDefError::StackCountCueWithoutStacking(name.clone()));
                }
                if self.suppress_stacking_cues {
                    return Err(EffectDefError::StackCountCueSuppressed(name.clone()));
                }
            }
            if cue.magnitude.needs_attribute() && cue.attribute.is_none() {
                return Err(EffectDefError::CueMissingAttribute(
                    name.clone(),
                    cue.tag.clone(),
                ));
            }
        }

        Ok(())
    }
}

impl PartialEq for EffectData {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.duration == other.duration
            && self.modifiers == other.modifiers
            && self.stacking == other.stacking
            && self.periodic == other.periodic
            && self.snapshot_level == other.snapshot_level
            && self.components == other.components
            && self.require_modifier_success_to_trigger_cue
                == other.require_modifier_success_to_trigger_cue
            && self.suppress_stacking_cues == other.suppress_stacking_cues
            && self.custom_executions.len() == other.custom_executions.len()
            && self
                .custom_executions
                .iter()
                .zip(&other.custom_executions)
                .all(|(a, b)| Rc::ptr_eq(a, b))
            && self.cues == other.cues
    }
}

impl Hash for EffectData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        std::mem::discriminant(&self.duration).hash(state);
        self.snapshot_level.hash(state);
        self.require_modifier_success_to_trigger_cue.hash(state);
        self.suppress_stacking_cues.hash(state);
        self.stacking.is_some().hash(state);
        self.periodic.is_some().hash(state);
        for modifier in &self.modifiers {
            modifier.attribute.hash(state);
            modifier.operation.hash(state);
            modifier.channel.hash(state);
            modifier.magnitude.hash(state);
        }
        for component in &self.components {
            component.hash(state);
        }
        for execution in &self.custom_executions {
            (Rc::as_ptr(execution) as *const () as usize).hash(state);
        }
        for cue in &self.cues {
            cue.tag.hash(state);
            cue.magnitude.hash(state);
        }
    }
}

impl fmt::Debug for EffectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectData")
            .field("name", &self.name)
            .field("duration", &self.duration)
            .field("modifiers", &self.modifiers)
            .field("stacking", &self.stacking.is_some())
            .field("periodic", &self.periodic.is_some())
            .field("components", &self.components.len())
            .field("cues", &self.cues.len())
            .finish()
    }
}
