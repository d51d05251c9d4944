use std::rc::Rc;

use smol_str::SmolStr;

use crate::attribute::AttributeKey;
use crate::cue::CueData;
use crate::effect::components::EffectComponentDef;
use crate::effect::duration::{DurationPolicy, PeriodicData};
use crate::effect::stacking::StackingData;
use crate::effect::{EffectData, EffectDefError, ModOp, Modifier};
use crate::magnitude::{CustomExecution, Magnitude, ScalableFloat};

/// Fluent construction of [`EffectData`].
///
/// ```
/// # use forge::prelude::*;
/// let poison = EffectBuilder::for_seconds(10.0)
///     .name("poison")
///     .modify("Combat.Health", ModOp::FlatBonus, Magnitude::scalable(-3.0))
///     .periodic(PeriodicData::every_seconds(1.0).execute_on_application())
///     .build()
///     .unwrap();
/// ```
pub struct EffectBuilder {
    data: EffectData,
}

impl EffectBuilder {
    pub fn new(duration: DurationPolicy) -> Self {
        Self {
            data: EffectData {
                name: SmolStr::default(),
                duration,
                modifiers: Vec::new(),
                stacking: None,
                periodic: None,
                snapshot_level: true,
                components: Vec::new(),
                require_modifier_success_to_trigger_cue: false,
                suppress_stacking_cues: false,
                custom_executions: Vec::new(),
                cues: Vec::new(),
            },
        }
    }

    /// Executed once against base values, never instantiated.
    pub fn instant() -> Self {
        Self::new(DurationPolicy::Instant)
    }

    /// Lives until explicitly removed.
    pub fn infinite() -> Self {
        Self::new(DurationPolicy::Infinite)
    }

    /// Lives for a level-evaluated number of seconds.
    pub fn for_seconds(duration: impl Into<ScalableFloat>) -> Self {
        Self::new(DurationPolicy::for_seconds(duration))
    }

    pub fn name(mut self, name: impl Into<SmolStr>) -> Self {
        self.data.name = name.into();
        self
    }

    /// Adds a modifier on channel 0.
    pub fn modify(
        self,
        attribute: impl Into<AttributeKey>,
        operation: ModOp,
        magnitude: Magnitude,
    ) -> Self {
        self.modifier(Modifier::new(attribute, operation, magnitude))
    }

    pub fn modify_channel(
        self,
        attribute: impl Into<AttributeKey>,
        operation: ModOp,
        magnitude: Magnitude,
        channel: u8,
    ) -> Self {
        self.modifier(Modifier::new(attribute, operation, magnitude).channel(channel))
    }

    pub fn modifier(mut self, modifier: Modifier) -> Self {
        self.data.modifiers.push(modifier);
        self
    }

    pub fn periodic(mut self, periodic: PeriodicData) -> Self {
        self.data.periodic = Some(periodic);
        self
    }

    pub fn stacking(mut self, stacking: StackingData) -> Self {
        self.data.stacking = Some(stacking);
        self
    }

    /// Whether the effect freezes its level at application. Defaults to
    /// true; a false setting makes active applications track the runtime
    /// effect's level changes.
    pub fn snapshot_level(mut self, snapshot: bool) -> Self {
        self.data.snapshot_level = snapshot;
        self
    }

    pub fn component(mut self, component: EffectComponentDef) -> Self {
        self.data.components.push(component);
        self
    }

    /// Gate cues on at least one attribute actually changing.
    pub fn require_modifier_success_for_cues(mut self) -> Self {
        self.data.require_modifier_success_to_trigger_cue = true;
        self
    }

    pub fn suppress_stacking_cues(mut self) -> Self {
        self.data.suppress_stacking_cues = true;
        self
    }

    pub fn custom_execution(mut self, execution: Rc<dyn CustomExecution>) -> Self {
        self.data.custom_executions.push(execution);
        self
    }

    pub fn cue(mut self, cue: CueData) -> Self {
        self.data.cues.push(cue);
        self
    }

    /// Validates the cross-field invariants and freezes the configuration.
    pub fn build(self) -> Result<Rc<EffectData>, EffectDefError> {
        self.data.validate()?;
        Ok(Rc::new(self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cue::CueMagnitude;
    use crate::effect::components::ModifierTagsComponent;
    use crate::effect::stacking::{StackPolicy, StackingData};
    use crate::magnitude::{AttributeBasedMagnitude, AttributeCalculation, AttributeCapture};
    use crate::tag::Tag;

    #[test]
    fn instant_rejects_periodic_and_stacking() {
        let err = EffectBuilder::instant()
            .name("bad")
            .periodic(PeriodicData::every_seconds(1.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::InstantPeriodic(_)));

        let err = EffectBuilder::instant()
            .name("bad")
            .stacking(StackingData::new(3, StackPolicy::AggregateBySource))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::InstantStacking(_)));
    }

    #[test]
    fn instant_rejects_live_captures() {
        let err = EffectBuilder::instant()
            .name("bad")
            .modify(
                "Combat.Health",
                ModOp::FlatBonus,
                Magnitude::AttributeBased(AttributeBasedMagnitude::new(
                    AttributeCapture::source("Combat.Strength"),
                    AttributeCalculation::CurrentValue,
                )),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::InstantLiveCapture(_, _)));

        // The snapshot variant is fine.
        EffectBuilder::instant()
            .name("good")
            .modify(
                "Combat.Health",
                ModOp::FlatBonus,
                Magnitude::AttributeBased(AttributeBasedMagnitude::new(
                    AttributeCapture::source("Combat.Strength").snapshot(),
                    AttributeCalculation::CurrentValue,
                )),
            )
            .build()
            .unwrap();
    }

    #[test]
    fn instant_rejects_modifier_tags() {
        let err = EffectBuilder::instant()
            .name("bad")
            .component(EffectComponentDef::ModifierTags(ModifierTagsComponent::new(
                [Tag::new_static("status.burning")],
            )))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::InstantModifierTags(_)));
    }

    #[test]
    fn aggregate_by_target_requires_owner_policies() {
        let err = EffectBuilder::infinite()
            .name("bad")
            .stacking(StackingData::new(3, StackPolicy::AggregateByTarget))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::MissingOwnerPolicies(_)));
    }

    #[test]
    fn overlapping_level_gates_are_rejected() {
        use crate::effect::stacking::{LevelComparison, StackCountOverridePolicy};

        let err = EffectBuilder::infinite()
            .name("bad")
            .stacking(
                StackingData::new(3, StackPolicy::AggregateBySource).level_policies(
                    LevelComparison::HIGHER,
                    LevelComparison::HIGHER | LevelComparison::EQUAL,
                    StackCountOverridePolicy::ResetStacks,
                ),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::LevelPolicyOverlap(_, _)));
    }

    #[test]
    fn stack_count_cue_needs_visible_stacking() {
        let err = EffectBuilder::infinite()
            .name("bad")
            .cue(CueData::new("cue.stacks", CueMagnitude::StackCount))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::StackCountCueWithoutStacking(_)));

        let err = EffectBuilder::infinite()
            .name("bad")
            .stacking(StackingData::new(3, StackPolicy::AggregateBySource))
            .suppress_stacking_cues()
            .cue(CueData::new("cue.stacks", CueMagnitude::StackCount))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::StackCountCueSuppressed(_)));
    }

    #[test]
    fn attribute_cue_magnitudes_need_an_attribute() {
        let err = EffectBuilder::infinite()
            .name("bad")
            .cue(CueData::new("cue.value", CueMagnitude::AttributeCurrentValue))
            .build()
            .unwrap_err();
        assert!(matches!(err, EffectDefError::CueMissingAttribute(_, _)));
    }
}
