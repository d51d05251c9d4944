//! Definition types are plain data and round-trip through serde for host
//! tooling; runtime-injected trait objects (calculators, handlers, custom
//! components) are deliberately outside the serialized surface.

use forge::effect::{
    DurationPolicy, LevelComparison, PeriodicData, StackCountOverridePolicy, StackPolicy,
    StackingData, TargetTagRequirementsComponent,
};
use forge::prelude::*;

#[test]
fn attribute_sets_round_trip() {
    let set = AttributeSetDef::new("Combat")
        .attribute(AttributeDef::new("Health", 100).range(0, 100))
        .attribute(AttributeDef::new("Attack", 10).range(0, 1000).channels(2));

    let json = serde_json::to_string(&set).unwrap();
    let back: AttributeSetDef = serde_json::from_str(&json).unwrap();
    assert_eq!(set, back);
}

#[test]
fn stacking_data_round_trips_with_level_gates() {
    let stacking = StackingData::new(5, StackPolicy::AggregateByTarget)
        .initial_stack(2)
        .level_policies(
            LevelComparison::LOWER,
            LevelComparison::HIGHER | LevelComparison::EQUAL,
            StackCountOverridePolicy::ResetStacks,
        )
        .refresh_duration_on_application();

    let json = serde_json::to_string(&stacking).unwrap();
    let back: StackingData = serde_json::from_str(&json).unwrap();
    assert_eq!(stacking, back);
}

#[test]
fn duration_and_periodic_round_trip() {
    let duration = DurationPolicy::for_seconds(ScalableFloat::with_curve(
        12.0,
        Curve::new(vec![(1.0, 1.0), (10.0, 2.5)]),
    ));
    let json = serde_json::to_string(&duration).unwrap();
    assert_eq!(duration, serde_json::from_str::<DurationPolicy>(&json).unwrap());

    let periodic = PeriodicData::every_seconds(0.5)
        .execute_on_application()
        .on_inhibition_removed(InhibitionRemovedPolicy::ExecuteAndResetPeriod);
    let json = serde_json::to_string(&periodic).unwrap();
    assert_eq!(periodic, serde_json::from_str::<PeriodicData>(&json).unwrap());
}

#[test]
fn tag_requirement_components_round_trip() {
    let component = TargetTagRequirementsComponent::application(TagRequirements::require([
        Tag::new_static("class.mage"),
    ]))
    .removal(TagRequirements::require([Tag::new_static("status.cleansed")]))
    .ongoing(
        TagRequirements::require([Tag::new_static("stance.casting")])
            .and_ignore([Tag::new_static("status.silenced")]),
    );

    let json = serde_json::to_string(&component).unwrap();
    let back: TargetTagRequirementsComponent = serde_json::from_str(&json).unwrap();
    assert_eq!(component, back);
}

#[test]
fn cue_data_round_trips() {
    let cue = CueData::new(
        "cue.burning",
        CueMagnitude::AttributeMagnitudeEvaluatedUpToChannel(1),
    )
    .attribute("Combat.Health");

    let json = serde_json::to_string(&cue).unwrap();
    let back: CueData = serde_json::from_str(&json).unwrap();
    assert_eq!(cue, back);
}

#[test]
fn interned_data_makes_peer_matching_structural() {
    // Two separately-built but identical configurations compare equal, so a
    // host that fails to intern still gets correct stack merging.
    let build = || {
        EffectBuilder::for_seconds(10.0)
            .name("venom")
            .modify("Combat.Health", ModOp::FlatBonus, Magnitude::scalable(-2.0))
            .stacking(StackingData::new(3, StackPolicy::AggregateBySource))
            .build()
            .unwrap()
    };
    let first = build();
    let second = build();
    assert_eq!(*first, *second);

    let target = Actor::builder("target")
        .with_set(
            AttributeSetDef::new("Combat")
                .attribute(AttributeDef::new("Health", 100).range(0, 100)),
        )
        .build();
    let manager = target.effects();
    let handle = manager
        .apply(&RuntimeEffect::new(&first, 1, &target))
        .unwrap();
    manager
        .apply(&RuntimeEffect::new(&second, 1, &target))
        .unwrap();
    assert_eq!(handle.stack_count(), Some(2));
    assert_eq!(manager.active_count(), 1);
}
