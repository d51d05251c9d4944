//! Randomized sequences of engine operations against the universal
//! invariants: bounds hold, pending changes flush to zero, stack counts stay
//! within their limits, and removing everything leaves no residue.

use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use forge::effect::{StackExpirationPolicy, StackMagnitudePolicy, StackPolicy, StackingData};
use forge::prelude::*;

const HEALTH: AttributeKey = AttributeKey::new_static("Core.Health");
const ATTACK: AttributeKey = AttributeKey::new_static("Core.Attack");

fn spawn_target(name: &str) -> Actor {
    Actor::builder(name)
        .with_set(
            AttributeSetDef::new("Core")
                .attribute(AttributeDef::new("Health", 100).range(0, 100))
                .attribute(AttributeDef::new("Attack", 10).range(0, 1000).channels(2)),
        )
        .build()
}

fn effect_pool() -> Vec<Rc<EffectData>> {
    vec![
        EffectBuilder::infinite()
            .name("sharpen")
            .modify(ATTACK, ModOp::FlatBonus, Magnitude::scalable(7.0))
            .build()
            .unwrap(),
        EffectBuilder::infinite()
            .name("sunder")
            .modify_channel(ATTACK, ModOp::PercentBonus, Magnitude::scalable(-0.5), 1)
            .build()
            .unwrap(),
        EffectBuilder::for_seconds(3.0)
            .name("haste")
            .modify(ATTACK, ModOp::Override, Magnitude::scalable(120.0))
            .build()
            .unwrap(),
        EffectBuilder::for_seconds(6.0)
            .name("regen")
            .modify(HEALTH, ModOp::FlatBonus, Magnitude::scalable(2.0))
            .periodic(PeriodicData::every_seconds(1.0))
            .build()
            .unwrap(),
        EffectBuilder::for_seconds(4.0)
            .name("venom")
            .modify(HEALTH, ModOp::FlatBonus, Magnitude::scalable(-1.0))
            .periodic(PeriodicData::every_seconds(0.5))
            .stacking(
                StackingData::new(3, StackPolicy::AggregateBySource)
                    .magnitude_policy(StackMagnitudePolicy::Sum)
                    .expiration_policy(
                        StackExpirationPolicy::RemoveSingleStackAndRefreshDuration,
                    )
                    .refresh_duration_on_application(),
            )
            .build()
            .unwrap(),
    ]
}

fn assert_invariants(target: &Actor, pool: &[Rc<EffectData>]) {
    let health = target.current_value(&HEALTH).unwrap();
    assert!((0..=100).contains(&health), "health {health} out of bounds");
    let attack = target.current_value(&ATTACK).unwrap();
    assert!((0..=1000).contains(&attack), "attack {attack} out of bounds");

    assert_eq!(target.pending_value_change(&HEALTH), Some(0));
    assert_eq!(target.pending_value_change(&ATTACK), Some(0));

    for data in pool {
        for info in target.effects().effect_info(data) {
            let limit = data
                .stacking()
                .map(|stacking| stacking.stack_limit.eval(info.level).max(1))
                .unwrap_or(1);
            assert!(
                info.stack_count >= 1 && info.stack_count <= limit,
                "stack count {} outside [1, {limit}]",
                info.stack_count
            );
        }
    }
}

#[test]
fn random_operation_sequences_hold_invariants() {
    let mut rng = StdRng::seed_from_u64(0x0F0E_6E55);

    for trial in 0..16 {
        let source = spawn_target("source");
        let target = spawn_target("target");
        let pool = effect_pool();
        let manager = target.effects();
        let mut handles: Vec<EffectHandle> = Vec::new();

        for _ in 0..150 {
            match rng.next_u32() % 6 {
                0 | 1 => {
                    let data = &pool[rng.next_u32() as usize % pool.len()];
                    let level = 1 + (rng.next_u32() % 3) as i32;
                    let effect = RuntimeEffect::new(data, level, &source);
                    if let Some(handle) = manager.apply(&effect) {
                        handles.push(handle);
                    }
                }
                2 => {
                    let dt = 0.1 + (rng.next_u32() % 20) as f64 * 0.1;
                    manager.update(dt);
                }
                3 => {
                    if !handles.is_empty() {
                        let index = rng.next_u32() as usize % handles.len();
                        let handle = handles.swap_remove(index);
                        manager.remove(&handle, true);
                    }
                }
                4 => {
                    if !handles.is_empty() {
                        let index = rng.next_u32() as usize % handles.len();
                        let handle = &handles[index];
                        handle.set_inhibit(!handle.is_inhibited());
                    }
                }
                _ => {
                    let magnitude = (rng.next_u32() % 21) as f32 - 10.0;
                    let jolt = EffectBuilder::instant()
                        .name("jolt")
                        .modify(HEALTH, ModOp::FlatBonus, Magnitude::scalable(magnitude))
                        .build()
                        .unwrap();
                    manager.apply(&RuntimeEffect::new(&jolt, 1, &source));
                }
            }
            assert_invariants(&target, &pool);
        }

        // Tearing everything down leaves no temporary contributions.
        for handle in handles {
            manager.remove(&handle, true);
        }
        manager.update(1000.0);
        manager.update(1000.0);
        assert_eq!(manager.active_count(), 0, "trial {trial} left effects");
        assert_eq!(target.attribute_modifier(&HEALTH), Some(0));
        assert_eq!(target.attribute_modifier(&ATTACK), Some(0));
        assert_eq!(
            target.current_value(&ATTACK),
            target.base_value(&ATTACK),
            "attack still carries modifiers after teardown"
        );
    }
}

#[test]
fn repeated_apply_remove_is_lossless() {
    let target = spawn_target("target");
    let buff = EffectBuilder::infinite()
        .name("layered")
        .modify(ATTACK, ModOp::FlatBonus, Magnitude::scalable(5.0))
        .modify_channel(ATTACK, ModOp::PercentBonus, Magnitude::scalable(0.25), 0)
        .modify_channel(ATTACK, ModOp::Override, Magnitude::scalable(40.0), 1)
        .build()
        .unwrap();

    let before_base = target.base_value(&ATTACK);
    let before_current = target.current_value(&ATTACK);

    for _ in 0..50 {
        let handle = target
            .effects()
            .apply(&RuntimeEffect::new(&buff, 1, &target))
            .unwrap();
        assert_eq!(target.current_value(&ATTACK), Some(40));
        target.effects().remove(&handle, false);
        assert_eq!(target.base_value(&ATTACK), before_base);
        assert_eq!(target.current_value(&ATTACK), before_current);
    }
}

#[test]
fn interleaved_stacks_from_two_sources_stay_separate() {
    let target = spawn_target("target");
    let alice = spawn_target("alice");
    let bob = spawn_target("bob");

    let venom = EffectBuilder::for_seconds(30.0)
        .name("venom")
        .modify(HEALTH, ModOp::FlatBonus, Magnitude::scalable(-2.0))
        .stacking(
            StackingData::new(5, StackPolicy::AggregateBySource)
                .magnitude_policy(StackMagnitudePolicy::Sum),
        )
        .build()
        .unwrap();

    let manager = target.effects();
    let from_alice = RuntimeEffect::new(&venom, 1, &alice);
    let from_bob = RuntimeEffect::new(&venom, 1, &bob);

    manager.apply(&from_alice).unwrap();
    manager.apply(&from_bob).unwrap();
    manager.apply(&from_alice).unwrap();

    let info = manager.effect_info(&venom);
    assert_eq!(info.len(), 2);
    assert_eq!(info[0].owner, alice.id());
    assert_eq!(info[0].stack_count, 2);
    assert_eq!(info[1].owner, bob.id());
    assert_eq!(info[1].stack_count, 1);

    // -2 * (2 + 1) stacks attached.
    assert_eq!(target.current_value(&HEALTH), Some(94));
}
