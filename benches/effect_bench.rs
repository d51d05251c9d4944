use std::hint::black_box;
use std::rc::Rc;

use criterion::{Criterion, criterion_group, criterion_main};

use forge::effect::{StackMagnitudePolicy, StackPolicy, StackingData};
use forge::prelude::*;

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

const HEALTH: AttributeKey = AttributeKey::new_static("Core.Health");
const ATTACK: AttributeKey = AttributeKey::new_static("Core.Attack");

fn spawn_actor() -> Actor {
    Actor::builder("bench")
        .with_set(
            AttributeSetDef::new("Core")
                .attribute(AttributeDef::new("Health", 1_000_000).range(0, 1_000_000))
                .attribute(AttributeDef::new("Attack", 100).range(0, 100_000).channels(2)),
        )
        .build()
}

fn instant_effect() -> Rc<EffectData> {
    EffectBuilder::instant()
        .name("bench strike")
        .modify(HEALTH, ModOp::FlatBonus, Magnitude::scalable(-1.0))
        .build()
        .unwrap()
}

fn periodic_effect() -> Rc<EffectData> {
    EffectBuilder::for_seconds(1_000_000.0)
        .name("bench dot")
        .modify(HEALTH, ModOp::FlatBonus, Magnitude::scalable(-1.0))
        .periodic(PeriodicData::every_seconds(0.1))
        .build()
        .unwrap()
}

fn stacking_effect() -> Rc<EffectData> {
    EffectBuilder::for_seconds(1_000_000.0)
        .name("bench stacks")
        .modify(ATTACK, ModOp::FlatBonus, Magnitude::scalable(1.0))
        .stacking(
            StackingData::new(100, StackPolicy::AggregateBySource)
                .magnitude_policy(StackMagnitudePolicy::Sum),
        )
        .build()
        .unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("instant apply", |b| {
        let actor = spawn_actor();
        let effect = RuntimeEffect::new(&instant_effect(), 1, &actor);
        let manager = actor.effects();
        b.iter(|| manager.apply(black_box(&effect)));
    });

    c.bench_function("apply and remove buff", |b| {
        let actor = spawn_actor();
        let buff = EffectBuilder::infinite()
            .name("bench buff")
            .modify(ATTACK, ModOp::FlatBonus, Magnitude::scalable(5.0))
            .modify_channel(ATTACK, ModOp::PercentBonus, Magnitude::scalable(0.1), 1)
            .build()
            .unwrap();
        let effect = RuntimeEffect::new(&buff, 1, &actor);
        let manager = actor.effects();
        b.iter(|| {
            let handle = manager.apply(&effect).unwrap();
            manager.remove(&handle, false);
        });
    });

    c.bench_function("stack merge", |b| {
        let actor = spawn_actor();
        let effect = RuntimeEffect::new(&stacking_effect(), 1, &actor);
        let manager = actor.effects();
        manager.apply(&effect).unwrap();
        b.iter(|| manager.apply(black_box(&effect)));
    });

    c.bench_function("update 100 periodic effects", |b| {
        let actor = spawn_actor();
        let manager = actor.effects();
        let data = periodic_effect();
        for _ in 0..100 {
            manager.apply(&RuntimeEffect::new(&data, 1, &actor)).unwrap();
        }
        b.iter(|| manager.update(black_box(0.1)));
    });
}
