//! The per-actor effects coordinator.
//!
//! Every public entry point runs as one *operation*: the actor is borrowed,
//! the requested mutation is performed, the settle loop drives re-evaluation
//! and attribute flushing to a fixpoint, and only after the borrow is
//! released are host callbacks (components, cue handlers, observers,
//! cross-actor re-evaluations) delivered. Callbacks may therefore call
//! straight back into the engine.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use slotmap::SlotMap;
use smol_str::SmolStr;
use tracing::{debug, error, trace, warn};

use crate::actor::{Actor, ActorId, ActorInner};
use crate::attribute::{AttributeKey, AttributeMap};
use crate::cue::{self, CueEvent, CueEventKind};
use crate::effect::active::{ActiveEffect, evaluate_effect, resolve_snapshot_cache};
use crate::effect::runtime::RuntimeEffect;
use crate::effect::{
    ApplicationRefreshPolicy, ApplicationResetPeriodPolicy, EffectComponent, EffectComponentDef,
    EffectData, InhibitionRemovedPolicy, LevelComparison, ModOp, OwnerDenialPolicy,
    OwnerOverridePolicy, StackCountOverridePolicy, StackExpirationPolicy, StackLevelPolicy,
    StackMagnitudePolicy, StackOverflowPolicy, StackPolicy,
};
use crate::magnitude::{
    CalculationContext, ExecutionContext, MagnitudeContext, RequestedMutation, Who,
};
use crate::math::{TIME_EPSILON, floor_to_i32};
use crate::subscription::{ActiveEffectKey, EffectSubscriber, SubscriptionToken};
use crate::tag::Tag;

/// Upper bound on settle rounds within one operation; hitting it means the
/// host configured a divergent re-evaluation cycle.
const MAX_SETTLE_ROUNDS: usize = 64;

/// The active effects owned by one actor.
#[derive(Default)]
pub(crate) struct EffectsState {
    pub active: SlotMap<ActiveEffectKey, ActiveEffect>,
    /// Insertion order; the update sweep and peer search follow it.
    pub order: Vec<ActiveEffectKey>,
    /// Effects whose evaluation inputs changed during the current operation.
    pub dirty: Vec<ActiveEffectKey>,
    pub pending_removals: Vec<(ActiveEffectKey, bool)>,
}

/// Work queued while the actor borrow is held, delivered afterwards.
#[derive(Default)]
struct OpQueue {
    value_events: Vec<(Rc<dyn Fn(i32)>, i32)>,
    cross: Vec<(Weak<RefCell<ActorInner>>, ActiveEffectKey)>,
    abilities: Vec<(SmolStr, bool)>,
    components: Vec<ComponentEvent>,
    cues: Vec<CueEvent>,
}

enum ComponentEvent {
    Applied {
        component: Rc<dyn EffectComponent>,
        effect: RuntimeEffect,
    },
    Executed {
        component: Rc<dyn EffectComponent>,
        effect: RuntimeEffect,
    },
    PostAdded {
        component: Rc<dyn EffectComponent>,
        handle: EffectHandle,
    },
    Unapplied {
        component: Rc<dyn EffectComponent>,
        handle: EffectHandle,
        removed: bool,
    },
    Changed {
        component: Rc<dyn EffectComponent>,
        handle: EffectHandle,
    },
}

/// A reference to one application of an effect on one actor.
///
/// Handles stay valid across stack changes and inhibition flips and turn
/// inert once the application is removed; every operation on a dead handle
/// is a no-op and every query returns `None`.
#[derive(Clone)]
pub struct EffectHandle {
    pub(crate) actor: Weak<RefCell<ActorInner>>,
    pub(crate) key: ActiveEffectKey,
}

impl EffectHandle {
    fn read<R>(&self, f: impl FnOnce(&ActiveEffect) -> R) -> Option<R> {
        let rc = self.actor.upgrade()?;
        let inner = rc.borrow();
        inner.effects.active.get(self.key).map(f)
    }

    pub fn is_active(&self) -> bool {
        self.read(|_| ()).is_some()
    }

    pub fn stack_count(&self) -> Option<i32> {
        self.read(|effect| effect.stack_count)
    }

    pub fn level(&self) -> Option<i32> {
        self.read(|effect| effect.level)
    }

    pub fn remaining_duration(&self) -> Option<f64> {
        self.read(|effect| effect.has_duration().then_some(effect.remaining_duration))
            .flatten()
    }

    /// Seconds until the next periodic execution.
    pub fn next_periodic_tick(&self) -> Option<f64> {
        self.read(|effect| {
            effect
                .is_periodic()
                .then(|| effect.next_periodic_tick - effect.internal_time)
        })
        .flatten()
    }

    pub fn execution_count(&self) -> Option<u64> {
        self.read(|effect| effect.execution_count)
    }

    pub fn is_inhibited(&self) -> bool {
        self.read(|effect| effect.inhibited).unwrap_or(false)
    }

    /// Latches or clears inhibition: contributions detach while inhibited
    /// and periodic clocks pause, without losing the application.
    pub fn set_inhibit(&self, inhibited: bool) {
        let Some(rc) = self.actor.upgrade() else {
            return;
        };
        let actor = Actor::from_inner(rc);
        let key = self.key;
        run_op(&actor, |inner, queue| {
            set_inhibited_internal(inner, key, inhibited, queue);
        });
    }
}

impl PartialEq for EffectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.actor.ptr_eq(&other.actor)
    }
}

impl fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectHandle").field("key", &self.key).finish()
    }
}

/// One row of [`EffectsManager::effect_info`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EffectInfo {
    pub owner: ActorId,
    pub level: i32,
    pub stack_count: i32,
}

enum MergeOutcome {
    NoPeer,
    Denied,
    Merged(ActiveEffectKey),
}

/// Admission control, stack merging, tick dispatch, removal and queries for
/// one actor's effects.
#[derive(Clone)]
pub struct EffectsManager {
    actor: Actor,
}

impl EffectsManager {
    pub(crate) fn for_actor(actor: Actor) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Applies a runtime effect to this actor.
    ///
    /// Instant effects execute against base values and return `None`;
    /// everything else returns a handle to the (possibly merged) active
    /// application, or `None` when admission rejected it.
    pub fn apply(&self, effect: &RuntimeEffect) -> Option<EffectHandle> {
        let data = effect.data();
        if !self.admit(&data, effect) {
            return None;
        }

        if data.duration().is_instant() {
            debug!(effect = %data.name(), target = %self.actor.id(), "executing instant effect");
            run_op(&self.actor, |inner, queue| {
                execute_instant(inner, effect, queue);
            });
            return None;
        }

        if data.stacking().is_some() {
            let outcome = run_op(&self.actor, |inner, queue| {
                try_stack_merge(inner, effect, queue)
            });
            match outcome {
                MergeOutcome::Denied => return None,
                MergeOutcome::Merged(key) => {
                    return Some(EffectHandle {
                        actor: self.actor.downgrade(),
                        key,
                    });
                }
                MergeOutcome::NoPeer => {}
            }
        }

        debug!(effect = %data.name(), target = %self.actor.id(), "applying effect");
        let key = run_op(&self.actor, |inner, _| create_active(inner, effect));
        let handle = EffectHandle {
            actor: self.actor.downgrade(),
            key,
        };

        // Components may demand inhibition before anything attaches.
        let mut inhibited = false;
        for component in data.components() {
            match component {
                EffectComponentDef::TargetTagRequirements(requirements)
                    if !requirements.ongoing.is_empty() =>
                {
                    if !requirements
                        .ongoing
                        .requirements_met(&self.actor.inner.borrow().tags)
                    {
                        inhibited = true;
                    }
                }
                EffectComponentDef::Custom(custom) => {
                    if !custom.on_active_effect_added(&self.actor, &handle) {
                        inhibited = true;
                    }
                }
                _ => {}
            }
        }

        run_op(&self.actor, |inner, queue| {
            finish_apply(inner, key, inhibited, queue);
        });
        Some(handle)
    }

    /// Removes an active effect. `interrupted` is forwarded to the `Remove`
    /// cue; removing an already-removed handle is a no-op.
    pub fn remove(&self, handle: &EffectHandle, interrupted: bool) {
        debug_assert!(
            handle.actor.ptr_eq(&Rc::downgrade(&self.actor.inner)),
            "handle belongs to a different manager"
        );
        let key = handle.key;
        run_op(&self.actor, |inner, _| {
            mark_removal(inner, key, interrupted);
        });
    }

    /// Removes the first active effect built from `data`.
    pub fn unapply_by_data(&self, data: &Rc<EffectData>) {
        run_op(&self.actor, |inner, _| {
            let found = inner.effects.order.iter().copied().find(|key| {
                inner
                    .effects
                    .active
                    .get(*key)
                    .is_some_and(|effect| same_data(&effect.data, data))
            });
            if let Some(key) = found {
                mark_removal(inner, key, false);
            }
        });
    }

    /// Advances every active effect by `dt` seconds, in insertion order.
    /// Effects applied during the sweep are not ticked until the next call.
    pub fn update(&self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        run_op(&self.actor, |inner, queue| {
            let snapshot = inner.effects.order.clone();
            for key in snapshot {
                tick_effect(inner, key, dt, queue);
            }
        });
    }

    /// Ownership, level and stack count of every active application of
    /// `data`, in insertion order.
    pub fn effect_info(&self, data: &Rc<EffectData>) -> Vec<EffectInfo> {
        let inner = self.actor.inner.borrow();
        inner
            .effects
            .order
            .iter()
            .filter_map(|key| inner.effects.active.get(*key))
            .filter(|effect| same_data(&effect.data, data))
            .map(|effect| EffectInfo {
                owner: effect.runtime.owner_id(),
                level: effect.level,
                stack_count: effect.stack_count,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.actor.inner.borrow().effects.order.len()
    }

    fn admit(&self, data: &Rc<EffectData>, effect: &RuntimeEffect) -> bool {
        for component in data.components() {
            let admitted = match component {
                EffectComponentDef::ChanceToApply(chance) => {
                    roll_chance(&self.actor, chance.chance.eval(effect.level()))
                }
                EffectComponentDef::TargetTagRequirements(requirements) => {
                    requirements.application.is_empty()
                        || requirements
                            .application
                            .requirements_met(&self.actor.inner.borrow().tags)
                }
                EffectComponentDef::Custom(custom) => custom.can_apply(&self.actor, effect),
                _ => true,
            };
            if !admitted {
                debug!(effect = %data.name(), target = %self.actor.id(), "application rejected");
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for EffectsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectsManager")
            .field("actor", &self.actor)
            .field("active", &self.active_count())
            .finish()
    }
}

fn same_data(a: &Rc<EffectData>, b: &Rc<EffectData>) -> bool {
    Rc::ptr_eq(a, b) || **a == **b
}

fn roll_chance(actor: &Actor, chance: f32) -> bool {
    if chance >= 1.0 {
        return true;
    }
    if chance <= 0.0 {
        return false;
    }
    let mut guard = actor.inner.borrow_mut();
    let inner = &mut *guard;
    match inner.rng.as_mut() {
        Some(rng) => (rng.next_u32() as f64 / (u32::MAX as f64 + 1.0)) < chance as f64,
        None => {
            warn!(actor = %inner.name, "no rng injected, chance roll passes");
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Operation driver
// ---------------------------------------------------------------------------

fn run_op<R>(actor: &Actor, f: impl FnOnce(&mut ActorInner, &mut OpQueue) -> R) -> R {
    let mut queue = OpQueue::default();
    let result = {
        let mut inner = actor.inner.borrow_mut();
        let result = f(&mut inner, &mut queue);
        settle(&mut inner, &mut queue);
        result
    };
    drain(actor, queue);
    result
}

/// Drives re-evaluation and flushing to a fixpoint within one operation.
fn settle(inner: &mut ActorInner, queue: &mut OpQueue) {
    for _ in 0..MAX_SETTLE_ROUNDS {
        let mut progressed = false;

        if inner.tags.take_changed() {
            check_tag_reactions(inner, queue);
            progressed = true;
        }

        let dirty = std::mem::take(&mut inner.effects.dirty);
        if !dirty.is_empty() {
            progressed = true;
            for key in dirty {
                reevaluate(inner, key, queue);
            }
        }

        if !inner.effects.pending_removals.is_empty() {
            process_removals(inner, queue);
            progressed = true;
        }

        if flush_attributes(inner, queue) {
            progressed = true;
        }

        let outstanding = !inner.effects.dirty.is_empty()
            || !inner.effects.pending_removals.is_empty()
            || inner.tags.changed;
        if !progressed && !outstanding {
            return;
        }
    }
    error!(
        actor = %inner.name,
        "effects did not settle, aborting the re-evaluation loop"
    );
}

fn drain(actor: &Actor, queue: OpQueue) {
    for (observer, delta) in queue.value_events {
        observer(delta);
    }
    for (weak, key) in queue.cross {
        if let Some(rc) = weak.upgrade() {
            attribute_changed_external(rc, key);
        }
    }
    if !queue.abilities.is_empty() {
        let grants = actor.inner.borrow().abilities.clone();
        match grants {
            Some(grants) => {
                for (ability, grant) in queue.abilities {
                    if grant {
                        grants.grant(actor, &ability);
                    } else {
                        grants.revoke(actor, &ability);
                    }
                }
            }
            None => warn!(
                actor = %actor.id(),
                "effect grants an ability but no collaborator is injected"
            ),
        }
    }
    for event in queue.components {
        match event {
            ComponentEvent::Applied { component, effect } => {
                component.on_effect_applied(actor, &effect)
            }
            ComponentEvent::Executed { component, effect } => {
                component.on_effect_executed(actor, &effect)
            }
            ComponentEvent::PostAdded { component, handle } => {
                component.on_post_active_effect_added(actor, &handle)
            }
            ComponentEvent::Unapplied {
                component,
                handle,
                removed,
            } => component.on_active_effect_unapplied(actor, &handle, removed),
            ComponentEvent::Changed { component, handle } => {
                component.on_active_effect_changed(actor, &handle)
            }
        }
    }
    if !queue.cues.is_empty() {
        let cues = actor.inner.borrow().cues.clone();
        if let Some(cues) = cues {
            for event in queue.cues {
                cues.dispatch(&event, actor);
            }
        }
    }
}

/// Takes every pending attribute delta, notifying subscribers and queueing
/// host observers. Returns whether anything was flushed.
fn flush_attributes(inner: &mut ActorInner, queue: &mut OpQueue) -> bool {
    let keys: Vec<AttributeKey> = inner.attributes.keys().to_vec();
    let mut flushed = false;
    for key in keys {
        let (delta, subscribers) = match inner.attributes.get_mut(&key) {
            Some(attribute) => {
                let delta = attribute.take_pending();
                if delta == 0 {
                    continue;
                }
                let subscribers: Vec<EffectSubscriber> =
                    attribute.subscribers.values().cloned().collect();
                (delta, subscribers)
            }
            None => continue,
        };
        flushed = true;
        trace!(attribute = %key, delta, "value changed");
        for subscriber in subscribers {
            if subscriber.actor.ptr_eq(&inner.self_weak) {
                mark_dirty(inner, subscriber.effect);
            } else {
                queue.cross.push((subscriber.actor, subscriber.effect));
            }
        }
        for (observed, observer) in &inner.value_observers {
            if *observed == key {
                queue.value_events.push((observer.clone(), delta));
            }
        }
    }
    flushed
}

fn mark_dirty(inner: &mut ActorInner, key: ActiveEffectKey) {
    if !inner.effects.dirty.contains(&key) {
        inner.effects.dirty.push(key);
    }
}

fn mark_removal(inner: &mut ActorInner, key: ActiveEffectKey, interrupted: bool) {
    if !inner.effects.active.contains_key(key) {
        return;
    }
    if !inner
        .effects
        .pending_removals
        .iter()
        .any(|(pending, _)| *pending == key)
    {
        inner.effects.pending_removals.push((key, interrupted));
    }
}

// ---------------------------------------------------------------------------
// External entry points (cross-actor and host-driven notifications)
// ---------------------------------------------------------------------------

/// A backing attribute on some actor changed; re-evaluate the dependent
/// effect on this one.
pub(crate) fn attribute_changed_external(rc: Rc<RefCell<ActorInner>>, key: ActiveEffectKey) {
    let actor = Actor::from_inner(rc);
    run_op(&actor, |inner, _| mark_dirty(inner, key));
}

/// A runtime effect's level changed; adopt it and re-evaluate.
pub(crate) fn level_changed_external(
    rc: Rc<RefCell<ActorInner>>,
    key: ActiveEffectKey,
    level: i32,
) {
    let actor = Actor::from_inner(rc);
    run_op(&actor, |inner, queue| {
        let adopted = match inner.effects.active.get_mut(key) {
            Some(effect) if !effect.data.snapshot_level() => {
                effect.level = level;
                true
            }
            _ => false,
        };
        if adopted {
            mark_dirty(inner, key);
            queue_changed_components(inner, key, queue);
        }
    });
}

pub(crate) fn host_tag_change(actor: &Actor, tag: Tag, add: bool) {
    run_op(actor, |inner, _| {
        if add {
            inner.tags.add(tag.clone());
        } else {
            inner.tags.remove(&tag);
        }
    });
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

fn create_active(inner: &mut ActorInner, runtime: &RuntimeEffect) -> ActiveEffectKey {
    let data = runtime.data();
    let level = runtime.level();
    let stack_count = data
        .stacking()
        .map(|stacking| stacking.initial_stack.eval(level).max(1))
        .unwrap_or(1);

    let snapshot_cache = resolve_snapshot_cache(&inner.attributes, inner.id, runtime);
    let evaluated = evaluate_effect(
        &inner.attributes,
        inner.id,
        runtime,
        level,
        stack_count,
        Some(&snapshot_cache),
    );

    let effect = ActiveEffect {
        runtime: runtime.clone(),
        data,
        level,
        stack_count,
        remaining_duration: evaluated.duration,
        internal_time: 0.0,
        next_periodic_tick: evaluated.period,
        execution_count: 0,
        inhibited: false,
        attached: false,
        tags_granted: false,
        snapshot_cache,
        subscriptions: Vec::new(),
        evaluated,
    };
    let key = inner.effects.active.insert(effect);
    inner.effects.order.push(key);
    wire_subscriptions(inner, key);
    key
}

/// Installs an application's change subscriptions: level (unless
/// snapshotted), one per live attribute capture, and the tag container when
/// a requirements component reacts to tag changes.
fn wire_subscriptions(inner: &mut ActorInner, key: ActiveEffectKey) {
    let (runtime, data) = match inner.effects.active.get(key) {
        Some(effect) => (effect.runtime.clone(), Rc::clone(&effect.data)),
        None => return,
    };
    let subscriber = EffectSubscriber {
        actor: inner.self_weak.clone(),
        effect: key,
    };
    let mut tokens = Vec::new();

    if !data.snapshot_level() {
        let sub_key = runtime.subscribe_level(subscriber.clone());
        tokens.push(SubscriptionToken::Level {
            runtime: runtime.downgrade(),
            key: sub_key,
        });
    }

    let ownership = runtime.ownership();
    for modifier in data.modifiers() {
        let Some((capture, _)) = modifier.magnitude.live_capture() else {
            continue;
        };
        let local = capture.who == Who::Target || ownership.source_id == inner.id;
        if local {
            if let Some(attribute) = inner.attributes.get_mut(&capture.attribute) {
                let sub_key = attribute.subscribe(subscriber.clone());
                tokens.push(SubscriptionToken::AttributeValue {
                    actor: inner.self_weak.clone(),
                    attribute: capture.attribute.clone(),
                    key: sub_key,
                });
            }
        } else if let Some(source_rc) = ownership.source.upgrade() {
            let mut source = source_rc.borrow_mut();
            if let Some(attribute) = source.attributes.get_mut(&capture.attribute) {
                let sub_key = attribute.subscribe(subscriber.clone());
                tokens.push(SubscriptionToken::AttributeValue {
                    actor: Rc::downgrade(&source_rc),
                    attribute: capture.attribute.clone(),
                    key: sub_key,
                });
            }
        }
    }

    let reactive = data.components().iter().any(|component| {
        matches!(
            component,
            EffectComponentDef::TargetTagRequirements(requirements) if requirements.is_reactive()
        )
    });
    if reactive {
        let sub_key = inner.tags.subscribers.insert(subscriber);
        tokens.push(SubscriptionToken::Tags {
            actor: inner.self_weak.clone(),
            key: sub_key,
        });
    }

    if let Some(effect) = inner.effects.active.get_mut(key) {
        effect.subscriptions = tokens;
    }
}

fn finish_apply(
    inner: &mut ActorInner,
    key: ActiveEffectKey,
    inhibited: bool,
    queue: &mut OpQueue,
) {
    let Some(effect) = inner.effects.active.get(key) else {
        return;
    };
    let data = Rc::clone(&effect.data);
    let runtime = effect.runtime.clone();

    let mut tags_granted = false;
    for component in data.components() {
        match component {
            EffectComponentDef::ModifierTags(tags) => {
                for tag in &tags.tags {
                    inner.tags.add(tag.clone());
                }
                tags_granted = true;
            }
            EffectComponentDef::GrantAbility(grant) => {
                queue.abilities.push((grant.ability.clone(), true));
            }
            _ => {}
        }
    }

    {
        let ActorInner {
            attributes,
            effects,
            ..
        } = inner;
        let effect = effects.active.get_mut(key).expect("effect vanished");
        effect.inhibited = inhibited;
        effect.tags_granted = tags_granted;
        if !effect.is_periodic() && !inhibited {
            effect.attach(attributes);
        }
    }

    if !inhibited
        && data
            .periodic()
            .is_some_and(|periodic| periodic.execute_on_application)
    {
        execute_once(inner, key, false, queue);
    }

    queue_effect_cues(inner, key, CueEventKind::Apply, queue);

    let handle = EffectHandle {
        actor: inner.self_weak.clone(),
        key,
    };
    for component in data.components() {
        if let Some(custom) = component.as_custom() {
            queue.components.push(ComponentEvent::PostAdded {
                component: Rc::clone(custom),
                handle: handle.clone(),
            });
            queue.components.push(ComponentEvent::Applied {
                component: Rc::clone(custom),
                effect: runtime.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Stack merging
// ---------------------------------------------------------------------------

fn find_peer(
    inner: &ActorInner,
    incoming: &RuntimeEffect,
    data: &Rc<EffectData>,
) -> Option<ActiveEffectKey> {
    let stacking = data.stacking()?;
    inner.effects.order.iter().copied().find(|key| {
        let Some(candidate) = inner.effects.active.get(*key) else {
            return false;
        };
        if !same_data(&candidate.data, data) {
            return false;
        }
        if stacking.stack_policy == StackPolicy::AggregateBySource
            && candidate.runtime.owner_id() != incoming.owner_id()
        {
            return false;
        }
        if stacking.stack_level_policy == StackLevelPolicy::SegregateLevels
            && candidate.level != incoming.level()
        {
            return false;
        }
        true
    })
}

/// Merges an application into an existing stack. The gates run in strict
/// order (level, overflow, owner) before any state moves, so a denial has no
/// side effects; the stack change, re-evaluation, refresh and
/// execute-on-apply steps follow.
fn try_stack_merge(
    inner: &mut ActorInner,
    incoming: &RuntimeEffect,
    queue: &mut OpQueue,
) -> MergeOutcome {
    let data = incoming.data();
    let Some(key) = find_peer(inner, incoming, &data) else {
        return MergeOutcome::NoPeer;
    };
    let stacking = data.stacking().expect("peer without stacking").clone();

    let (mut effective_level, current_stack, peer_owner) = {
        let peer = inner.effects.active.get(key).expect("peer vanished");
        (peer.level, peer.stack_count, peer.runtime.owner_id())
    };
    let incoming_level = incoming.level();
    let mut reset_stacks = false;
    let mut changed = false;

    // 1. Level gate.
    if stacking.stack_level_policy == StackLevelPolicy::AggregateLevels {
        let relation = LevelComparison::relate(incoming_level, effective_level);
        if stacking
            .level_denial_policy
            .unwrap_or_default()
            .contains(relation)
        {
            debug!(effect = %data.name(), ?relation, "stack application denied by level");
            return MergeOutcome::Denied;
        }
        if stacking
            .level_override_policy
            .unwrap_or_default()
            .contains(relation)
        {
            effective_level = incoming_level;
            changed = true;
            reset_stacks = stacking.level_override_stack_count_policy
                == Some(StackCountOverridePolicy::ResetStacks);
        }
    }

    // 2. Overflow gate.
    let limit = stacking.stack_limit.eval(effective_level).max(1);
    if current_stack >= limit && stacking.overflow_policy == StackOverflowPolicy::DenyApplication {
        debug!(effect = %data.name(), limit, "stack application denied by overflow");
        return MergeOutcome::Denied;
    }

    // 3. Owner gate.
    if peer_owner != incoming.owner_id() {
        if stacking.owner_denial_policy == Some(OwnerDenialPolicy::DenyIfDifferent) {
            debug!(effect = %data.name(), "stack application denied by owner");
            return MergeOutcome::Denied;
        }
        if stacking.owner_override_policy == Some(OwnerOverridePolicy::Override) {
            swap_runtime(inner, key, incoming);
            changed = true;
            if stacking.owner_override_stack_count_policy
                == Some(StackCountOverridePolicy::ResetStacks)
            {
                reset_stacks = true;
            }
        }
    }

    // 4. Stack-count change.
    {
        let effect = inner.effects.active.get_mut(key).expect("peer vanished");
        effect.level = effective_level;
        if reset_stacks {
            effect.stack_count = stacking.initial_stack.eval(effective_level).max(1);
        } else if effect.stack_count < limit {
            effect.stack_count = (effect.stack_count + 1).min(limit);
            changed = true;
        }
    }

    // 5. Re-evaluate and re-apply.
    if changed {
        refresh_evaluated(inner, key);
    }

    // 6. Duration refresh.
    // 7. Period reset.
    let inhibited = {
        let effect = inner.effects.active.get_mut(key).expect("peer vanished");
        if stacking.application_refresh_policy
            == ApplicationRefreshPolicy::RefreshOnSuccessfulApplication
        {
            effect.remaining_duration = effect.evaluated.duration;
        }
        if stacking.application_reset_period_policy
            == ApplicationResetPeriodPolicy::ResetOnSuccessfulApplication
        {
            effect.internal_time = 0.0;
            effect.next_periodic_tick = effect.evaluated.period;
        }
        effect.inhibited
    };

    // 8. Execute on successful application, at a single stack's magnitude.
    if stacking.execute_on_successful_application && !inhibited {
        execute_once(inner, key, true, queue);
    }

    trace!(effect = %data.name(), stack = ?inner.effects.active.get(key).map(|e| e.stack_count), "stack merged");

    if !data.suppress_stacking_cues() {
        queue_effect_cues(inner, key, CueEventKind::Update, queue);
    }
    queue_changed_components(inner, key, queue);
    let runtime = inner
        .effects
        .active
        .get(key)
        .map(|effect| effect.runtime.clone());
    if let Some(runtime) = runtime {
        for component in data.components() {
            if let Some(custom) = component.as_custom() {
                queue.components.push(ComponentEvent::Applied {
                    component: Rc::clone(custom),
                    effect: runtime.clone(),
                });
            }
        }
    }

    MergeOutcome::Merged(key)
}

/// Replaces the peer's runtime (owner override) and rewires every
/// subscription against the new runtime's level and capture sources.
fn swap_runtime(inner: &mut ActorInner, key: ActiveEffectKey, incoming: &RuntimeEffect) {
    let tokens = {
        let Some(effect) = inner.effects.active.get_mut(key) else {
            return;
        };
        effect.runtime = incoming.clone();
        std::mem::take(&mut effect.subscriptions)
    };
    for token in tokens {
        token.revoke(inner);
    }
    wire_subscriptions(inner, key);
}

// ---------------------------------------------------------------------------
// Re-evaluation
// ---------------------------------------------------------------------------

/// Rebuilds the evaluated snapshot; when the result differs, swaps attached
/// contributions atomically. Returns whether anything observable changed.
fn refresh_evaluated(inner: &mut ActorInner, key: ActiveEffectKey) -> bool {
    let Some(effect) = inner.effects.active.get(key) else {
        return false;
    };
    let runtime = effect.runtime.clone();
    let fresh = evaluate_effect(
        &inner.attributes,
        inner.id,
        &runtime,
        effect.level,
        effect.stack_count,
        Some(&effect.snapshot_cache),
    );
    if effect.evaluated.matches(&fresh) {
        return false;
    }

    let ActorInner {
        attributes,
        effects,
        ..
    } = inner;
    let effect = effects.active.get_mut(key).expect("effect vanished");
    let was_attached = effect.attached;
    if was_attached {
        effect.detach(attributes);
    }
    effect.evaluated = fresh;
    if !effect.is_periodic() && !effect.inhibited {
        effect.attach(attributes);
    }
    true
}

/// Re-evaluation triggered by a backing change (attribute, level, stack).
/// Dispatches the `Update` cue only when something observable moved.
fn reevaluate(inner: &mut ActorInner, key: ActiveEffectKey, queue: &mut OpQueue) {
    if !refresh_evaluated(inner, key) {
        return;
    }
    let suppress = inner
        .effects
        .active
        .get(key)
        .is_some_and(|effect| effect.data.suppress_stacking_cues());
    if !suppress {
        queue_effect_cues(inner, key, CueEventKind::Update, queue);
    }
    queue_changed_components(inner, key, queue);
}

fn queue_changed_components(inner: &ActorInner, key: ActiveEffectKey, queue: &mut OpQueue) {
    let Some(effect) = inner.effects.active.get(key) else {
        return;
    };
    let handle = EffectHandle {
        actor: inner.self_weak.clone(),
        key,
    };
    for component in effect.data.components() {
        if let Some(custom) = component.as_custom() {
            queue.components.push(ComponentEvent::Changed {
                component: Rc::clone(custom),
                handle: handle.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Inhibition
// ---------------------------------------------------------------------------

fn set_inhibited_internal(
    inner: &mut ActorInner,
    key: ActiveEffectKey,
    inhibited: bool,
    queue: &mut OpQueue,
) {
    let Some(effect) = inner.effects.active.get(key) else {
        return;
    };
    if effect.inhibited == inhibited {
        return;
    }
    let data = Rc::clone(&effect.data);
    let periodic = effect.is_periodic();
    debug!(effect = %data.name(), inhibited, "inhibition flipped");

    if periodic {
        {
            let effect = inner.effects.active.get_mut(key).expect("effect vanished");
            effect.inhibited = inhibited;
        }
        if !inhibited {
            let policy = data
                .periodic()
                .map(|periodic| periodic.inhibition_removed_policy)
                .unwrap_or_default();
            match policy {
                InhibitionRemovedPolicy::NeverReset => {}
                InhibitionRemovedPolicy::ResetPeriod => {
                    let effect = inner.effects.active.get_mut(key).expect("effect vanished");
                    effect.internal_time = 0.0;
                    effect.next_periodic_tick = effect.evaluated.period;
                }
                InhibitionRemovedPolicy::ExecuteAndResetPeriod => {
                    {
                        let effect =
                            inner.effects.active.get_mut(key).expect("effect vanished");
                        effect.internal_time = 0.0;
                        effect.next_periodic_tick = effect.evaluated.period;
                    }
                    execute_once(inner, key, false, queue);
                }
            }
        }
    } else if inhibited {
        let ActorInner {
            attributes,
            effects,
            ..
        } = inner;
        let effect = effects.active.get_mut(key).expect("effect vanished");
        effect.inhibited = true;
        effect.detach(attributes);
    } else {
        // Clearing: re-evaluate against current state, then re-attach.
        let (runtime, level, stack_count) = {
            let effect = inner.effects.active.get(key).expect("effect vanished");
            (effect.runtime.clone(), effect.level, effect.stack_count)
        };
        let fresh = {
            let effect = inner.effects.active.get(key).expect("effect vanished");
            evaluate_effect(
                &inner.attributes,
                inner.id,
                &runtime,
                level,
                stack_count,
                Some(&effect.snapshot_cache),
            )
        };
        let ActorInner {
            attributes,
            effects,
            ..
        } = inner;
        let effect = effects.active.get_mut(key).expect("effect vanished");
        effect.inhibited = false;
        effect.evaluated = fresh;
        effect.attach(attributes);
    }

    if !data.suppress_stacking_cues() {
        queue_effect_cues(inner, key, CueEventKind::Update, queue);
    }
    queue_changed_components(inner, key, queue);
}

// ---------------------------------------------------------------------------
// Tag reactions
// ---------------------------------------------------------------------------

/// Re-checks removal and ongoing requirements for every effect subscribed to
/// this actor's tag container.
fn check_tag_reactions(inner: &mut ActorInner, queue: &mut OpQueue) {
    let subscribers: Vec<EffectSubscriber> = inner.tags.subscribers.values().cloned().collect();
    for subscriber in subscribers {
        if !subscriber.actor.ptr_eq(&inner.self_weak) {
            continue;
        }
        let key = subscriber.effect;
        let Some(effect) = inner.effects.active.get(key) else {
            continue;
        };
        let data = Rc::clone(&effect.data);
        for component in data.components() {
            let EffectComponentDef::TargetTagRequirements(requirements) = component else {
                continue;
            };
            if !requirements.removal.is_empty()
                && requirements.removal.requirements_met(&inner.tags)
            {
                debug!(effect = %data.name(), "removal requirements met");
                mark_removal(inner, key, false);
                break;
            }
            if !requirements.ongoing.is_empty() {
                let should_inhibit = !requirements.ongoing.requirements_met(&inner.tags);
                let differs = inner
                    .effects
                    .active
                    .get(key)
                    .is_some_and(|effect| effect.inhibited != should_inhibit);
                if differs {
                    set_inhibited_internal(inner, key, should_inhibit, queue);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execution (instant applications and periodic ticks)
// ---------------------------------------------------------------------------

/// Evaluates the effect's modifiers and custom executions against a
/// consistent pre-execution snapshot, then applies the mutations to base
/// values.
fn collect_execution_mutations(
    attributes: &AttributeMap,
    target_id: ActorId,
    runtime: &RuntimeEffect,
    data: &Rc<EffectData>,
    level: i32,
    stack_count: i32,
    multiplier_stacks: i32,
    snapshot_cache: Option<&std::collections::HashMap<crate::magnitude::CaptureKey, f32>>,
) -> Vec<RequestedMutation> {
    let state = runtime.inner.borrow();
    let multiplier = match data.stacking().map(|stacking| stacking.magnitude_policy) {
        Some(StackMagnitudePolicy::Sum) => multiplier_stacks as f32,
        _ => 1.0,
    };
    crate::effect::active::with_sides(attributes, target_id, &state.ownership, |sides| {
        let mut mutations = Vec::new();
        let context = MagnitudeContext {
            sides,
            level,
            stack_count,
            caller_magnitudes: &state.caller_magnitudes,
            snapshot_cache,
        };
        for modifier in data.modifiers() {
            mutations.push(RequestedMutation {
                attribute: modifier.attribute.clone(),
                operation: modifier.operation,
                magnitude: modifier.magnitude.evaluate(&context) * multiplier,
            });
        }
        for execution in data.custom_executions() {
            let calculation = CalculationContext {
                sides,
                level,
                stack_count,
                caller_magnitudes: &state.caller_magnitudes,
            };
            let mut execution_context = ExecutionContext::new(calculation);
            execution.execute(&mut execution_context);
            mutations.extend(execution_context.mutations);
        }
        mutations
    })
}

fn apply_mutations(attributes: &mut AttributeMap, mutations: &[RequestedMutation]) {
    for mutation in mutations {
        let Some(attribute) = attributes.get_mut(&mutation.attribute) else {
            warn!(attribute = %mutation.attribute, "execution targets a missing attribute");
            continue;
        };
        match mutation.operation {
            ModOp::FlatBonus => attribute.execute_flat(floor_to_i32(mutation.magnitude)),
            ModOp::PercentBonus => attribute.execute_percent(mutation.magnitude),
            ModOp::Override => attribute.execute_override(floor_to_i32(mutation.magnitude)),
        }
    }
}

/// One periodic execution. `single_stack` is set for merge-triggered
/// executions, which run at a single application's magnitude.
fn execute_once(
    inner: &mut ActorInner,
    key: ActiveEffectKey,
    single_stack: bool,
    queue: &mut OpQueue,
) {
    let Some(effect) = inner.effects.active.get(key) else {
        return;
    };
    let runtime = effect.runtime.clone();
    let data = Rc::clone(&effect.data);
    let level = effect.level;
    let stack_count = effect.stack_count;
    let multiplier_stacks = if single_stack { 1 } else { stack_count };
    let mutations = collect_execution_mutations(
        &inner.attributes,
        inner.id,
        &runtime,
        &data,
        level,
        stack_count,
        multiplier_stacks,
        Some(&effect.snapshot_cache),
    );

    apply_mutations(&mut inner.attributes, &mutations);
    if let Some(effect) = inner.effects.active.get_mut(key) {
        effect.execution_count += 1;
    }

    queue_effect_cues(inner, key, CueEventKind::Execute, queue);
    for component in data.components() {
        if let Some(custom) = component.as_custom() {
            queue.components.push(ComponentEvent::Executed {
                component: Rc::clone(custom),
                effect: runtime.clone(),
            });
        }
    }
}

/// Fire-and-forget execution of an instant effect against base values.
fn execute_instant(inner: &mut ActorInner, runtime: &RuntimeEffect, queue: &mut OpQueue) {
    let data = runtime.data();
    let level = runtime.level();
    let mutations = collect_execution_mutations(
        &inner.attributes,
        inner.id,
        runtime,
        &data,
        level,
        1,
        1,
        None,
    );
    apply_mutations(&mut inner.attributes, &mutations);

    let source = Some(runtime.ownership().source_id);
    queue_cues_for(inner, &data, level, 1, source, CueEventKind::Execute, queue);
    for component in data.components() {
        if let Some(custom) = component.as_custom() {
            queue.components.push(ComponentEvent::Executed {
                component: Rc::clone(custom),
                effect: runtime.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Ticking
// ---------------------------------------------------------------------------

fn tick_effect(inner: &mut ActorInner, key: ActiveEffectKey, dt: f64, queue: &mut OpQueue) {
    let remaining = {
        let Some(effect) = inner.effects.active.get_mut(key) else {
            return;
        };
        if !effect.has_duration() {
            None
        } else {
            effect.remaining_duration -= dt;
            Some(effect.remaining_duration)
        }
    };

    match remaining {
        Some(remaining) if remaining <= TIME_EPSILON => {
            // Catch up the ticks that fell strictly before expiry.
            let lived = (dt + remaining).max(0.0);
            periodic_advance(inner, key, lived, true, queue);
            expire(inner, key, queue);
        }
        _ => periodic_advance(inner, key, dt, false, queue),
    }
}

/// Accumulates periodic time and runs the executions that came due.
/// `strict_before` excludes a tick landing exactly on the accumulated
/// deadline, which expiry catch-up uses so a tick at the expiry instant
/// does not fire.
fn periodic_advance(
    inner: &mut ActorInner,
    key: ActiveEffectKey,
    dt: f64,
    strict_before: bool,
    queue: &mut OpQueue,
) {
    {
        let Some(effect) = inner.effects.active.get_mut(key) else {
            return;
        };
        if !effect.is_periodic() || effect.inhibited || dt <= 0.0 {
            return;
        }
        effect.internal_time += dt;
    }

    loop {
        let due = {
            let Some(effect) = inner.effects.active.get(key) else {
                return;
            };
            if !effect.is_periodic() || effect.inhibited {
                return;
            }
            if effect.evaluated.period <= TIME_EPSILON {
                error!(effect = %effect.data.name(), "periodic effect with a degenerate period");
                return;
            }
            if strict_before {
                effect.next_periodic_tick <= effect.internal_time - TIME_EPSILON
            } else {
                effect.internal_time + TIME_EPSILON >= effect.next_periodic_tick
            }
        };
        if !due {
            return;
        }
        {
            let effect = inner.effects.active.get_mut(key).expect("effect vanished");
            effect.next_periodic_tick += effect.evaluated.period;
        }
        execute_once(inner, key, false, queue);
    }
}

/// Applies the expiration policy once the remaining duration is spent.
fn expire(inner: &mut ActorInner, key: ActiveEffectKey, queue: &mut OpQueue) {
    let policy = inner
        .effects
        .active
        .get(key)
        .and_then(|effect| effect.data.stacking())
        .map(|stacking| stacking.expiration_policy);

    match policy {
        None | Some(StackExpirationPolicy::ClearEntireStack) => {
            mark_removal(inner, key, false);
        }
        Some(StackExpirationPolicy::RemoveSingleStackAndRefreshDuration) => loop {
            let (stack_now, remaining, duration) = {
                let Some(effect) = inner.effects.active.get_mut(key) else {
                    return;
                };
                effect.stack_count -= 1;
                (
                    effect.stack_count,
                    effect.remaining_duration,
                    effect.evaluated.duration,
                )
            };
            if stack_now <= 0 {
                mark_removal(inner, key, false);
                return;
            }
            queue_unapplied_components(inner, key, false, queue);
            refresh_evaluated(inner, key);

            let catch_up = (-remaining).max(0.0).min(duration);
            periodic_advance(inner, key, catch_up, true, queue);

            let effect = inner.effects.active.get_mut(key).expect("effect vanished");
            effect.remaining_duration += effect.evaluated.duration;
            if effect.remaining_duration > TIME_EPSILON {
                return;
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

fn queue_unapplied_components(
    inner: &ActorInner,
    key: ActiveEffectKey,
    removed: bool,
    queue: &mut OpQueue,
) {
    let Some(effect) = inner.effects.active.get(key) else {
        return;
    };
    let handle = EffectHandle {
        actor: inner.self_weak.clone(),
        key,
    };
    for component in effect.data.components() {
        if let Some(custom) = component.as_custom() {
            queue.components.push(ComponentEvent::Unapplied {
                component: Rc::clone(custom),
                handle: handle.clone(),
                removed,
            });
        }
    }
}

fn process_removals(inner: &mut ActorInner, queue: &mut OpQueue) {
    while !inner.effects.pending_removals.is_empty() {
        let (key, interrupted) = inner.effects.pending_removals.remove(0);
        let Some(effect) = inner.effects.active.get(key) else {
            continue;
        };
        let data = Rc::clone(&effect.data);
        let level = effect.level;
        let stack_count = effect.stack_count;
        let source = Some(effect.runtime.ownership().source_id);
        let tags_granted = effect.tags_granted;
        debug!(effect = %data.name(), interrupted, "removing effect");

        {
            let ActorInner {
                attributes,
                effects,
                ..
            } = inner;
            let effect = effects.active.get_mut(key).expect("effect vanished");
            effect.detach(attributes);
            effect.stack_count = 0;
        }

        if tags_granted {
            for component in data.components() {
                if let EffectComponentDef::ModifierTags(tags) = component {
                    for tag in &tags.tags {
                        inner.tags.remove(tag);
                    }
                }
            }
        }
        for component in data.components() {
            if let EffectComponentDef::GrantAbility(grant) = component {
                queue.abilities.push((grant.ability.clone(), false));
            }
        }

        let tokens = {
            let effect = inner.effects.active.get_mut(key).expect("effect vanished");
            std::mem::take(&mut effect.subscriptions)
        };
        for token in tokens {
            token.revoke(inner);
        }

        queue_cues_for(
            inner,
            &data,
            level,
            stack_count,
            source,
            CueEventKind::Remove { interrupted },
            queue,
        );
        queue_unapplied_components(inner, key, true, queue);

        inner.effects.active.remove(key);
        inner.effects.order.retain(|existing| *existing != key);
    }
}

// ---------------------------------------------------------------------------
// Cue sampling
// ---------------------------------------------------------------------------

fn queue_effect_cues(
    inner: &ActorInner,
    key: ActiveEffectKey,
    kind: CueEventKind,
    queue: &mut OpQueue,
) {
    let Some(effect) = inner.effects.active.get(key) else {
        return;
    };
    let data = Rc::clone(&effect.data);
    let source = Some(effect.runtime.ownership().source_id);
    queue_cues_for(
        inner,
        &data,
        effect.level,
        effect.stack_count,
        source,
        kind,
        queue,
    );
}

fn queue_cues_for(
    inner: &ActorInner,
    data: &Rc<EffectData>,
    level: i32,
    stack_count: i32,
    source: Option<ActorId>,
    kind: CueEventKind,
    queue: &mut OpQueue,
) {
    if data.cues().is_empty() || inner.cues.is_none() {
        return;
    }
    if data.require_modifier_success_to_trigger_cue() {
        let succeeded = data.modifiers().iter().any(|modifier| {
            inner
                .attributes
                .get(&modifier.attribute)
                .is_some_and(|attribute| attribute.pending_value_change() != 0)
        });
        if !succeeded {
            return;
        }
    }
    for cue in data.cues() {
        let parameters = cue::sample_parameters(cue, &inner.attributes, level, stack_count, source);
        queue.cues.push(CueEvent {
            tag: cue.tag.clone(),
            kind,
            parameters,
        });
    }
}
