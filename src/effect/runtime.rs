use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use slotmap::SlotMap;
use tracing::debug;

use crate::actor::{Actor, ActorId, ActorInner};
use crate::effect::EffectData;
use crate::subscription::{EffectSubscriber, SubscriptionKey};
use crate::tag::Tag;

/// Who applied an effect and on whose behalf.
///
/// The owner identity gates stacking; the source side backs source-attribute
/// captures. Both are weak so an effect outliving its caster never keeps the
/// caster's actor alive; a dead source reads as missing and its captures
/// yield zero.
#[derive(Clone)]
pub struct EffectOwnership {
    pub(crate) owner: Weak<RefCell<ActorInner>>,
    pub(crate) owner_id: ActorId,
    pub(crate) source: Weak<RefCell<ActorInner>>,
    pub(crate) source_id: ActorId,
}

impl EffectOwnership {
    pub fn new(owner: &Actor, source: &Actor) -> Self {
        Self {
            owner: owner.downgrade(),
            owner_id: owner.id(),
            source: source.downgrade(),
            source_id: source.id(),
        }
    }

    pub fn owner_id(&self) -> ActorId {
        self.owner_id
    }

    pub fn source_id(&self) -> ActorId {
        self.source_id
    }

    pub fn source(&self) -> Option<Actor> {
        self.source.upgrade().map(Actor::from_inner)
    }

    pub fn owner(&self) -> Option<Actor> {
        self.owner.upgrade().map(Actor::from_inner)
    }
}

impl fmt::Debug for EffectOwnership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectOwnership")
            .field("owner", &self.owner_id)
            .field("source", &self.source_id)
            .finish()
    }
}

pub(crate) struct RuntimeState {
    pub data: Rc<EffectData>,
    pub level: i32,
    pub ownership: EffectOwnership,
    pub caller_magnitudes: HashMap<Tag, f32>,
    pub level_subscribers: SlotMap<SubscriptionKey, EffectSubscriber>,
    level_observers: Vec<Rc<dyn Fn(i32)>>,
}

/// A shareable instance of an effect configuration: the immutable data plus
/// level, ownership and caller-set magnitudes.
///
/// Cloning is cheap and clones observe the same state; the same runtime
/// effect may be applied to many targets.
#[derive(Clone)]
pub struct RuntimeEffect {
    pub(crate) inner: Rc<RefCell<RuntimeState>>,
}

impl RuntimeEffect {
    /// A runtime effect owned and sourced by the same actor.
    pub fn new(data: &Rc<EffectData>, level: i32, owner: &Actor) -> Self {
        Self::with_ownership(data, level, EffectOwnership::new(owner, owner))
    }

    /// A runtime effect cast by `owner` with captures reading from `source`.
    pub fn from_source(data: &Rc<EffectData>, level: i32, owner: &Actor, source: &Actor) -> Self {
        Self::with_ownership(data, level, EffectOwnership::new(owner, source))
    }

    pub fn with_ownership(data: &Rc<EffectData>, level: i32, ownership: EffectOwnership) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RuntimeState {
                data: Rc::clone(data),
                level,
                ownership,
                caller_magnitudes: HashMap::new(),
                level_subscribers: SlotMap::with_key(),
                level_observers: Vec::new(),
            })),
        }
    }

    pub fn data(&self) -> Rc<EffectData> {
        Rc::clone(&self.inner.borrow().data)
    }

    pub fn level(&self) -> i32 {
        self.inner.borrow().level
    }

    pub fn ownership(&self) -> EffectOwnership {
        self.inner.borrow().ownership.clone()
    }

    pub fn owner_id(&self) -> ActorId {
        self.inner.borrow().ownership.owner_id
    }

    /// Changes the effect level and re-evaluates every active application
    /// that did not snapshot its level.
    pub fn set_level(&self, level: i32) {
        let (subscribers, observers) = {
            let mut state = self.inner.borrow_mut();
            if state.level == level {
                return;
            }
            debug!(effect = %state.data.name(), level, "effect level changed");
            state.level = level;
            let subscribers: Vec<EffectSubscriber> =
                state.level_subscribers.values().cloned().collect();
            (subscribers, state.level_observers.clone())
        };

        for observer in observers {
            observer(level);
        }
        for subscriber in subscribers {
            if let Some(actor) = subscriber.actor.upgrade() {
                crate::manager::level_changed_external(actor, subscriber.effect, level);
            }
        }
    }

    pub fn level_up(&self) {
        let level = self.level();
        self.set_level(level + 1);
    }

    pub fn set_by_caller_magnitude(&self, tag: impl Into<Tag>, value: f32) {
        self.inner
            .borrow_mut()
            .caller_magnitudes
            .insert(tag.into(), value);
    }

    pub fn caller_magnitude(&self, tag: &Tag) -> Option<f32> {
        self.inner.borrow().caller_magnitudes.get(tag).copied()
    }

    /// Registers a host observer for level changes.
    pub fn on_level_changed(&self, observer: impl Fn(i32) + 'static) {
        self.inner
            .borrow_mut()
            .level_observers
            .push(Rc::new(observer));
    }

    pub(crate) fn subscribe_level(&self, subscriber: EffectSubscriber) -> SubscriptionKey {
        self.inner.borrow_mut().level_subscribers.insert(subscriber)
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<RuntimeState>> {
        Rc::downgrade(&self.inner)
    }
}

impl fmt::Debug for RuntimeEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("RuntimeEffect")
            .field("effect", &state.data.name())
            .field("level", &state.level)
            .field("ownership", &state.ownership)
            .finish()
    }
}
