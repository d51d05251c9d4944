//! Token-based event subscriptions.
//!
//! Attribute values, tag containers and runtime effect levels all notify
//! dependent active effects when they change. Naive back-pointers would form
//! ownership cycles, so subscribers are recorded as weak actor references
//! paired with the dependent effect's generational key, and every
//! subscription is addressed by a slot-map token the effect keeps and
//! revokes on unapply.

use std::cell::RefCell;
use std::rc::Weak;

use slotmap::new_key_type;

use crate::actor::ActorInner;
use crate::attribute::AttributeKey;
use crate::effect::runtime::RuntimeState;

new_key_type! {
    /// Addresses one entry in a subscriber slot map.
    pub struct SubscriptionKey;

    /// Addresses one active effect owned by an effects manager.
    pub struct ActiveEffectKey;
}

/// One registered listener: the actor whose manager owns the dependent
/// effect, and the effect's key within that manager.
#[derive(Clone)]
pub(crate) struct EffectSubscriber {
    pub actor: Weak<RefCell<ActorInner>>,
    pub effect: ActiveEffectKey,
}

/// A revocable handle to one subscription, kept by the subscribing effect.
pub(crate) enum SubscriptionToken {
    AttributeValue {
        actor: Weak<RefCell<ActorInner>>,
        attribute: AttributeKey,
        key: SubscriptionKey,
    },
    Tags {
        actor: Weak<RefCell<ActorInner>>,
        key: SubscriptionKey,
    },
    Level {
        runtime: Weak<RefCell<RuntimeState>>,
        key: SubscriptionKey,
    },
}

impl SubscriptionToken {
    /// Removes the subscription from wherever it lives.
    ///
    /// `inner` is the actor currently held mutably by the calling manager
    /// operation; tokens that point back at it are revoked through that
    /// borrow instead of re-entering the `RefCell`.
    pub(crate) fn revoke(self, inner: &mut ActorInner) {
        match self {
            SubscriptionToken::AttributeValue {
                actor,
                attribute,
                key,
            } => {
                if actor.ptr_eq(&inner.self_weak) {
                    if let Some(attr) = inner.attributes.get_mut(&attribute) {
                        attr.subscribers.remove(key);
                    }
                } else if let Some(other) = actor.upgrade() {
                    let mut other = other.borrow_mut();
                    if let Some(attr) = other.attributes.get_mut(&attribute) {
                        attr.subscribers.remove(key);
                    }
                }
            }
            SubscriptionToken::Tags { actor, key } => {
                if actor.ptr_eq(&inner.self_weak) {
                    inner.tags.subscribers.remove(key);
                } else if let Some(other) = actor.upgrade() {
                    other.borrow_mut().tags.subscribers.remove(key);
                }
            }
            SubscriptionToken::Level { runtime, key } => {
                if let Some(runtime) = runtime.upgrade() {
                    runtime.borrow_mut().level_subscribers.remove(key);
                }
            }
        }
    }
}
