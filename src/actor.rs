use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use smol_str::SmolStr;
use tracing::debug;

use crate::attribute::{AttributeKey, AttributeMap, AttributeSetDef};
use crate::cue::CueManager;
use crate::effect::AbilityGrants;
use crate::manager::{EffectsManager, EffectsState};
use crate::tag::{Tag, TagContainer};

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of an actor, used for ownership comparisons after the
/// actor itself may be gone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.0)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct ActorInner {
    pub id: ActorId,
    pub name: SmolStr,
    pub attributes: AttributeMap,
    pub tags: TagContainer,
    pub effects: EffectsState,
    pub cues: Option<Rc<CueManager>>,
    pub rng: Option<Box<dyn Rng>>,
    pub abilities: Option<Rc<dyn AbilityGrants>>,
    pub value_observers: Vec<(AttributeKey, Rc<dyn Fn(i32)>)>,
    pub self_weak: Weak<RefCell<ActorInner>>,
}

/// A game entity: attributes, tags and the effects applied to it.
///
/// `Actor` is a cheap-clone handle; clones observe the same entity. The
/// engine holds only weak references between actors, so dropping the last
/// host handle drops the entity and cancels everything attached to it.
#[derive(Clone)]
pub struct Actor {
    pub(crate) inner: Rc<RefCell<ActorInner>>,
}

impl Actor {
    pub fn builder(name: impl Into<SmolStr>) -> ActorBuilder {
        ActorBuilder::new(name)
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<ActorInner>>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<ActorInner>> {
        Rc::downgrade(&self.inner)
    }

    pub fn id(&self) -> ActorId {
        self.inner.borrow().id
    }

    pub fn name(&self) -> SmolStr {
        self.inner.borrow().name.clone()
    }

    /// The per-actor effects coordinator.
    pub fn effects(&self) -> EffectsManager {
        EffectsManager::for_actor(self.clone())
    }

    pub fn has_attribute(&self, key: &AttributeKey) -> bool {
        self.inner.borrow().attributes.contains(key)
    }

    pub fn current_value(&self, key: &AttributeKey) -> Option<i32> {
        self.inner
            .borrow()
            .attributes
            .get(key)
            .map(|attribute| attribute.current_value())
    }

    pub fn base_value(&self, key: &AttributeKey) -> Option<i32> {
        self.inner
            .borrow()
            .attributes
            .get(key)
            .map(|attribute| attribute.base_value())
    }

    pub fn attribute_modifier(&self, key: &AttributeKey) -> Option<i32> {
        self.inner
            .borrow()
            .attributes
            .get(key)
            .map(|attribute| attribute.modifier())
    }

    pub fn attribute_overflow(&self, key: &AttributeKey) -> Option<i32> {
        self.inner
            .borrow()
            .attributes
            .get(key)
            .map(|attribute| attribute.overflow())
    }

    /// Accumulated unflushed change; zero outside a running engine
    /// operation.
    pub fn pending_value_change(&self, key: &AttributeKey) -> Option<i32> {
        self.inner
            .borrow()
            .attributes
            .get(key)
            .map(|attribute| attribute.pending_value_change())
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.inner.borrow().tags.has(tag)
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.inner.borrow().tags.iter().cloned().collect()
    }

    /// Grants a tag from the host side. Effects gated on tags react before
    /// this returns.
    pub fn add_tag(&self, tag: impl Into<Tag>) {
        crate::manager::host_tag_change(self, tag.into(), true);
    }

    /// Releases one host-side grant of a tag.
    pub fn remove_tag(&self, tag: &Tag) {
        crate::manager::host_tag_change(self, tag.clone(), false);
    }

    /// Registers an observer for an attribute's batched `ValueChanged`
    /// notifications. The observer receives the accumulated delta, once per
    /// top-level engine operation that changed the attribute.
    pub fn observe_attribute(&self, key: impl Into<AttributeKey>, observer: impl Fn(i32) + 'static) {
        self.inner
            .borrow_mut()
            .value_observers
            .push((key.into(), Rc::new(observer)));
    }
}

impl PartialEq for Actor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Actor")
            .field("id", &inner.id)
            .field("name", &inner.name)
            .finish()
    }
}

/// Assembles an actor: attribute sets, initial tags and collaborators.
pub struct ActorBuilder {
    name: SmolStr,
    sets: Vec<AttributeSetDef>,
    tags: Vec<Tag>,
    cues: Option<Rc<CueManager>>,
    rng: Option<Box<dyn Rng>>,
    abilities: Option<Rc<dyn AbilityGrants>>,
}

impl ActorBuilder {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            sets: Vec::new(),
            tags: Vec::new(),
            cues: None,
            rng: None,
            abilities: None,
        }
    }

    pub fn with_set(mut self, set: AttributeSetDef) -> Self {
        self.sets.push(set);
        self
    }

    pub fn grant_tag(mut self, tag: impl Into<Tag>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn cue_manager(mut self, cues: Rc<CueManager>) -> Self {
        self.cues = Some(cues);
        self
    }

    /// RNG used by chance-to-apply components. Without one, chance rolls
    /// always succeed.
    pub fn rng(mut self, rng: Box<dyn Rng>) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn ability_grants(mut self, abilities: Rc<dyn AbilityGrants>) -> Self {
        self.abilities = Some(abilities);
        self
    }

    pub fn build(self) -> Actor {
        let id = ActorId(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed));
        debug!(actor = %self.name, %id, "spawning actor");

        let mut attributes = AttributeMap::default();
        for set in &self.sets {
            attributes.install(set);
        }
        let mut tags = TagContainer::default();
        for tag in self.tags {
            tags.add(tag);
        }
        tags.take_changed();

        let inner = Rc::new_cyclic(|self_weak| {
            RefCell::new(ActorInner {
                id,
                name: self.name,
                attributes,
                tags,
                effects: EffectsState::default(),
                cues: self.cues,
                rng: self.rng,
                abilities: self.abilities,
                value_observers: Vec::new(),
                self_weak: self_weak.clone(),
            })
        });
        Actor::from_inner(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeDef;

    #[test]
    fn builder_installs_sets_and_tags() {
        let actor = Actor::builder("goblin")
            .with_set(
                AttributeSetDef::new("Combat")
                    .attribute(AttributeDef::new("Health", 30).range(0, 30)),
            )
            .grant_tag("species.goblin")
            .build();

        assert_eq!(
            actor.current_value(&AttributeKey::new_static("Combat.Health")),
            Some(30)
        );
        assert!(actor.has_tag(&Tag::new_static("species.goblin")));
        assert_eq!(actor.name(), "goblin");
    }

    #[test]
    fn actor_ids_are_unique() {
        let a = Actor::builder("a").build();
        let b = Actor::builder("b").build();
        assert_ne!(a.id(), b.id());
    }
}
