use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use smol_str::SmolStr;

use crate::subscription::{EffectSubscriber, SubscriptionKey};

/// An opaque gameplay tag.
///
/// Tags are dotted names such as `"status.poisoned"` interned as [`SmolStr`].
/// The engine only compares tags for equality; hierarchical queries belong to
/// the host's tag registry.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(SmolStr);

impl Tag {
    pub const fn new(text: SmolStr) -> Self {
        Self(text)
    }

    pub const fn new_static(text: &'static str) -> Self {
        Self(SmolStr::new_static(text))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for Tag {
    fn from(text: &str) -> Self {
        Self(SmolStr::new(text))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:?})", self.0)
    }
}

/// The set of tags present on an actor.
///
/// Tags are reference counted so that several effects may grant the same tag
/// and the tag survives until the last grant is released. Membership changes
/// raise a change flag which the effects manager drains once per top-level
/// operation, mirroring the attribute flush.
#[derive(Default)]
pub struct TagContainer {
    counts: HashMap<Tag, u32>,
    pub(crate) subscribers: SlotMap<SubscriptionKey, EffectSubscriber>,
    pub(crate) changed: bool,
}

impl TagContainer {
    pub fn has(&self, tag: &Tag) -> bool {
        self.counts.contains_key(tag)
    }

    pub fn has_all<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> bool {
        tags.into_iter().all(|tag| self.has(tag))
    }

    pub fn has_any<'a>(&self, tags: impl IntoIterator<Item = &'a Tag>) -> bool {
        tags.into_iter().any(|tag| self.has(tag))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.counts.keys()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Adds one grant of `tag`. Returns true when the tag newly appeared.
    pub(crate) fn add(&mut self, tag: Tag) -> bool {
        let count = self.counts.entry(tag).or_insert(0);
        *count += 1;
        let appeared = *count == 1;
        if appeared {
            self.changed = true;
        }
        appeared
    }

    /// Releases one grant of `tag`. Returns true when the tag disappeared.
    pub(crate) fn remove(&mut self, tag: &Tag) -> bool {
        let Some(count) = self.counts.get_mut(tag) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(tag);
            self.changed = true;
            return true;
        }
        false
    }

    pub(crate) fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

impl fmt::Debug for TagContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.counts.keys()).finish()
    }
}

/// A requirement clause over an actor's tags: every `require` tag must be
/// present and no `ignore` tag may be.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagRequirements {
    pub require: Vec<Tag>,
    pub ignore: Vec<Tag>,
}

impl TagRequirements {
    pub fn require(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            require: tags.into_iter().collect(),
            ignore: Vec::new(),
        }
    }

    pub fn ignore(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            require: Vec::new(),
            ignore: tags.into_iter().collect(),
        }
    }

    pub fn and_ignore(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.ignore.extend(tags);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.require.is_empty() && self.ignore.is_empty()
    }

    pub fn requirements_met(&self, container: &TagContainer) -> bool {
        container.has_all(&self.require) && !container.has_any(&self.ignore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_grants_survive_partial_release() {
        let mut container = TagContainer::default();
        let tag = Tag::new_static("status.burning");

        assert!(container.add(tag.clone()));
        assert!(!container.add(tag.clone()));
        assert!(!container.remove(&tag));
        assert!(container.has(&tag));
        assert!(container.remove(&tag));
        assert!(!container.has(&tag));
    }

    #[test]
    fn change_flag_tracks_membership_not_counts() {
        let mut container = TagContainer::default();
        let tag = Tag::new_static("status.rooted");

        container.add(tag.clone());
        assert!(container.take_changed());

        container.add(tag.clone());
        assert!(!container.take_changed());

        container.remove(&tag);
        assert!(!container.take_changed());
        container.remove(&tag);
        assert!(container.take_changed());
    }

    #[test]
    fn requirements_check_both_clauses() {
        let mut container = TagContainer::default();
        container.add(Tag::new_static("class.mage"));

        let met = TagRequirements::require([Tag::new_static("class.mage")])
            .and_ignore([Tag::new_static("status.silenced")]);
        assert!(met.requirements_met(&container));

        container.add(Tag::new_static("status.silenced"));
        assert!(!met.requirements_met(&container));
    }
}
