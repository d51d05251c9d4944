use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tracing::debug;

use super::{Attribute, AttributeKey};

/// Declares one attribute field within a set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: SmolStr,
    pub base: i32,
    pub min: i32,
    pub max: i32,
    pub channels: usize,
}

impl AttributeDef {
    pub fn new(name: impl Into<SmolStr>, base: i32) -> Self {
        Self {
            name: name.into(),
            base,
            min: i32::MIN,
            max: i32::MAX,
            channels: 1,
        }
    }

    pub fn range(mut self, min: i32, max: i32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }
}

/// A named group of attribute definitions, instantiated per actor.
///
/// The set name becomes the prefix of every field's fully-qualified key:
/// `AttributeSetDef::new("Combat")` with a `"Health"` field installs the
/// attribute `"Combat.Health"`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSetDef {
    pub name: SmolStr,
    pub attributes: Vec<AttributeDef>,
}

impl AttributeSetDef {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attribute(mut self, def: AttributeDef) -> Self {
        self.attributes.push(def);
        self
    }

    pub fn key_for(&self, field: &str) -> AttributeKey {
        AttributeKey::new(SmolStr::new(format!("{}.{}", self.name, field)))
    }
}

/// The attributes owned by one actor, keyed by fully-qualified name.
///
/// Insertion order is retained so that flush sweeps visit attributes
/// deterministically.
#[derive(Default)]
pub struct AttributeMap {
    attributes: HashMap<AttributeKey, Attribute>,
    order: Vec<AttributeKey>,
}

impl AttributeMap {
    pub fn install(&mut self, set: &AttributeSetDef) {
        for def in &set.attributes {
            let key = set.key_for(&def.name);
            debug_assert!(
                !self.attributes.contains_key(&key),
                "attribute {key} installed twice"
            );
            debug!(attribute = %key, "installing attribute");
            self.order.push(key.clone());
            self.attributes.insert(
                key.clone(),
                Attribute::new(key, def.base, def.min, def.max, def.channels),
            );
        }
    }

    pub fn get(&self, key: &AttributeKey) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    pub fn get_mut(&mut self, key: &AttributeKey) -> Option<&mut Attribute> {
        self.attributes.get_mut(key)
    }

    pub fn contains(&self, key: &AttributeKey) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in installation order.
    pub fn keys(&self) -> &[AttributeKey] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.order.iter().filter_map(|key| self.attributes.get(key))
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|attr| (attr.key(), attr.current_value())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_prefixes_keys_with_set_name() {
        let set = AttributeSetDef::new("Combat")
            .attribute(AttributeDef::new("Health", 100).range(0, 100))
            .attribute(AttributeDef::new("Attack", 10).range(0, 1000).channels(2));

        let mut map = AttributeMap::default();
        map.install(&set);

        assert_eq!(map.len(), 2);
        let health = map.get(&AttributeKey::new_static("Combat.Health")).unwrap();
        assert_eq!(health.current_value(), 100);
        let attack = map.get(&AttributeKey::new_static("Combat.Attack")).unwrap();
        assert_eq!(attack.channel_count(), 2);
    }

    #[test]
    fn keys_keep_installation_order() {
        let set = AttributeSetDef::new("Core")
            .attribute(AttributeDef::new("Speed", 5))
            .attribute(AttributeDef::new("Armor", 3));

        let mut map = AttributeMap::default();
        map.install(&set);

        let keys: Vec<_> = map.keys().iter().map(|key| key.as_str()).collect();
        assert_eq!(keys, ["Core.Speed", "Core.Armor"]);
    }
}
