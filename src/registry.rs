use std::collections::HashMap;
use std::rc::Rc;

use smol_str::SmolStr;

use crate::effect::EffectData;

/// Stable name under which an effect configuration is registered.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EffectToken(SmolStr);

impl EffectToken {
    /// Construct a new [`EffectToken`] from a [`SmolStr`].
    pub const fn new(text: SmolStr) -> Self {
        Self(text)
    }

    /// Construct a new [`EffectToken`] from a static string.
    pub const fn new_static(text: &'static str) -> Self {
        Self(SmolStr::new_static(text))
    }
}

impl core::fmt::Display for EffectToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::fmt::Debug for EffectToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EffectToken({:?})", self.0)
    }
}

/// Interns shared effect configurations for host tooling.
///
/// [`EffectData`]'s structural equality means a registry lookup hands every
/// caller the same `Rc`, which in turn makes peer matching during stacking a
/// pointer comparison.
#[derive(Default)]
pub struct EffectRegistry {
    map: HashMap<EffectToken, Rc<EffectData>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, token: EffectToken, data: Rc<EffectData>) {
        self.map.insert(token, data);
    }

    pub fn get(&self, token: &EffectToken) -> &Rc<EffectData> {
        self.map
            .get(token)
            .unwrap_or_else(|| panic!("{token:?} not registered"))
    }

    pub fn try_get(&self, token: &EffectToken) -> Option<&Rc<EffectData>> {
        self.map.get(token)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectBuilder;

    #[test]
    fn interned_effects_share_one_rc() {
        let mut registry = EffectRegistry::new();
        let token = EffectToken::new_static("test.buff");
        let data = EffectBuilder::infinite().name("buff").build().unwrap();
        registry.add(token.clone(), Rc::clone(&data));

        assert!(Rc::ptr_eq(registry.get(&token), &data));
        assert!(registry.try_get(&EffectToken::new_static("test.unknown")).is_none());
    }
}
