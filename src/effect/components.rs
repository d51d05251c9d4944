use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::actor::Actor;
use crate::effect::runtime::RuntimeEffect;
use crate::magnitude::ScalableFloat;
use crate::manager::EffectHandle;
use crate::tag::{Tag, TagRequirements};

/// Host extension points on an effect's lifecycle. Every hook defaults to a
/// no-op; hooks are invoked with no engine borrow held, so they may call
/// back into the engine (remove the effect, apply another, flip inhibition).
pub trait EffectComponent {
    /// Admission veto. A false return rejects the application with no
    /// observable side effects.
    fn can_apply(&self, target: &Actor, effect: &RuntimeEffect) -> bool {
        let _ = (target, effect);
        true
    }

    /// Raised when the active effect has been evaluated but not yet
    /// attached. Returning false requests inhibition at application time.
    fn on_active_effect_added(&self, target: &Actor, effect: &EffectHandle) -> bool {
        let _ = (target, effect);
        true
    }

    fn on_post_active_effect_added(&self, target: &Actor, effect: &EffectHandle) {
        let _ = (target, effect);
    }

    /// `removed` distinguishes full removal from a single lost stack.
    fn on_active_effect_unapplied(&self, target: &Actor, effect: &EffectHandle, removed: bool) {
        let _ = (target, effect, removed);
    }

    /// Raised on inhibition flips and level or stack changes.
    fn on_active_effect_changed(&self, target: &Actor, effect: &EffectHandle) {
        let _ = (target, effect);
    }

    /// Raised for the initial application and every stack application.
    fn on_effect_applied(&self, target: &Actor, effect: &RuntimeEffect) {
        let _ = (target, effect);
    }

    /// Raised for instant applications and periodic executions.
    fn on_effect_executed(&self, target: &Actor, effect: &RuntimeEffect) {
        let _ = (target, effect);
    }
}

/// Grants tags on the target while the effect is active.
///
/// Grants are reference counted by the tag container, so overlapping effects
/// may grant the same tag. Invalid on instant effects, which have no active
/// lifetime to scope the grant to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModifierTagsComponent {
    pub tags: Vec<Tag>,
}

impl ModifierTagsComponent {
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }
}

/// Gates an effect on the target's tags through its whole lifetime.
///
/// `application` admits or rejects; `removal` removes the active effect the
/// moment it is met; `ongoing` inhibits while unmet. The engine keeps a
/// tag-change subscription for the removal and ongoing clauses.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetTagRequirementsComponent {
    pub application: TagRequirements,
    pub removal: TagRequirements,
    pub ongoing: TagRequirements,
}

impl TargetTagRequirementsComponent {
    pub fn application(requirements: TagRequirements) -> Self {
        Self {
            application: requirements,
            ..Self::default()
        }
    }

    pub fn removal(mut self, requirements: TagRequirements) -> Self {
        self.removal = requirements;
        self
    }

    pub fn ongoing(mut self, requirements: TagRequirements) -> Self {
        self.ongoing = requirements;
        self
    }

    pub(crate) fn is_reactive(&self) -> bool {
        !self.removal.is_empty() || !self.ongoing.is_empty()
    }
}

/// Probabilistic admission through the actor's injected RNG.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChanceToApplyComponent {
    /// Probability in `[0, 1]`, level-evaluated.
    pub chance: ScalableFloat,
}

impl ChanceToApplyComponent {
    pub fn new(chance: impl Into<ScalableFloat>) -> Self {
        Self {
            chance: chance.into(),
        }
    }
}

/// Grants an ability through the external abilities collaborator while the
/// effect is active.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrantAbilityComponent {
    pub ability: SmolStr,
}

impl GrantAbilityComponent {
    pub fn new(ability: impl Into<SmolStr>) -> Self {
        Self {
            ability: ability.into(),
        }
    }
}

/// The abilities subsystem as seen from the engine.
pub trait AbilityGrants {
    fn grant(&self, target: &Actor, ability: &str);
    fn revoke(&self, target: &Actor, ability: &str);
}

/// The sealed set of component capabilities an effect can carry.
///
/// The shipped variants are engine-integrated: their semantics (tag grants,
/// requirement gating, chance rolls, ability grants) run inside the engine
/// against per-application state held on the active effect. `Custom` carries
/// a shared [`EffectComponent`] for host extensions.
#[derive(Clone)]
pub enum EffectComponentDef {
    ModifierTags(ModifierTagsComponent),
    TargetTagRequirements(TargetTagRequirementsComponent),
    ChanceToApply(ChanceToApplyComponent),
    GrantAbility(GrantAbilityComponent),
    Custom(Rc<dyn EffectComponent>),
}

impl EffectComponentDef {
    pub fn modifier_tags(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self::ModifierTags(ModifierTagsComponent::new(tags))
    }

    pub fn chance_to_apply(chance: impl Into<ScalableFloat>) -> Self {
        Self::ChanceToApply(ChanceToApplyComponent::new(chance))
    }

    pub fn grant_ability(ability: impl Into<SmolStr>) -> Self {
        Self::GrantAbility(GrantAbilityComponent::new(ability))
    }

    pub fn custom(component: Rc<dyn EffectComponent>) -> Self {
        Self::Custom(component)
    }

    pub(crate) fn as_custom(&self) -> Option<&Rc<dyn EffectComponent>> {
        match self {
            Self::Custom(component) => Some(component),
            _ => None,
        }
    }
}

impl fmt::Debug for EffectComponentDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModifierTags(component) => f.debug_tuple("ModifierTags").field(component).finish(),
            Self::TargetTagRequirements(component) => {
                f.debug_tuple("TargetTagRequirements").field(component).finish()
            }
            Self::ChanceToApply(component) => {
                f.debug_tuple("ChanceToApply").field(component).finish()
            }
            Self::GrantAbility(component) => f.debug_tuple("GrantAbility").field(component).finish(),
            Self::Custom(component) => f
                .debug_tuple("Custom")
                .field(&Rc::as_ptr(component))
                .finish(),
        }
    }
}

impl PartialEq for EffectComponentDef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ModifierTags(a), Self::ModifierTags(b)) => a == b,
            (Self::TargetTagRequirements(a), Self::TargetTagRequirements(b)) => a == b,
            (Self::ChanceToApply(a), Self::ChanceToApply(b)) => a == b,
            (Self::GrantAbility(a), Self::GrantAbility(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Hash for EffectComponentDef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::ModifierTags(component) => component.tags.hash(state),
            Self::TargetTagRequirements(component) => {
                component.application.require.hash(state);
                component.application.ignore.hash(state);
                component.removal.require.hash(state);
                component.ongoing.require.hash(state);
            }
            Self::ChanceToApply(component) => component.chance.base.to_bits().hash(state),
            Self::GrantAbility(component) => component.ability.hash(state),
            Self::Custom(component) => {
                (Rc::as_ptr(component) as *const () as usize).hash(state);
            }
        }
    }
}
