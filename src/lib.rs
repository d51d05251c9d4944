//! Forge is an engine-agnostic gameplay effects runtime.
//!
//! It models the numeric and temporal state of game entities: bounded,
//! channelled [attributes](attribute::Attribute), transient
//! [effects](effect::EffectData) that modify them under duration, periodic
//! and stacking rules, categorical [tags](tag::Tag), and presentation
//! [cues](cue::CueManager). There is no dependency on a rendering engine,
//! ECS or network stack; the host owns the clock and drives each actor's
//! [`EffectsManager`](manager::EffectsManager) from its own loop.
//!
//! ```
//! use forge::prelude::*;
//!
//! let target = Actor::builder("target")
//!     .with_set(
//!         AttributeSetDef::new("Combat")
//!             .attribute(AttributeDef::new("Health", 100).range(0, 100)),
//!     )
//!     .build();
//!
//! let strike = EffectBuilder::instant()
//!     .name("strike")
//!     .modify("Combat.Health", ModOp::FlatBonus, Magnitude::scalable(-25.0))
//!     .build()
//!     .unwrap();
//!
//! let effect = RuntimeEffect::new(&strike, 1, &target);
//! target.effects().apply(&effect);
//! assert_eq!(target.current_value(&"Combat.Health".into()), Some(75));
//! ```

pub mod actor;
pub mod attribute;
pub mod cue;
pub mod effect;
pub mod magnitude;
pub mod manager;
pub mod math;
pub mod registry;
pub mod tag;

mod subscription;

pub mod prelude {
    pub use crate::actor::{Actor, ActorBuilder, ActorId};
    pub use crate::attribute::{AttributeDef, AttributeKey, AttributeSetDef};
    pub use crate::cue::{CueData, CueHandler, CueMagnitude, CueManager, CueParameters};
    pub use crate::effect::{
        DurationPolicy, EffectBuilder, EffectComponent, EffectComponentDef, EffectData,
        InhibitionRemovedPolicy, ModOp, Modifier, PeriodicData, RuntimeEffect, StackingData,
    };
    pub use crate::magnitude::{
        AttributeBasedMagnitude, AttributeCalculation, AttributeCapture, Magnitude, ScalableFloat,
        ScalableInt, Who,
    };
    pub use crate::manager::{EffectHandle, EffectInfo, EffectsManager};
    pub use crate::math::Curve;
    pub use crate::registry::{EffectRegistry, EffectToken};
    pub use crate::tag::{Tag, TagRequirements};
}
