mod capture;
mod custom;
mod scalable;

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use tracing::warn;

use crate::math::Curve;
use crate::tag::Tag;

pub use capture::{AttributeCalculation, AttributeCapture, CaptureKey, Who};
pub use custom::{CalculationContext, CustomCalculator, CustomExecution, ExecutionContext};
pub use scalable::{ScalableFloat, ScalableInt};

pub(crate) use capture::{EvalSides, SourceAttributes};
pub(crate) use custom::RequestedMutation;

/// An attribute-captured magnitude: `coefficient · (pre_add + captured) +
/// post_add`, all affine terms level-evaluated.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeBasedMagnitude {
    pub capture: AttributeCapture,
    pub calculation: AttributeCalculation,
    /// Channel bound for `MagnitudeEvaluatedUpToChannel`; all channels when
    /// unset.
    pub final_channel: Option<u8>,
    pub coefficient: ScalableFloat,
    pub pre_add: ScalableFloat,
    pub post_add: ScalableFloat,
}

impl AttributeBasedMagnitude {
    pub fn new(capture: AttributeCapture, calculation: AttributeCalculation) -> Self {
        Self {
            capture,
            calculation,
            final_channel: None,
            coefficient: ScalableFloat::new(1.0),
            pre_add: ScalableFloat::new(0.0),
            post_add: ScalableFloat::new(0.0),
        }
    }

    pub fn coefficient(mut self, coefficient: impl Into<ScalableFloat>) -> Self {
        self.coefficient = coefficient.into();
        self
    }

    pub fn pre_add(mut self, pre_add: impl Into<ScalableFloat>) -> Self {
        self.pre_add = pre_add.into();
        self
    }

    pub fn post_add(mut self, post_add: impl Into<ScalableFloat>) -> Self {
        self.post_add = post_add.into();
        self
    }

    pub fn final_channel(mut self, channel: u8) -> Self {
        self.final_channel = Some(channel);
        self
    }

    pub(crate) fn capture_key(&self) -> CaptureKey {
        CaptureKey {
            attribute: self.capture.attribute.clone(),
            who: self.capture.who,
            calculation: self.calculation,
            final_channel: self.final_channel,
        }
    }
}

/// A calculator-backed magnitude with the same affine shell as
/// [`AttributeBasedMagnitude`], optionally post-mapped through a curve.
#[derive(Clone)]
pub struct CustomMagnitude {
    pub calculator: Rc<dyn CustomCalculator>,
    pub coefficient: ScalableFloat,
    pub pre_add: ScalableFloat,
    pub post_add: ScalableFloat,
    pub lookup_curve: Option<Curve>,
}

impl CustomMagnitude {
    pub fn new(calculator: Rc<dyn CustomCalculator>) -> Self {
        Self {
            calculator,
            coefficient: ScalableFloat::new(1.0),
            pre_add: ScalableFloat::new(0.0),
            post_add: ScalableFloat::new(0.0),
            lookup_curve: None,
        }
    }

    pub fn coefficient(mut self, coefficient: impl Into<ScalableFloat>) -> Self {
        self.coefficient = coefficient.into();
        self
    }

    pub fn pre_add(mut self, pre_add: impl Into<ScalableFloat>) -> Self {
        self.pre_add = pre_add.into();
        self
    }

    pub fn post_add(mut self, post_add: impl Into<ScalableFloat>) -> Self {
        self.post_add = post_add.into();
        self
    }

    pub fn lookup_curve(mut self, curve: Curve) -> Self {
        self.lookup_curve = Some(curve);
        self
    }
}

impl fmt::Debug for CustomMagnitude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomMagnitude")
            .field("calculator", &Rc::as_ptr(&self.calculator))
            .field("coefficient", &self.coefficient)
            .field("pre_add", &self.pre_add)
            .field("post_add", &self.post_add)
            .field("lookup_curve", &self.lookup_curve)
            .finish()
    }
}

impl PartialEq for CustomMagnitude {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.calculator, &other.calculator)
            && self.coefficient == other.coefficient
            && self.pre_add == other.pre_add
            && self.post_add == other.post_add
            && self.lookup_curve == other.lookup_curve
    }
}

/// How a modifier's scalar is computed.
#[derive(Clone, Debug, PartialEq)]
pub enum Magnitude {
    /// A constant scaled by level.
    Scalable(ScalableFloat),
    /// Captured from a source or target attribute.
    AttributeBased(AttributeBasedMagnitude),
    /// Produced by a host calculator.
    CustomCalculated(CustomMagnitude),
    /// Looked up in the runtime effect's caller map; missing tags read as
    /// zero.
    SetByCaller(Tag),
}

impl Magnitude {
    pub fn scalable(base: f32) -> Self {
        Self::Scalable(ScalableFloat::new(base))
    }

    pub fn set_by_caller(tag: impl Into<Tag>) -> Self {
        Self::SetByCaller(tag.into())
    }

    /// The backing attribute of a live (non-snapshot) capture, if this
    /// magnitude has one. Live captures keep a change subscription for the
    /// lifetime of the application.
    pub(crate) fn live_capture(&self) -> Option<(&AttributeCapture, AttributeCalculation)> {
        match self {
            Magnitude::AttributeBased(based) if !based.capture.snapshot => {
                Some((&based.capture, based.calculation))
            }
            _ => None,
        }
    }

    pub(crate) fn snapshot_capture(&self) -> Option<&AttributeBasedMagnitude> {
        match self {
            Magnitude::AttributeBased(based) if based.capture.snapshot => Some(based),
            _ => None,
        }
    }

    pub(crate) fn evaluate(&self, context: &MagnitudeContext<'_>) -> f32 {
        match self {
            Magnitude::Scalable(scalable) => scalable.eval(context.level),
            Magnitude::AttributeBased(based) => {
                let captured = context
                    .cached_capture(based)
                    .unwrap_or_else(|| {
                        context.sides.resolve(
                            &based.capture,
                            based.calculation,
                            based.final_channel,
                        )
                    });
                based.coefficient.eval(context.level)
                    * (based.pre_add.eval(context.level) + captured)
                    + based.post_add.eval(context.level)
            }
            Magnitude::CustomCalculated(custom) => {
                let calculation = CalculationContext {
                    sides: context.sides,
                    level: context.level,
                    stack_count: context.stack_count,
                    caller_magnitudes: context.caller_magnitudes,
                };
                let base = custom.calculator.calculate_base_magnitude(&calculation);
                let value = custom.coefficient.eval(context.level)
                    * (custom.pre_add.eval(context.level) + base)
                    + custom.post_add.eval(context.level);
                match &custom.lookup_curve {
                    Some(curve) => curve.eval(value),
                    None => value,
                }
            }
            Magnitude::SetByCaller(tag) => {
                context.caller_magnitudes.get(tag).copied().unwrap_or_else(|| {
                    warn!(%tag, "set-by-caller magnitude missing, reading as zero");
                    0.0
                })
            }
        }
    }
}

impl Hash for Magnitude {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Magnitude::Scalable(scalable) => {
                scalable.base.to_bits().hash(state);
            }
            Magnitude::AttributeBased(based) => {
                based.capture.hash(state);
                based.calculation.hash(state);
                based.final_channel.hash(state);
            }
            Magnitude::CustomCalculated(custom) => {
                (Rc::as_ptr(&custom.calculator) as *const () as usize).hash(state);
            }
            Magnitude::SetByCaller(tag) => {
                tag.hash(state);
            }
        }
    }
}

/// Everything a single magnitude evaluation can see.
pub(crate) struct MagnitudeContext<'a> {
    pub sides: &'a EvalSides<'a>,
    pub level: i32,
    pub stack_count: i32,
    pub caller_magnitudes: &'a HashMap<Tag, f32>,
    pub snapshot_cache: Option<&'a HashMap<CaptureKey, f32>>,
}

impl MagnitudeContext<'_> {
    fn cached_capture(&self, based: &AttributeBasedMagnitude) -> Option<f32> {
        if !based.capture.snapshot {
            return None;
        }
        self.snapshot_cache
            .and_then(|cache| cache.get(&based.capture_key()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeDef, AttributeMap, AttributeSetDef};

    fn combat_map() -> AttributeMap {
        let mut map = AttributeMap::default();
        map.install(
            &AttributeSetDef::new("Combat")
                .attribute(AttributeDef::new("Health", 100).range(0, 100))
                .attribute(AttributeDef::new("Strength", 12).range(0, 99)),
        );
        map
    }

    fn context<'a>(sides: &'a EvalSides<'a>, caller: &'a HashMap<Tag, f32>) -> MagnitudeContext<'a> {
        MagnitudeContext {
            sides,
            level: 2,
            stack_count: 1,
            caller_magnitudes: caller,
            snapshot_cache: None,
        }
    }

    #[test]
    fn attribute_based_applies_affine_form() {
        let map = combat_map();
        let sides = EvalSides::new(&map, SourceAttributes::SameAsTarget);
        let caller = HashMap::new();

        let magnitude = Magnitude::AttributeBased(
            AttributeBasedMagnitude::new(
                AttributeCapture::source("Combat.Strength"),
                AttributeCalculation::CurrentValue,
            )
            .coefficient(2.0)
            .pre_add(3.0)
            .post_add(-1.0),
        );

        // 2 * (3 + 12) - 1
        assert_eq!(magnitude.evaluate(&context(&sides, &caller)), 29.0);
    }

    #[test]
    fn missing_attribute_reads_as_zero() {
        let map = combat_map();
        let sides = EvalSides::new(&map, SourceAttributes::Gone);
        let caller = HashMap::new();

        let magnitude = Magnitude::AttributeBased(AttributeBasedMagnitude::new(
            AttributeCapture::source("Combat.Strength"),
            AttributeCalculation::CurrentValue,
        ));
        assert_eq!(magnitude.evaluate(&context(&sides, &caller)), 0.0);
    }

    #[test]
    fn set_by_caller_reads_map_or_zero() {
        let map = combat_map();
        let sides = EvalSides::new(&map, SourceAttributes::SameAsTarget);
        let mut caller = HashMap::new();
        caller.insert(Tag::new_static("data.damage"), 42.5);

        assert_eq!(
            Magnitude::set_by_caller("data.damage").evaluate(&context(&sides, &caller)),
            42.5
        );
        assert_eq!(
            Magnitude::set_by_caller("data.unset").evaluate(&context(&sides, &caller)),
            0.0
        );
    }

    #[test]
    fn snapshot_cache_wins_over_live_state() {
        let map = combat_map();
        let sides = EvalSides::new(&map, SourceAttributes::SameAsTarget);
        let caller = HashMap::new();

        let based = AttributeBasedMagnitude::new(
            AttributeCapture::source("Combat.Strength").snapshot(),
            AttributeCalculation::CurrentValue,
        );
        let mut cache = HashMap::new();
        cache.insert(based.capture_key(), 50.0);

        let context = MagnitudeContext {
            sides: &sides,
            level: 1,
            stack_count: 1,
            caller_magnitudes: &caller,
            snapshot_cache: Some(&cache),
        };
        assert_eq!(Magnitude::AttributeBased(based).evaluate(&context), 50.0);
    }

    #[test]
    fn custom_calculator_goes_through_lookup_curve() {
        struct FlatTen;
        impl CustomCalculator for FlatTen {
            fn calculate_base_magnitude(&self, _context: &CalculationContext<'_>) -> f32 {
                10.0
            }
        }

        let map = combat_map();
        let sides = EvalSides::new(&map, SourceAttributes::SameAsTarget);
        let caller = HashMap::new();

        let magnitude = Magnitude::CustomCalculated(
            CustomMagnitude::new(Rc::new(FlatTen))
                .coefficient(3.0)
                .lookup_curve(Curve::new(vec![(0.0, 0.0), (60.0, 120.0)])),
        );
        // 3 * 10 = 30, mapped through the curve to 60.
        assert_eq!(magnitude.evaluate(&context(&sides, &caller)), 60.0);
    }
}
