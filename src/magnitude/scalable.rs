use serde::{Deserialize, Serialize};

use crate::math::{Curve, floor_to_i32};

/// A float that scales with effect level through an optional curve.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalableFloat {
    pub base: f32,
    pub curve: Option<Curve>,
}

impl ScalableFloat {
    pub fn new(base: f32) -> Self {
        Self { base, curve: None }
    }

    pub fn with_curve(base: f32, curve: Curve) -> Self {
        Self {
            base,
            curve: Some(curve),
        }
    }

    pub fn eval(&self, level: i32) -> f32 {
        match &self.curve {
            Some(curve) => self.base * curve.eval(level as f32),
            None => self.base,
        }
    }
}

impl From<f32> for ScalableFloat {
    fn from(base: f32) -> Self {
        Self::new(base)
    }
}

/// An integer that scales with effect level; the scaled value is floored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalableInt {
    pub base: i32,
    pub curve: Option<Curve>,
}

impl ScalableInt {
    pub fn new(base: i32) -> Self {
        Self { base, curve: None }
    }

    pub fn with_curve(base: i32, curve: Curve) -> Self {
        Self {
            base,
            curve: Some(curve),
        }
    }

    pub fn eval(&self, level: i32) -> i32 {
        match &self.curve {
            Some(curve) => floor_to_i32(self.base as f32 * curve.eval(level as f32)),
            None => self.base,
        }
    }
}

impl From<i32> for ScalableInt {
    fn from(base: i32) -> Self {
        Self::new(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curveless_values_ignore_level() {
        assert_eq!(ScalableFloat::new(2.5).eval(1), 2.5);
        assert_eq!(ScalableFloat::new(2.5).eval(90), 2.5);
    }

    #[test]
    fn curve_scales_by_level() {
        let scaled = ScalableFloat::with_curve(10.0, Curve::new(vec![(1.0, 1.0), (3.0, 2.0)]));
        assert_eq!(scaled.eval(1), 10.0);
        assert_eq!(scaled.eval(2), 15.0);
        assert_eq!(scaled.eval(3), 20.0);
    }

    #[test]
    fn scaled_ints_floor() {
        let scaled = ScalableInt::with_curve(3, Curve::new(vec![(1.0, 1.0), (2.0, 1.5)]));
        assert_eq!(scaled.eval(1), 3);
        assert_eq!(scaled.eval(2), 4);
    }
}
