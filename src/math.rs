use serde::{Deserialize, Serialize};

/// Slack used when comparing accumulated time against periodic deadlines,
/// so that repeated `f64` addition does not skip a tick.
pub(crate) const TIME_EPSILON: f64 = 1e-4;

/// Channel evaluation carries `f32` intermediates; integer results are taken
/// by flooring once at the exit of the pipeline.
pub(crate) fn floor_to_i32(value: f32) -> i32 {
    value.floor() as i32
}

/// A piecewise-linear lookup curve over effect level.
///
/// Keys are `(level, multiplier)` pairs kept sorted by level. Evaluation
/// interpolates between neighbouring keys and clamps outside the key range.
/// An empty curve evaluates to `1.0` everywhere.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    keys: Vec<(f32, f32)>,
}

impl Curve {
    pub fn new(mut keys: Vec<(f32, f32)>) -> Self {
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { keys }
    }

    /// A curve with a single key, constant everywhere.
    pub fn constant(value: f32) -> Self {
        Self {
            keys: vec![(0.0, value)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn eval(&self, level: f32) -> f32 {
        let Some(first) = self.keys.first() else {
            return 1.0;
        };
        if level <= first.0 {
            return first.1;
        }
        let last = self.keys.last().unwrap();
        if level >= last.0 {
            return last.1;
        }

        let upper = self
            .keys
            .iter()
            .position(|(key_level, _)| *key_level >= level)
            .unwrap();
        let (x1, y1) = self.keys[upper - 1];
        let (x2, y2) = self.keys[upper];
        if (x2 - x1).abs() < f32::EPSILON {
            return y2;
        }
        let t = (level - x1) / (x2 - x1);
        y1 + (y2 - y1) * t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_curve_is_identity() {
        let curve = Curve::default();
        assert_eq!(curve.eval(0.0), 1.0);
        assert_eq!(curve.eval(17.0), 1.0);
    }

    #[test]
    fn clamps_outside_key_range() {
        let curve = Curve::new(vec![(1.0, 10.0), (5.0, 50.0)]);
        assert_eq!(curve.eval(0.0), 10.0);
        assert_eq!(curve.eval(9.0), 50.0);
    }

    #[test]
    fn interpolates_between_keys() {
        let curve = Curve::new(vec![(1.0, 10.0), (5.0, 50.0)]);
        assert_eq!(curve.eval(3.0), 30.0);
    }

    #[test]
    fn unsorted_keys_are_sorted_on_construction() {
        let curve = Curve::new(vec![(5.0, 50.0), (1.0, 10.0)]);
        assert_eq!(curve.eval(2.0), 20.0);
    }

    #[test]
    fn floor_is_toward_negative_infinity() {
        assert_eq!(floor_to_i32(2.9), 2);
        assert_eq!(floor_to_i32(-2.1), -3);
    }
}
