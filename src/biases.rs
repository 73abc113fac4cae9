//! Bias potentials applied to the simulated thermodynamic states.

use std::fmt;

/// Order parameter tag holding the number of stacked domain pairs
pub const STACKED_PAIRS_TAG: &str = "numstackedpairs";

/// Order parameter tag holding the summed distance of restrained domain pairs
pub const DISTANCE_SUM_TAG: &str = "dist-sum";

/// Energy bias applied at a condition, in units of $k_B K$.
///
/// Biases are compared by value, so two conditions carrying equal bias parameters are the
/// same condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bias {
    /// No bias; contributes zero energy
    NoBias,
    /// Scaled stacking energy
    Stacking(StackingBias),
    /// Linear ramp on the summed distance between restrained domain pairs
    Distance(DistanceBias),
}

impl Default for Bias {
    fn default() -> Self {
        Self::NoBias
    }
}

impl Bias {
    /// Bias energy of a configuration whose biased order parameter has value `op`
    pub fn energy(&self, op: f64) -> f64 {
        match self {
            Self::NoBias => 0.0,
            Self::Stacking(bias) => bias.energy(op),
            Self::Distance(bias) => bias.energy(op),
        }
    }

    /// Tag of the order parameter that the bias is a function of, if any
    pub fn order_parameter_tag(&self) -> Option<&'static str> {
        match self {
            Self::NoBias => None,
            Self::Stacking(_) => Some(STACKED_PAIRS_TAG),
            Self::Distance(_) => Some(DISTANCE_SUM_TAG),
        }
    }

    /// Value rendered into file names for conditions carrying this bias
    pub fn file_value(&self) -> Option<f64> {
        match self {
            Self::NoBias => None,
            Self::Stacking(bias) => Some(bias.multiplier),
            Self::Distance(bias) => Some(bias.multiplier),
        }
    }
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBias => write!(f, "none"),
            Self::Stacking(bias) => write!(
                f,
                "stacking({} x {})",
                bias.stack_energy, bias.multiplier
            ),
            Self::Distance(bias) => write!(
                f,
                "distance({}..{}, {} x {})",
                bias.min_dist, bias.max_dist, bias.max_bias, bias.multiplier
            ),
        }
    }
}

/// Stacking energy multiplied by a per-condition factor
///
/// The order parameter is the number of stacked pairs, so the bias is
/// $E_\mathrm{stack} \lambda N_\mathrm{stacked}$.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackingBias {
    /// Energy of a single stacked pair
    pub stack_energy: f64,
    /// Multiplier applied at this condition
    pub multiplier: f64,
}

impl StackingBias {
    #[allow(missing_docs)]
    pub fn new(stack_energy: f64, multiplier: f64) -> Self {
        Self {
            stack_energy,
            multiplier,
        }
    }

    fn energy(&self, stacked_pairs: f64) -> f64 {
        self.stack_energy * self.multiplier * stacked_pairs
    }
}

impl From<StackingBias> for Bias {
    fn from(bias: StackingBias) -> Self {
        Self::Stacking(bias)
    }
}

/// Bias that switches on linearly between two summed domain distances
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceBias {
    /// Distance at or below which the bias is off
    pub min_dist: f64,
    /// Distance at or above which the bias is at its maximum
    pub max_dist: f64,
    /// Value of the bias at `max_dist` and beyond
    pub max_bias: f64,
    /// Total bias multiplier
    pub multiplier: f64,
}

impl DistanceBias {
    #[allow(missing_docs)]
    pub fn new(min_dist: f64, max_dist: f64, max_bias: f64, multiplier: f64) -> Self {
        Self {
            min_dist,
            max_dist,
            max_bias,
            multiplier,
        }
    }

    fn energy(&self, dist: f64) -> f64 {
        let ramp = if dist <= self.min_dist {
            0.0
        } else if dist >= self.max_dist {
            self.max_bias
        } else {
            self.max_bias * (dist - self.min_dist) / (self.max_dist - self.min_dist)
        };

        self.multiplier * ramp
    }
}

impl From<DistanceBias> for Bias {
    fn from(bias: DistanceBias) -> Self {
        Self::Distance(bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn no_bias_is_zero() {
        for op in &[0.0, 3.0, -7.5, 1e6] {
            assert_eq!(Bias::NoBias.energy(*op), 0.0);
        }
        assert_eq!(Bias::NoBias.order_parameter_tag(), None);
        assert_eq!(Bias::NoBias.file_value(), None);
    }

    #[test]
    fn stacking_bias_scales_with_stacked_pairs() {
        let bias: Bias = StackingBias::new(-1200.0, 0.5).into();
        assert_abs_diff_eq!(bias.energy(0.0), 0.0);
        assert_abs_diff_eq!(bias.energy(4.0), -2400.0);
        assert_eq!(bias.order_parameter_tag(), Some(STACKED_PAIRS_TAG));
        assert_eq!(bias.file_value(), Some(0.5));
    }

    #[test]
    fn distance_bias_ramps_between_bounds() {
        let bias: Bias = DistanceBias::new(2.0, 6.0, 100.0, 2.0).into();

        assert_abs_diff_eq!(bias.energy(1.0), 0.0);
        assert_abs_diff_eq!(bias.energy(2.0), 0.0);
        assert_abs_diff_eq!(bias.energy(4.0), 100.0);
        assert_abs_diff_eq!(bias.energy(6.0), 200.0);
        assert_abs_diff_eq!(bias.energy(60.0), 200.0);
        assert_eq!(bias.order_parameter_tag(), Some(DISTANCE_SUM_TAG));
        assert_eq!(bias.file_value(), Some(2.0));
    }

    #[test]
    fn biases_compare_by_value() {
        assert_eq!(
            Bias::from(StackingBias::new(-1000.0, 1.0)),
            Bias::from(StackingBias::new(-1000.0, 1.0))
        );
        assert_ne!(
            Bias::from(StackingBias::new(-1000.0, 1.0)),
            Bias::from(StackingBias::new(-1000.0, 0.9))
        );
        assert_ne!(Bias::from(StackingBias::new(-1000.0, 0.0)), Bias::NoBias);
    }
}
