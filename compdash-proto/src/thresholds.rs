//! Good/warning/critical threshold triples for the dashboard rings.

use serde::{Deserialize, Serialize};

/// Invariant: `0 <= good <= warning <= critical <= max_value`, enforced by
/// [`Thresholds::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub good: f64,
    pub warning: f64,
    pub critical: f64,
}

impl Thresholds {
    /// Defaults for CPU temperature in Celsius.
    pub fn temperature_default() -> Self {
        Self {
            good: 60.0,
            warning: 75.0,
            critical: 85.0,
        }
    }

    /// Defaults for CPU usage percent.
    pub fn cpu_default() -> Self {
        Self {
            good: 50.0,
            warning: 75.0,
            critical: 90.0,
        }
    }

    /// Clamp the triple in place so the ordering invariant holds.
    pub fn validate(&mut self, max_value: f64) {
        self.good = self.good.clamp(0.0, max_value);
        self.warning = self.warning.clamp(self.good, max_value);
        self.critical = self.critical.clamp(self.warning, max_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_triple_is_untouched() {
        let mut t = Thresholds::temperature_default();
        t.validate(110.0);
        assert_eq!(t, Thresholds::temperature_default());
    }

    #[test]
    fn out_of_order_triple_is_clamped() {
        let mut t = Thresholds {
            good: 80.0,
            warning: 40.0,
            critical: 200.0,
        };
        t.validate(100.0);
        assert_eq!(t.good, 80.0);
        assert_eq!(t.warning, 80.0);
        assert_eq!(t.critical, 100.0);
    }

    #[test]
    fn negative_values_are_raised_to_zero() {
        let mut t = Thresholds {
            good: -10.0,
            warning: -5.0,
            critical: -1.0,
        };
        t.validate(100.0);
        assert_eq!(t.good, 0.0);
        assert_eq!(t.warning, 0.0);
        assert_eq!(t.critical, 0.0);
    }
}
