use serde::{Deserialize, Serialize};

use crate::types::{Measured, Severity};

/// Optical power bands in dBm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub critical_low: f64,
    pub warning_low: f64,
    pub warning_high: f64,
    pub critical_high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            critical_low: -25.0,
            warning_low: -20.0,
            warning_high: -8.0,
            critical_high: -3.0,
        }
    }
}

impl Thresholds {
    pub fn is_ordered(&self) -> bool {
        self.critical_low <= self.warning_low
            && self.warning_low <= self.warning_high
            && self.warning_high <= self.critical_high
    }

    fn level(&self, dbm: f64) -> Severity {
        if dbm < self.critical_low || dbm > self.critical_high {
            Severity::Critical
        } else if dbm < self.warning_low || dbm > self.warning_high {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }

    /// Worst of the rx/tx levels; `Unknown` when neither has a value.
    pub fn classify(&self, rx: Option<Measured<f64>>, tx: Option<Measured<f64>>) -> Severity {
        [rx, tx]
            .into_iter()
            .flatten()
            .filter_map(|m| m.value())
            .map(|v| self.level(v))
            .max()
            .unwrap_or(Severity::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f64) -> Option<Measured<f64>> {
        Some(Measured::Value(x))
    }

    #[test]
    fn bands() {
        let t = Thresholds::default();
        assert_eq!(t.classify(v(-12.5), v(-10.0)), Severity::Normal);
        assert_eq!(t.classify(v(-21.0), v(-10.0)), Severity::Warning);
        assert_eq!(t.classify(v(-12.5), v(-2.0)), Severity::Critical);
        assert_eq!(t.classify(v(-30.0), None), Severity::Critical);
    }

    #[test]
    fn unknown_without_values() {
        let t = Thresholds::default();
        assert_eq!(t.classify(None, None), Severity::Unknown);
        assert_eq!(t.classify(Some(Measured::Unknown), None), Severity::Unknown);
    }
}
