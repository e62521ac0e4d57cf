//! Risk status classification
//!
//! Global invariants enforced:
//! - Deterministic bucketing
//! - Monotone: a higher `risk_percent` never yields a lower status

use serde::Serialize;

/// Status bucket shown next to a risk percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskStatus {
    Normal,  // < 50
    Warning, // 50-80
    Alert,   // >= 80
}

impl RiskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskStatus::Normal => "normal",
            RiskStatus::Warning => "warning",
            RiskStatus::Alert => "alert",
        }
    }
}

/// Configurable status thresholds, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusThresholds {
    pub warning: f64,
    pub alert: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        StatusThresholds {
            warning: 50.0,
            alert: 80.0,
        }
    }
}

/// Assign a status to a risk percentage
pub fn assign_status(risk_percent: f64, thresholds: &StatusThresholds) -> RiskStatus {
    if risk_percent >= thresholds.alert {
        RiskStatus::Alert
    } else if risk_percent >= thresholds.warning {
        RiskStatus::Warning
    } else {
        RiskStatus::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_boundaries() {
        let t = StatusThresholds::default();
        assert_eq!(assign_status(0.0, &t), RiskStatus::Normal);
        assert_eq!(assign_status(49.99, &t), RiskStatus::Normal);
        assert_eq!(assign_status(50.0, &t), RiskStatus::Warning);
        assert_eq!(assign_status(79.9, &t), RiskStatus::Warning);
        assert_eq!(assign_status(80.0, &t), RiskStatus::Alert);
        assert_eq!(assign_status(100.0, &t), RiskStatus::Alert);
    }

    #[test]
    fn test_custom_thresholds() {
        let t = StatusThresholds {
            warning: 10.0,
            alert: 20.0,
        };
        assert_eq!(assign_status(15.0, &t), RiskStatus::Warning);
        assert_eq!(assign_status(25.0, &t), RiskStatus::Alert);
        assert_eq!(RiskStatus::Alert.as_str(), "alert");
    }
}
