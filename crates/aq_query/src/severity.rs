//! Severity levels derived from anomaly scores

use aq_config::SeverityConfig;
use serde::{Deserialize, Serialize};

/// Ordered severity of an anomaly score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; 4] = [
        SeverityLevel::Low,
        SeverityLevel::Medium,
        SeverityLevel::High,
        SeverityLevel::Critical,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Low => "low",
            SeverityLevel::Medium => "medium",
            SeverityLevel::High => "high",
            SeverityLevel::Critical => "critical",
        }
    }
}

impl std::str::FromStr for SeverityLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "low" => Ok(SeverityLevel::Low),
            "medium" => Ok(SeverityLevel::Medium),
            "high" => Ok(SeverityLevel::High),
            "critical" => Ok(SeverityLevel::Critical),
            _ => Err(format!("unknown severity level: {value}")),
        }
    }
}

/// Lower bounds (inclusive) of the medium, high and critical bands
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self::from(&SeverityConfig::default())
    }
}

impl From<&SeverityConfig> for SeverityThresholds {
    fn from(config: &SeverityConfig) -> Self {
        Self {
            medium: config.medium,
            high: config.high,
            critical: config.critical,
        }
    }
}

impl SeverityThresholds {
    /// Map a score to its level. Total over every `f64`; anything below the
    /// medium bound (NaN included) is `Low`.
    #[must_use]
    pub fn classify(&self, score: f64) -> SeverityLevel {
        if score >= self.critical {
            SeverityLevel::Critical
        } else if score >= self.high {
            SeverityLevel::High
        } else if score >= self.medium {
            SeverityLevel::Medium
        } else {
            SeverityLevel::Low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_band_boundaries() {
        let t = SeverityThresholds::default();
        assert_eq!(t.classify(0.0), SeverityLevel::Low);
        assert_eq!(t.classify(24.999), SeverityLevel::Low);
        assert_eq!(t.classify(25.0), SeverityLevel::Medium);
        assert_eq!(t.classify(49.999), SeverityLevel::Medium);
        assert_eq!(t.classify(50.0), SeverityLevel::High);
        assert_eq!(t.classify(74.999), SeverityLevel::High);
        assert_eq!(t.classify(75.0), SeverityLevel::Critical);
        assert_eq!(t.classify(100.0), SeverityLevel::Critical);
    }

    #[test]
    fn test_custom_thresholds() {
        let t = SeverityThresholds {
            medium: 10.0,
            high: 20.0,
            critical: 90.0,
        };
        assert_eq!(t.classify(15.0), SeverityLevel::Medium);
        assert_eq!(t.classify(75.0), SeverityLevel::High);
    }

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(SeverityLevel::Low < SeverityLevel::Medium);
        assert!(SeverityLevel::High < SeverityLevel::Critical);
        for level in SeverityLevel::ALL {
            assert_eq!(level.as_str().parse::<SeverityLevel>().unwrap(), level);
        }
        assert!("extreme".parse::<SeverityLevel>().is_err());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&SeverityLevel::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }

    proptest! {
        #[test]
        fn classify_is_total_and_monotonic(a in 0.0f64..=100.0, b in 0.0f64..=100.0) {
            let t = SeverityThresholds::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(t.classify(lo) <= t.classify(hi));
        }

        #[test]
        fn classify_matches_bands(score in 0.0f64..=100.0) {
            let expected = if score < 25.0 {
                SeverityLevel::Low
            } else if score < 50.0 {
                SeverityLevel::Medium
            } else if score < 75.0 {
                SeverityLevel::High
            } else {
                SeverityLevel::Critical
            };
            prop_assert_eq!(SeverityThresholds::default().classify(score), expected);
        }
    }
}
