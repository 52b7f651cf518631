//! Matching engine thresholds.

use serde::{Deserialize, Serialize};

use super::ConfigValidationError;

/// Matching configuration.
///
/// Controls edge acceptance and the confidence assigned by each tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Edges below this confidence are discarded (0.0-1.0)
    pub min_confidence: f64,
    /// Name similarity counted as agreement in the fuzzy tier (0.0-1.0)
    pub name_agreement_threshold: f64,
    /// Minimum name similarity for relational-tier links (0.0-1.0)
    pub relational_name_threshold: f64,
    /// Upper bound on relational-tier confidence
    pub relational_confidence_cap: f64,
    /// Fuzzy-tier confidence indexed by number of agreeing signals (1, 2, 3)
    pub fuzzy_confidence: [f64; 3],
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.75,
            name_agreement_threshold: 0.85,
            relational_name_threshold: 0.80,
            relational_confidence_cap: 0.90,
            fuzzy_confidence: [0.70, 0.85, 0.95],
        }
    }
}

impl MatchConfig {
    /// Creates a new matching config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the edge acceptance threshold.
    pub fn with_min_confidence(mut self, threshold: f64) -> Self {
        if !(0.0..=1.0).contains(&threshold) {
            tracing::warn!(
                "min_confidence {} clamped to valid range [0.0, 1.0]",
                threshold
            );
        }
        self.min_confidence = threshold.clamp(0.0, 1.0);
        self
    }

    /// Builder method to set the relational-tier name threshold.
    pub fn with_relational_name_threshold(mut self, threshold: f64) -> Self {
        self.relational_name_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Confidence of a fuzzy edge given how many signals agree (1..=3).
    pub fn fuzzy_confidence_for(&self, agreeing: usize) -> f64 {
        match agreeing {
            0 => 0.0,
            n => self.fuzzy_confidence[n.min(3) - 1],
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let ratios = [
            ("min_confidence", self.min_confidence),
            ("name_agreement_threshold", self.name_agreement_threshold),
            ("relational_name_threshold", self.relational_name_threshold),
            ("relational_confidence_cap", self.relational_confidence_cap),
            ("fuzzy_confidence[0]", self.fuzzy_confidence[0]),
            ("fuzzy_confidence[1]", self.fuzzy_confidence[1]),
            ("fuzzy_confidence[2]", self.fuzzy_confidence[2]),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigValidationError::OutOfRange {
                    field: name.to_string(),
                    value,
                });
            }
        }
        if self.fuzzy_confidence[0] > self.fuzzy_confidence[1]
            || self.fuzzy_confidence[1] > self.fuzzy_confidence[2]
        {
            return Err(ConfigValidationError::Inconsistent {
                message: "fuzzy_confidence must be non-decreasing".to_string(),
            });
        }
        Ok(())
    }
}
