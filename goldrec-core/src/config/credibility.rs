//! Source credibility weights consumed by the synthesizer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ConfigValidationError;

/// Per-source credibility weights (0.0-1.0).
///
/// Sources missing from the table fall back to `default_weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredibilityTable {
    /// Weight per source identifier
    pub weights: BTreeMap<String, f64>,
    /// Weight for sources not listed
    pub default_weight: f64,
}

impl Default for CredibilityTable {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            default_weight: 0.5,
        }
    }
}

impl CredibilityTable {
    /// Creates an empty table with the default fallback weight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set one source weight.
    pub fn with_weight(mut self, source: impl Into<String>, weight: f64) -> Self {
        let source = source.into();
        if !(0.0..=1.0).contains(&weight) {
            tracing::warn!(
                "credibility weight {} for source '{}' clamped to valid range [0.0, 1.0]",
                weight,
                source
            );
        }
        self.weights.insert(source, weight.clamp(0.0, 1.0));
        self
    }

    /// Builder method to set the fallback weight.
    pub fn with_default_weight(mut self, weight: f64) -> Self {
        self.default_weight = weight.clamp(0.0, 1.0);
        self
    }

    /// Weight of a source.
    pub fn weight(&self, source: &str) -> f64 {
        self.weights
            .get(source)
            .copied()
            .unwrap_or(self.default_weight)
    }

    /// Weight of a source, preferring the configured value over the
    /// confidence the row itself reported.
    pub fn weight_for(&self, source: &str, reported: Option<f64>) -> f64 {
        match (self.weights.get(source), reported) {
            (Some(weight), _) => *weight,
            (None, Some(reported)) if reported.is_finite() => reported.clamp(0.0, 1.0),
            _ => self.default_weight,
        }
    }

    /// Validates that every weight lies within [0.0, 1.0].
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !(0.0..=1.0).contains(&self.default_weight) {
            return Err(ConfigValidationError::InvalidCredibility {
                source_name: "<default>".to_string(),
                weight: self.default_weight,
            });
        }
        for (source, weight) in &self.weights {
            if !(0.0..=1.0).contains(weight) {
                return Err(ConfigValidationError::InvalidCredibility {
                    source_name: source.clone(),
                    weight: *weight,
                });
            }
        }
        Ok(())
    }
}
