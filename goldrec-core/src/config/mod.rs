//! Runtime configuration.
//!
//! A single [`GoldrecConfig`] is loaded once (usually from a JSON file) and
//! handed to each engine explicitly. Every section has sensible defaults so a
//! partial file is enough.

mod credibility;
mod matching;
mod processor;

pub use credibility::CredibilityTable;
pub use matching::MatchConfig;
pub use processor::{ProcessorConfig, RetryPolicy};

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::quality::QualityConfig;
use crate::rules::RuleSetConfig;
use crate::{GoldrecError, Result};

/// Validation errors for configuration sections.
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("{field} must be between 0.0 and 1.0, got {value}")]
    OutOfRange { field: String, value: f64 },
    #[error("credibility weight for source '{source_name}' must be between 0.0 and 1.0, got {weight}")]
    InvalidCredibility { source_name: String, weight: f64 },
    #[error("quality weights must sum to a positive value, got {sum}")]
    InvalidWeights { sum: f64 },
    #[error("grade cutoffs must be descending within 0-100")]
    InvalidGradeCutoffs,
    #[error("rule '{name}' is defined more than once")]
    DuplicateRule { name: String },
    #[error("{message}")]
    Inconsistent { message: String },
}

impl From<ConfigValidationError> for GoldrecError {
    fn from(err: ConfigValidationError) -> Self {
        GoldrecError::configuration(err.to_string())
    }
}

/// Top-level configuration for the master-data pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoldrecConfig {
    /// Source credibility weights for synthesis
    pub credibility: CredibilityTable,
    /// Matching thresholds
    pub matching: MatchConfig,
    /// Rule definitions
    pub rules: RuleSetConfig,
    /// Quality scoring weights, thresholds and grades
    pub quality: QualityConfig,
    /// Batch processing limits
    pub processor: ProcessorConfig,
}

impl GoldrecConfig {
    /// Creates a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GoldrecError::serialization("parsing configuration", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            GoldrecError::io(format!("reading configuration {}", path.display()), e)
        })?;
        let config = Self::from_json_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        self.credibility.validate()?;
        self.matching.validate()?;
        self.rules.validate()?;
        self.quality.validate()?;
        self.processor.validate()?;
        Ok(())
    }
}
