//! Quality scoring configuration.
//!
//! Weights, minimum thresholds and grade cutoffs for the aggregate score,
//! plus per-table profiles naming the fields each dimension looks at.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::models::{DimensionScores, Grade};
use crate::config::ConfigValidationError;
use crate::models::{facility_fields, provider_fields};

/// A format or range check applied to one field for the accuracy dimension.
///
/// Rows without a value for the field pass; completeness covers absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldValidator {
    /// Value must match a regular expression
    Pattern { field: String, pattern: String },
    /// Numeric value must lie within [min, max]
    Range { field: String, min: f64, max: f64 },
    /// Value must be a ten digit NPI
    Npi { field: String },
}

impl FieldValidator {
    /// Field this validator inspects.
    pub fn field(&self) -> &str {
        match self {
            FieldValidator::Pattern { field, .. }
            | FieldValidator::Range { field, .. }
            | FieldValidator::Npi { field } => field,
        }
    }
}

/// Fields each dimension inspects for one table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableProfile {
    /// Fields counted by completeness
    pub required_fields: Vec<String>,
    /// Fields compared across an entity's rows by consistency
    pub canonical_fields: Vec<String>,
    /// Accuracy validators
    pub validators: Vec<FieldValidator>,
}

impl TableProfile {
    /// Default profile for provider source records.
    pub fn providers() -> Self {
        use provider_fields as f;
        Self {
            required_fields: strings(&[f::NPI, f::FIRST_NAME, f::LAST_NAME, f::SPECIALTY]),
            canonical_fields: strings(&[
                f::FIRST_NAME,
                f::LAST_NAME,
                f::SPECIALTY,
                f::LICENSE_NUMBER,
            ]),
            validators: vec![
                FieldValidator::Npi {
                    field: f::NPI.to_string(),
                },
                FieldValidator::Pattern {
                    field: f::EMAIL.to_string(),
                    pattern: r"^[^@\s]+@[^@\s]+\.[A-Za-z]{2,}$".to_string(),
                },
                FieldValidator::Pattern {
                    field: f::PHONE.to_string(),
                    pattern: r"^\+?1?[\s.-]?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}$".to_string(),
                },
                FieldValidator::Range {
                    field: f::BIRTH_YEAR.to_string(),
                    min: 1900.0,
                    max: 2100.0,
                },
            ],
        }
    }

    /// Default profile for facility source records.
    pub fn facilities() -> Self {
        use facility_fields as f;
        Self {
            required_fields: strings(&[f::IDENTIFIER, f::NAME, f::POSTAL_CODE]),
            canonical_fields: strings(&[f::NAME, f::ADDRESS_LINE, f::CITY, f::POSTAL_CODE]),
            validators: vec![
                FieldValidator::Pattern {
                    field: f::POSTAL_CODE.to_string(),
                    pattern: r"^\d{5}(-\d{4})?$".to_string(),
                },
                FieldValidator::Pattern {
                    field: f::STATE.to_string(),
                    pattern: r"^[A-Z]{2}$".to_string(),
                },
            ],
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// Minimum aggregate score for each letter grade; below `d` is F.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeCutoffs {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for GradeCutoffs {
    fn default() -> Self {
        Self {
            a: 95.0,
            b: 85.0,
            c: 70.0,
            d: 50.0,
        }
    }
}

impl GradeCutoffs {
    /// Grade of an aggregate score.
    pub fn grade(&self, score: f64) -> Grade {
        if score >= self.a {
            Grade::A
        } else if score >= self.b {
            Grade::B
        } else if score >= self.c {
            Grade::C
        } else if score >= self.d {
            Grade::D
        } else {
            Grade::F
        }
    }
}

/// Trend analysis settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Number of earlier measurements in the baseline
    pub window: usize,
    /// Score change (points) still considered stable
    pub tolerance: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window: 7,
            tolerance: 1.0,
        }
    }
}

/// Quality scoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Enable quality scoring
    pub enabled: bool,
    /// Rows verified longer ago than this count as stale
    pub freshness_days: i64,
    /// Relative weight of each dimension in the aggregate
    pub weights: DimensionScores,
    /// Minimum acceptable score per dimension (0-100)
    pub minimums: DimensionScores,
    pub grades: GradeCutoffs,
    pub trend: TrendConfig,
    /// Per-table field profiles, keyed by table name
    pub profiles: BTreeMap<String, TableProfile>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("providers".to_string(), TableProfile::providers());
        profiles.insert("facilities".to_string(), TableProfile::facilities());
        Self {
            enabled: true,
            freshness_days: 90,
            weights: DimensionScores {
                completeness: 0.25,
                consistency: 0.15,
                accuracy: 0.20,
                timeliness: 0.10,
                uniqueness: 0.15,
                validity: 0.15,
            },
            minimums: DimensionScores {
                completeness: 95.0,
                consistency: 90.0,
                accuracy: 95.0,
                timeliness: 80.0,
                // Strict; sources that resend rows under new keys will trip it
                uniqueness: 98.0,
                validity: 90.0,
            },
            grades: GradeCutoffs::default(),
            trend: TrendConfig::default(),
            profiles,
        }
    }
}

impl QualityConfig {
    /// Creates a new quality config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to enable/disable quality scoring.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builder method to set the freshness window.
    pub fn with_freshness_days(mut self, days: i64) -> Self {
        if days < 0 {
            tracing::warn!("freshness_days {} clamped to 0", days);
        }
        self.freshness_days = days.max(0);
        self
    }

    /// Builder method to set dimension weights.
    pub fn with_weights(mut self, weights: DimensionScores) -> Self {
        self.weights = weights;
        self
    }

    /// Builder method to set minimum thresholds.
    pub fn with_minimums(mut self, minimums: DimensionScores) -> Self {
        self.minimums = minimums;
        self
    }

    /// Builder method to set or replace a table profile.
    pub fn with_profile(mut self, table: impl Into<String>, profile: TableProfile) -> Self {
        self.profiles.insert(table.into(), profile);
        self
    }

    /// Profile of a table; unknown tables get an empty profile.
    pub fn profile(&self, table: &str) -> TableProfile {
        self.profiles.get(table).cloned().unwrap_or_default()
    }

    /// Validates the configuration.
    ///
    /// Returns an error if a threshold is outside 0-100, the weights do not
    /// sum to a positive value, grade cutoffs are not descending, or a
    /// validator pattern does not compile.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for (dimension, minimum) in self.minimums.iter() {
            if !(0.0..=100.0).contains(&minimum) {
                return Err(ConfigValidationError::Inconsistent {
                    message: format!(
                        "quality.minimums.{} must be between 0 and 100, got {}",
                        dimension, minimum
                    ),
                });
            }
        }

        let sum: f64 = self.weights.iter().map(|(_, w)| w).sum();
        if self.weights.iter().any(|(_, w)| w < 0.0) || sum <= 0.0 || !sum.is_finite() {
            return Err(ConfigValidationError::InvalidWeights { sum });
        }

        let g = &self.grades;
        if !(g.a <= 100.0 && g.a >= g.b && g.b >= g.c && g.c >= g.d && g.d >= 0.0) {
            return Err(ConfigValidationError::InvalidGradeCutoffs);
        }

        if self.freshness_days < 0 {
            return Err(ConfigValidationError::Inconsistent {
                message: "quality.freshness_days must not be negative".to_string(),
            });
        }

        for (table, profile) in &self.profiles {
            for validator in &profile.validators {
                match validator {
                    FieldValidator::Pattern { field, pattern } => {
                        Regex::new(pattern).map_err(|e| ConfigValidationError::Inconsistent {
                            message: format!(
                                "invalid pattern for {}.{}: {}",
                                table, field, e
                            ),
                        })?;
                    }
                    FieldValidator::Range { field, min, max } if min > max => {
                        return Err(ConfigValidationError::Inconsistent {
                            message: format!("range for {}.{} has min > max", table, field),
                        });
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}
