//! Accuracy: share of rows passing every configured format and range check.

use regex::Regex;

use super::config::FieldValidator;
use super::models::{DimensionMeasure, QualityDimension, SnapshotRow, TableSnapshot};
use crate::matching::normalize::normalize_npi;
use crate::{GoldrecError, Result};

/// A validator with its pattern compiled.
enum Compiled<'a> {
    Pattern { field: &'a str, regex: Regex },
    Range { field: &'a str, min: f64, max: f64 },
    Npi { field: &'a str },
}

impl Compiled<'_> {
    fn passes(&self, row: &SnapshotRow) -> bool {
        let field = match self {
            Compiled::Pattern { field, .. }
            | Compiled::Range { field, .. }
            | Compiled::Npi { field } => *field,
        };
        let value = match row.values.get(field) {
            None | Some(serde_json::Value::Null) => return true,
            Some(value) => value,
        };
        match self {
            Compiled::Pattern { regex, .. } => match value {
                serde_json::Value::String(s) => regex.is_match(s.trim()),
                other => regex.is_match(&other.to_string()),
            },
            Compiled::Range { min, max, .. } => match numeric(value) {
                Some(n) => n >= *min && n <= *max,
                None => false,
            },
            Compiled::Npi { .. } => match value {
                serde_json::Value::String(s) => s.trim().is_empty() || normalize_npi(s).is_some(),
                _ => false,
            },
        }
    }
}

fn numeric(value: &serde_json::Value) -> Option<f64> {
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|v| v.is_finite())
}

/// Scores rows passing all validators over all rows.
///
/// # Errors
/// Returns a configuration error if a pattern does not compile.
pub fn analyze_accuracy(
    snapshot: &TableSnapshot,
    validators: &[FieldValidator],
) -> Result<DimensionMeasure> {
    let compiled = validators
        .iter()
        .map(|validator| {
            Ok(match validator {
                FieldValidator::Pattern { field, pattern } => Compiled::Pattern {
                    field,
                    regex: Regex::new(pattern).map_err(|e| {
                        GoldrecError::configuration(format!(
                            "invalid accuracy pattern for '{}': {}",
                            field, e
                        ))
                    })?,
                },
                FieldValidator::Range { field, min, max } => Compiled::Range {
                    field,
                    min: *min,
                    max: *max,
                },
                FieldValidator::Npi { field } => Compiled::Npi { field },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let failing = snapshot
        .rows
        .iter()
        .filter(|row| !compiled.iter().all(|v| v.passes(row)))
        .count() as u64;

    Ok(DimensionMeasure::from_failures(
        QualityDimension::Accuracy,
        failing,
        snapshot.rows.len() as u64,
    ))
}
