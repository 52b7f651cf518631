//! Validity: share of rows whose entity carries no serious open violation.

use std::collections::HashSet;

use super::models::{DimensionMeasure, QualityDimension, TableSnapshot};
use crate::models::{Severity, Violation};

/// Scores rows whose entity has no active CRITICAL or HIGH violation.
pub fn analyze_validity(snapshot: &TableSnapshot, violations: &[Violation]) -> DimensionMeasure {
    let flagged: HashSet<&str> = violations
        .iter()
        .filter(|v| v.status.is_active() && v.severity >= Severity::High)
        .map(|v| v.entity_id.as_str())
        .collect();

    let invalid = snapshot
        .rows
        .iter()
        .filter(|row| flagged.contains(row.entity_id.as_str()))
        .count() as u64;

    DimensionMeasure::from_failures(
        QualityDimension::Validity,
        invalid,
        snapshot.rows.len() as u64,
    )
}
