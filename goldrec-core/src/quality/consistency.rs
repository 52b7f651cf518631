//! Consistency: how often an entity's rows disagree on canonical fields.

use std::collections::{BTreeMap, BTreeSet};

use super::completeness::is_populated;
use super::models::{DimensionMeasure, QualityDimension, TableSnapshot};
use crate::matching::normalize::normalize_text;

/// Scores `1 - extra variants / rows`.
///
/// Rows are grouped by entity. For each canonical field every normalized
/// value beyond the first within a group is one extra variant.
pub fn analyze_consistency(snapshot: &TableSnapshot, canonical_fields: &[String]) -> DimensionMeasure {
    let mut variants: BTreeMap<(&str, &str), BTreeSet<String>> = BTreeMap::new();
    for row in &snapshot.rows {
        for field in canonical_fields {
            let value = row.values.get(field.as_str());
            if !is_populated(value) {
                continue;
            }
            if let Some(value) = value {
                variants
                    .entry((row.entity_id.as_str(), field.as_str()))
                    .or_default()
                    .insert(normalized(value));
            }
        }
    }

    let extra: u64 = variants
        .values()
        .map(|values| values.len().saturating_sub(1) as u64)
        .sum();

    if extra > 0 {
        tracing::debug!(
            table = %snapshot.table_name,
            extra_variants = extra,
            "Inconsistent values across entity rows"
        );
    }
    DimensionMeasure::from_failures(
        QualityDimension::Consistency,
        extra,
        snapshot.rows.len() as u64,
    )
}

fn normalized(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => normalize_text(s),
        other => other.to_string(),
    }
}
