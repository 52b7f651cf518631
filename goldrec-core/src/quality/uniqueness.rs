//! Uniqueness analysis for data quality assessment.
//!
//! Counts rows whose identity key was already seen earlier in the snapshot.

use std::collections::HashSet;

use super::models::{DimensionMeasure, QualityDimension, TableSnapshot};

/// Scores `1 - duplicate-key rows / rows`.
///
/// The first row carrying a key is unique; every later row with the same key
/// is a duplicate. Rows without a key never count as duplicates.
pub fn analyze_uniqueness(snapshot: &TableSnapshot) -> DimensionMeasure {
    let mut seen: HashSet<&str> = HashSet::new();
    let duplicates = snapshot
        .rows
        .iter()
        .filter_map(|row| row.key.as_deref())
        .filter(|key| !seen.insert(key))
        .count() as u64;

    DimensionMeasure::from_failures(
        QualityDimension::Uniqueness,
        duplicates,
        snapshot.rows.len() as u64,
    )
}
