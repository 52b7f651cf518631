//! Timeliness: share of rows verified recently enough.

use chrono::{Duration, NaiveTime};

use super::models::{DimensionMeasure, QualityDimension, TableSnapshot};

/// Scores rows verified within `freshness_days` of the measurement date.
///
/// Rows never verified are stale. The cutoff is midnight UTC of the
/// measurement date minus `freshness_days`; a row verified exactly at the
/// cutoff is fresh.
pub fn analyze_timeliness(snapshot: &TableSnapshot, freshness_days: i64) -> DimensionMeasure {
    let cutoff = (snapshot.measurement_date - Duration::days(freshness_days.max(0)))
        .and_time(NaiveTime::MIN)
        .and_utc();

    let stale = snapshot
        .rows
        .iter()
        .filter(|row| row.verified_at.is_none_or(|at| at < cutoff))
        .count() as u64;

    DimensionMeasure::from_failures(
        QualityDimension::Timeliness,
        stale,
        snapshot.rows.len() as u64,
    )
}
