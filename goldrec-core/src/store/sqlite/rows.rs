//! Row decoding for the SQLite entity store.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::Row;

use crate::models::{
    ActivityCount, Affiliation, ChangeEvent, ChangeOperation, DeadLetter, EntityType, GoldenRecord,
    RecordKey, Severity, Violation, ViolationStatus,
};
use crate::quality::{DimensionScores, Grade, QualityMetric};
use crate::store::{Capture, ReviewFlag};
use crate::{GoldrecError, Result};

/// Typed column access with consistent error context.
pub(super) trait RowExt {
    fn field<'r, T>(&'r self, name: &str) -> Result<T>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>;
}

impl RowExt for SqliteRow {
    fn field<'r, T>(&'r self, name: &str) -> Result<T>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        self.try_get(name)
            .map_err(|e| GoldrecError::persistence(format!("decoding column '{}'", name), e))
    }
}

pub(super) fn to_json<T: Serialize>(value: &T, context: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| GoldrecError::serialization(context, e))
}

pub(super) fn from_json<T: DeserializeOwned>(text: &str, context: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| GoldrecError::serialization(context, e))
}

fn optional_json(text: Option<String>, context: &str) -> Result<Option<serde_json::Value>> {
    text.map(|t| from_json(&t, context)).transpose()
}

fn unknown(column: &str, value: &str) -> GoldrecError {
    GoldrecError::persistence(
        format!("decoding column '{}'", column),
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown value '{}'", value),
        ),
    )
}

pub(super) fn entity_type(row: &SqliteRow) -> Result<EntityType> {
    let value: String = row.field("entity_type")?;
    EntityType::parse(&value).ok_or_else(|| unknown("entity_type", &value))
}

pub(super) fn record_key(row: &SqliteRow) -> Result<RecordKey> {
    Ok(RecordKey::new(
        row.field::<String>("source")?,
        row.field::<String>("natural_key")?,
    ))
}

pub(super) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(super) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(super) fn capture(row: &SqliteRow) -> Result<Capture> {
    let payload: String = row.field("payload")?;
    from_json(&payload, "decoding stored capture")
}

pub(super) fn change_event(row: &SqliteRow) -> Result<ChangeEvent> {
    let operation: String = row.field("operation")?;
    Ok(ChangeEvent {
        batch_id: row.field("batch_id")?,
        sequence: to_u64(row.field("sequence")?),
        source: row.field("source")?,
        entity_type: entity_type(row)?,
        entity_key: row.field("entity_key")?,
        operation: ChangeOperation::parse(&operation)
            .ok_or_else(|| unknown("operation", &operation))?,
        before: optional_json(row.field("before_json")?, "decoding event before image")?,
        after: optional_json(row.field("after_json")?, "decoding event after image")?,
        captured_at: row.field("captured_at")?,
    })
}

pub(super) fn golden_record(row: &SqliteRow) -> Result<GoldenRecord> {
    let fields: String = row.field("fields")?;
    let source_records: String = row.field("source_records")?;
    Ok(GoldenRecord {
        cluster_id: row.field("cluster_id")?,
        entity_type: entity_type(row)?,
        fields: from_json(&fields, "decoding golden fields")?,
        source_records: from_json(&source_records, "decoding golden provenance")?,
        last_captured_at: row.field("last_captured_at")?,
        version: row.field("version")?,
        active: row.field("active")?,
        created_at: Some(row.field("created_at")?),
        superseded_at: row.field("superseded_at")?,
    })
}

pub(super) fn affiliation(row: &SqliteRow) -> Result<Affiliation> {
    Ok(Affiliation {
        provider_id: row.field("provider_id")?,
        facility_id: row.field("facility_id")?,
        start_date: row.field("start_date")?,
        end_date: row.field("end_date")?,
        is_primary: row.field("is_primary")?,
        source: row.field("source")?,
    })
}

pub(super) fn review_flag(row: &SqliteRow) -> Result<ReviewFlag> {
    let members: String = row.field("members")?;
    Ok(ReviewFlag {
        cluster_id: row.field("cluster_id")?,
        entity_type: entity_type(row)?,
        reason: row.field("reason")?,
        members: from_json(&members, "decoding review flag members")?,
        flagged_at: row.field("flagged_at")?,
    })
}

pub(super) fn dead_letter(row: &SqliteRow) -> Result<DeadLetter> {
    Ok(DeadLetter {
        batch_id: row.field("batch_id")?,
        entity_key: row.field("entity_key")?,
        reason: row.field("reason")?,
        message: row.field("message")?,
        payload: optional_json(row.field("payload")?, "decoding dead letter payload")?,
        recorded_at: row.field("recorded_at")?,
    })
}

pub(super) fn violation(row: &SqliteRow) -> Result<Violation> {
    let severity: String = row.field("severity")?;
    let status: String = row.field("status")?;
    Ok(Violation {
        rule_name: row.field("rule_name")?,
        entity_type: entity_type(row)?,
        entity_id: row.field("entity_id")?,
        severity: Severity::parse(&severity).ok_or_else(|| unknown("severity", &severity))?,
        description: row.field("description")?,
        detected_value: row.field("detected_value")?,
        expected_value: row.field("expected_value")?,
        status: ViolationStatus::parse(&status).ok_or_else(|| unknown("status", &status))?,
        first_detected_at: row.field("first_detected_at")?,
        last_detected_at: row.field("last_detected_at")?,
        resolved_at: row.field("resolved_at")?,
        resolution_note: row.field("resolution_note")?,
        reopen_count: row.field("reopen_count")?,
    })
}

pub(super) fn activity(row: &SqliteRow) -> Result<ActivityCount> {
    Ok(ActivityCount {
        entity_id: row.field("entity_id")?,
        period: row.field("period")?,
        count: to_u64(row.field("count")?),
    })
}

pub(super) fn quality_metric(row: &SqliteRow) -> Result<QualityMetric> {
    let grade: String = row.field("grade")?;
    let violations: String = row.field("threshold_violations")?;
    Ok(QualityMetric {
        table_name: row.field("table_name")?,
        measurement_date: row.field("measurement_date")?,
        batch_id: row.field("batch_id")?,
        record_count: to_u64(row.field("record_count")?),
        scores: DimensionScores {
            completeness: row.field("completeness")?,
            consistency: row.field("consistency")?,
            accuracy: row.field("accuracy")?,
            timeliness: row.field("timeliness")?,
            uniqueness: row.field("uniqueness")?,
            validity: row.field("validity")?,
        },
        aggregate: row.field("aggregate")?,
        grade: Grade::parse(&grade).ok_or_else(|| unknown("grade", &grade))?,
        threshold_violations: from_json(&violations, "decoding threshold violations")?,
        measured_at: row.field("measured_at")?,
    })
}
