//! Ingestion of per-source JSON-lines files.
//!
//! Each non-blank line is one source row. Rows are validated against an
//! embedded JSON Schema for their entity type and then decoded exactly as the
//! batch processor would decode them, so a row that passes ingestion cannot
//! be quarantined later for its shape. Invalid rows are rejected one by one
//! with their line number; the rest of the file is still read.
//!
//! Reserved row fields:
//! - `natural_key` (required): the row's key in its source
//! - `op`: `insert` (default), `update` or `delete`
//! - `captured_at`: RFC 3339 capture time, defaults to the ingestion time
//!
//! Activity files (`source:activity:path`) carry one `(natural_key, period,
//! count)` row per line, naming a provider row of the same source. They are
//! validated against their own schema and resolved to clusters after the
//! batch is applied.

use chrono::{DateTime, NaiveDate, Utc};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::cdc::decode_event;
use crate::models::{ChangeEvent, ChangeOperation, EntityType, RecordKey};
use crate::{GoldrecError, Result};

const PROVIDER_ROW_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "title": "Provider source row",
  "type": "object",
  "required": ["natural_key"],
  "properties": {
    "natural_key": { "type": "string", "minLength": 1 },
    "source": { "type": "string", "minLength": 1 },
    "op": { "enum": ["insert", "update", "delete"] },
    "captured_at": { "type": "string", "minLength": 1 },
    "npi": { "type": ["string", "null"] },
    "first_name": { "type": ["string", "null"] },
    "middle_name": { "type": ["string", "null"] },
    "last_name": { "type": ["string", "null"] },
    "display_name": { "type": ["string", "null"] },
    "credential": { "type": ["string", "null"] },
    "specialty": { "type": ["string", "null"] },
    "license_number": { "type": ["string", "null"] },
    "license_state": { "type": ["string", "null"] },
    "license_expiry": {
      "type": ["string", "null"],
      "pattern": "^\\d{4}-\\d{2}-\\d{2}$"
    },
    "email": { "type": ["string", "null"] },
    "phone": { "type": ["string", "null"] },
    "birth_year": { "type": ["integer", "null"] },
    "graduation_year": { "type": ["integer", "null"] },
    "years_in_practice": { "type": ["integer", "null"] },
    "source_confidence": { "type": ["number", "null"], "minimum": 0, "maximum": 1 },
    "affiliations": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["facility_ref"],
        "properties": {
          "facility_ref": { "type": "string", "minLength": 1 },
          "is_primary": { "type": "boolean" },
          "start_date": { "type": ["string", "null"], "pattern": "^\\d{4}-\\d{2}-\\d{2}$" },
          "end_date": { "type": ["string", "null"], "pattern": "^\\d{4}-\\d{2}-\\d{2}$" }
        }
      }
    }
  }
}"#;

const FACILITY_ROW_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "title": "Facility source row",
  "type": "object",
  "required": ["natural_key"],
  "properties": {
    "natural_key": { "type": "string", "minLength": 1 },
    "source": { "type": "string", "minLength": 1 },
    "op": { "enum": ["insert", "update", "delete"] },
    "captured_at": { "type": "string", "minLength": 1 },
    "identifier": { "type": ["string", "null"] },
    "name": { "type": ["string", "null"] },
    "address_line": { "type": ["string", "null"] },
    "city": { "type": ["string", "null"] },
    "state": { "type": ["string", "null"] },
    "postal_code": { "type": ["string", "null"] },
    "facility_type": { "type": ["string", "null"] }
  }
}"#;

const ACTIVITY_ROW_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "title": "Provider activity row",
  "type": "object",
  "required": ["natural_key", "period", "count"],
  "properties": {
    "natural_key": { "type": "string", "minLength": 1 },
    "period": { "type": "string", "pattern": "^\\d{4}-\\d{2}-\\d{2}$" },
    "count": { "type": "integer", "minimum": 0 }
  },
  "additionalProperties": false
}"#;

static PROVIDER_VALIDATOR: OnceLock<Validator> = OnceLock::new();
static FACILITY_VALIDATOR: OnceLock<Validator> = OnceLock::new();
static ACTIVITY_VALIDATOR: OnceLock<Validator> = OnceLock::new();

fn validator(kind: InputKind) -> Result<&'static Validator> {
    let (cell, schema) = match kind {
        InputKind::Provider => (&PROVIDER_VALIDATOR, PROVIDER_ROW_SCHEMA),
        InputKind::Facility => (&FACILITY_VALIDATOR, FACILITY_ROW_SCHEMA),
        InputKind::Activity => (&ACTIVITY_VALIDATOR, ACTIVITY_ROW_SCHEMA),
    };
    if let Some(compiled) = cell.get() {
        return Ok(compiled);
    }

    let schema_json: Value = serde_json::from_str(schema)
        .map_err(|e| GoldrecError::serialization("parsing embedded row schema", e))?;
    let compiled = jsonschema::validator_for(&schema_json).map_err(|e| {
        GoldrecError::configuration(format!("Row schema compilation error: {}", e))
    })?;
    // another thread may have won the race; either copy is identical
    let _ = cell.set(compiled);
    cell.get()
        .ok_or_else(|| GoldrecError::configuration("Row schema validator not initialized"))
}

/// Validates one row against the schema of its input kind.
///
/// # Errors
/// Returns `MalformedRecord` describing the first schema violation.
pub fn validate_row(kind: impl Into<InputKind>, row: &Value) -> Result<()> {
    validator(kind.into())?
        .validate(row)
        .map_err(|e| GoldrecError::malformed(format!("schema validation failed: {}", e)))
}

/// A rejected input line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    /// 1-based line number in the file
    pub line: usize,
    pub reason: String,
}

/// What the rows of an input file describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Provider,
    Facility,
    /// Per-period activity counts of provider rows
    Activity,
}

impl InputKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "activity" => Some(InputKind::Activity),
            other => EntityType::parse(other).map(Self::from),
        }
    }

    /// Entity type of change-event inputs; `None` for activity.
    pub fn entity_type(self) -> Option<EntityType> {
        match self {
            InputKind::Provider => Some(EntityType::Provider),
            InputKind::Facility => Some(EntityType::Facility),
            InputKind::Activity => None,
        }
    }
}

impl From<EntityType> for InputKind {
    fn from(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Provider => InputKind::Provider,
            EntityType::Facility => InputKind::Facility,
        }
    }
}

/// One input file: which source wrote it and what it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub source: String,
    pub kind: InputKind,
    pub path: PathBuf,
}

impl SourceFile {
    pub fn new(source: impl Into<String>, kind: impl Into<InputKind>, path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
            path: path.into(),
        }
    }
}

impl FromStr for SourceFile {
    type Err = GoldrecError;

    /// Parses `source:kind:path`, e.g. `state_board:provider:rows.jsonl`.
    fn from_str(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(3, ':');
        let (Some(source), Some(kind), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(GoldrecError::configuration(format!(
                "input '{}' must look like source:kind:path",
                spec
            )));
        };
        let kind = InputKind::parse(kind).ok_or_else(|| {
            GoldrecError::configuration(format!(
                "unknown input kind '{}' (expected provider, facility or activity)",
                kind
            ))
        })?;
        if source.trim().is_empty() || path.trim().is_empty() {
            return Err(GoldrecError::configuration(format!(
                "input '{}' has an empty source or path",
                spec
            )));
        }
        Ok(Self::new(source, kind, path))
    }
}

/// Activity count of one source row, before it is resolved to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRow {
    pub key: RecordKey,
    pub period: NaiveDate,
    pub count: u64,
}

#[derive(Deserialize)]
struct ActivityLine {
    natural_key: String,
    period: NaiveDate,
    count: u64,
}

/// Result of reading one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub source: String,
    pub kind: InputKind,
    pub lines_read: usize,
    pub events: Vec<ChangeEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activity: Vec<ActivityRow>,
    pub rejected: Vec<RowRejection>,
}

impl IngestReport {
    fn empty(source: &str, kind: InputKind) -> Self {
        Self {
            source: source.to_string(),
            kind,
            lines_read: 0,
            events: Vec::new(),
            activity: Vec::new(),
            rejected: Vec::new(),
        }
    }

    /// Accepted rows of either kind.
    pub fn accepted(&self) -> usize {
        self.events.len() + self.activity.len()
    }
}

/// Runs `accept` on every non-blank line parsed as JSON; failures become
/// rejections and do not stop the file.
fn read_lines(
    contents: &str,
    report: &mut IngestReport,
    mut accept: impl FnMut(&mut IngestReport, Value) -> Result<()>,
) {
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        report.lines_read += 1;
        let parsed = serde_json::from_str::<Value>(line)
            .map_err(|e| GoldrecError::malformed(format!("invalid JSON: {}", e)))
            .and_then(|row| accept(report, row));
        if let Err(err) = parsed {
            let reason = match err {
                GoldrecError::MalformedRecord { context } => context,
                other => other.to_string(),
            };
            tracing::debug!(source = %report.source, line = index + 1, reason = %reason, "Rejected row");
            report.rejected.push(RowRejection {
                line: index + 1,
                reason,
            });
        }
    }
}

/// Converts JSON-lines text into change events.
///
/// Accepted rows get consecutive sequences starting at `first_sequence`.
pub fn parse_rows(
    batch_id: &str,
    source: &str,
    entity_type: EntityType,
    contents: &str,
    first_sequence: u64,
    ingested_at: DateTime<Utc>,
) -> IngestReport {
    let mut report = IngestReport::empty(source, entity_type.into());
    let mut sequence = first_sequence;
    read_lines(contents, &mut report, |report, row| {
        let event = row_to_event(batch_id, sequence, source, entity_type, row, ingested_at)?;
        report.events.push(event);
        sequence += 1;
        Ok(())
    });
    report
}

/// Converts JSON-lines activity text into activity rows keyed by `source`.
pub fn parse_activity_rows(source: &str, contents: &str) -> IngestReport {
    let mut report = IngestReport::empty(source, InputKind::Activity);
    read_lines(contents, &mut report, |report, row| {
        let activity = row_to_activity(source, row)?;
        report.activity.push(activity);
        Ok(())
    });
    report
}

/// Converts one activity row.
///
/// # Errors
/// Returns `MalformedRecord` when the row fails its schema or names a
/// period that is not a calendar date.
pub fn row_to_activity(source: &str, row: Value) -> Result<ActivityRow> {
    validate_row(InputKind::Activity, &row)?;
    let line: ActivityLine = serde_json::from_value(row)
        .map_err(|e| GoldrecError::malformed(format!("activity row: {}", e)))?;
    Ok(ActivityRow {
        key: RecordKey::new(source, line.natural_key),
        period: line.period,
        count: line.count,
    })
}

/// Converts one validated row into a change event.
///
/// # Errors
/// Returns `MalformedRecord` when the row fails its schema, carries an
/// unparseable `captured_at`, or does not decode into a record.
pub fn row_to_event(
    batch_id: &str,
    sequence: u64,
    source: &str,
    entity_type: EntityType,
    row: Value,
    ingested_at: DateTime<Utc>,
) -> Result<ChangeEvent> {
    validate_row(entity_type, &row)?;
    let Value::Object(mut fields) = row else {
        return Err(GoldrecError::malformed("row is not a JSON object"));
    };

    let operation = match fields.remove("op") {
        Some(Value::String(op)) => ChangeOperation::parse(&op)
            .ok_or_else(|| GoldrecError::malformed(format!("unknown op '{}'", op)))?,
        _ => ChangeOperation::Insert,
    };
    let captured_at = match fields.remove("captured_at") {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| GoldrecError::malformed(format!("captured_at '{}': {}", text, e)))?,
        _ => ingested_at,
    };
    let entity_key = match fields.get("natural_key") {
        Some(Value::String(key)) => key.clone(),
        _ => return Err(GoldrecError::malformed("natural_key must be a string")),
    };

    let event = ChangeEvent {
        batch_id: batch_id.to_string(),
        sequence,
        source: source.to_string(),
        entity_type,
        entity_key,
        operation,
        before: None,
        after: (operation != ChangeOperation::Delete).then_some(Value::Object(fields)),
        captured_at,
    };
    decode_event(&event)?;
    Ok(event)
}

/// Reads one source file.
///
/// # Errors
/// Returns an I/O error when the file cannot be read. Bad rows are reported
/// in [`IngestReport::rejected`], not as errors.
pub async fn read_source_file(
    batch_id: &str,
    file: &SourceFile,
    first_sequence: u64,
    ingested_at: DateTime<Utc>,
) -> Result<IngestReport> {
    let contents = tokio::fs::read_to_string(&file.path)
        .await
        .map_err(|e| GoldrecError::io(format!("reading {}", file.path.display()), e))?;
    let report = match file.kind.entity_type() {
        Some(entity_type) => parse_rows(
            batch_id,
            &file.source,
            entity_type,
            &contents,
            first_sequence,
            ingested_at,
        ),
        None => parse_activity_rows(&file.source, &contents),
    };
    log_report(&file.path, &report);
    Ok(report)
}

/// Reads several files into one batch with contiguous sequences.
pub async fn read_batch(
    batch_id: &str,
    files: &[SourceFile],
    ingested_at: DateTime<Utc>,
) -> Result<Vec<IngestReport>> {
    let mut reports = Vec::with_capacity(files.len());
    let mut next_sequence = 1;
    for file in files {
        let report = read_source_file(batch_id, file, next_sequence, ingested_at).await?;
        next_sequence += report.events.len() as u64;
        reports.push(report);
    }
    Ok(reports)
}

fn log_report(path: &Path, report: &IngestReport) {
    if report.rejected.is_empty() {
        tracing::info!(
            path = %path.display(),
            source = %report.source,
            kind = ?report.kind,
            rows = report.accepted(),
            "Read source file"
        );
    } else {
        tracing::warn!(
            path = %path.display(),
            source = %report.source,
            kind = ?report.kind,
            rows = report.accepted(),
            rejected = report.rejected.len(),
            first_rejected_line = report.rejected[0].line,
            "Read source file with rejected rows"
        );
    }
}
