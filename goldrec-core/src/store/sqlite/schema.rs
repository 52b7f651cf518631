//! Table layout of the SQLite entity store.
//!
//! Timestamps are RFC 3339 text, dates are `YYYY-MM-DD`, nested values are
//! JSON text. The partial unique index on `golden_records` keeps at most one
//! active version per cluster.

use sqlx::SqlitePool;

use super::db_error;
use crate::Result;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS change_events (
    batch_id     TEXT    NOT NULL,
    sequence     INTEGER NOT NULL,
    source       TEXT    NOT NULL,
    entity_type  TEXT    NOT NULL,
    entity_key   TEXT    NOT NULL,
    operation    TEXT    NOT NULL,
    before_json  TEXT,
    after_json   TEXT,
    captured_at  TEXT    NOT NULL,
    applied      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (batch_id, sequence)
);

CREATE TABLE IF NOT EXISTS completed_batches (
    batch_id     TEXT PRIMARY KEY,
    completed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS record_captures (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type  TEXT    NOT NULL,
    source       TEXT    NOT NULL,
    natural_key  TEXT    NOT NULL,
    captured_at  TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    UNIQUE (entity_type, source, natural_key, captured_at)
);

CREATE TABLE IF NOT EXISTS current_records (
    entity_type  TEXT NOT NULL,
    source       TEXT NOT NULL,
    natural_key  TEXT NOT NULL,
    captured_at  TEXT NOT NULL,
    payload      TEXT NOT NULL,
    PRIMARY KEY (entity_type, source, natural_key)
);

CREATE TABLE IF NOT EXISTS record_blocking_keys (
    entity_type  TEXT NOT NULL,
    source       TEXT NOT NULL,
    natural_key  TEXT NOT NULL,
    blocking_key TEXT NOT NULL,
    PRIMARY KEY (entity_type, source, natural_key, blocking_key)
);

CREATE INDEX IF NOT EXISTS idx_blocking_key
    ON record_blocking_keys (entity_type, blocking_key);

CREATE TABLE IF NOT EXISTS cluster_members (
    entity_type  TEXT NOT NULL,
    source       TEXT NOT NULL,
    natural_key  TEXT NOT NULL,
    cluster_id   TEXT NOT NULL,
    PRIMARY KEY (entity_type, source, natural_key)
);

CREATE INDEX IF NOT EXISTS idx_cluster_members_cluster
    ON cluster_members (cluster_id);

CREATE TABLE IF NOT EXISTS golden_records (
    cluster_id       TEXT    NOT NULL,
    version          INTEGER NOT NULL,
    entity_type      TEXT    NOT NULL,
    fields           TEXT    NOT NULL,
    source_records   TEXT    NOT NULL,
    last_captured_at TEXT,
    active           INTEGER NOT NULL,
    created_at       TEXT    NOT NULL,
    superseded_at    TEXT,
    PRIMARY KEY (cluster_id, version)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_golden_single_active
    ON golden_records (cluster_id) WHERE active = 1;

CREATE TABLE IF NOT EXISTS affiliations (
    provider_id  TEXT    NOT NULL,
    facility_id  TEXT    NOT NULL,
    start_date   TEXT,
    end_date     TEXT,
    is_primary   INTEGER NOT NULL,
    source       TEXT    NOT NULL,
    PRIMARY KEY (provider_id, facility_id)
);

CREATE TABLE IF NOT EXISTS review_flags (
    cluster_id   TEXT PRIMARY KEY,
    entity_type  TEXT NOT NULL,
    reason       TEXT NOT NULL,
    members      TEXT NOT NULL,
    flagged_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id     TEXT NOT NULL,
    entity_key   TEXT,
    reason       TEXT NOT NULL,
    message      TEXT NOT NULL,
    payload      TEXT,
    recorded_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS violations (
    rule_name         TEXT    NOT NULL,
    entity_type       TEXT    NOT NULL,
    entity_id         TEXT    NOT NULL,
    severity          TEXT    NOT NULL,
    description       TEXT    NOT NULL,
    detected_value    TEXT,
    expected_value    TEXT,
    status            TEXT    NOT NULL,
    first_detected_at TEXT    NOT NULL,
    last_detected_at  TEXT    NOT NULL,
    resolved_at       TEXT,
    resolution_note   TEXT,
    reopen_count      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (rule_name, entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS activity_counts (
    entity_id    TEXT    NOT NULL,
    period       TEXT    NOT NULL,
    count        INTEGER NOT NULL,
    PRIMARY KEY (entity_id, period)
);

CREATE TABLE IF NOT EXISTS quality_metrics (
    table_name           TEXT    NOT NULL,
    measurement_date     TEXT    NOT NULL,
    batch_id             TEXT    NOT NULL,
    record_count         INTEGER NOT NULL,
    completeness         REAL    NOT NULL,
    consistency          REAL    NOT NULL,
    accuracy             REAL    NOT NULL,
    timeliness           REAL    NOT NULL,
    uniqueness           REAL    NOT NULL,
    validity             REAL    NOT NULL,
    aggregate            REAL    NOT NULL,
    grade                TEXT    NOT NULL,
    threshold_violations TEXT    NOT NULL,
    measured_at          TEXT    NOT NULL,
    PRIMARY KEY (table_name, measurement_date, batch_id)
);

CREATE VIEW IF NOT EXISTS active_golden_records AS
    SELECT cluster_id, entity_type, version, fields, source_records, created_at
    FROM golden_records
    WHERE active = 1;

CREATE VIEW IF NOT EXISTS open_violations AS
    SELECT rule_name, entity_type, entity_id, severity, description,
           detected_value, expected_value, status, first_detected_at, last_detected_at
    FROM violations
    WHERE status IN ('OPEN', 'IN_PROGRESS');

CREATE VIEW IF NOT EXISTS quality_trend AS
    SELECT table_name, measurement_date, batch_id, aggregate, grade,
           aggregate - LAG(aggregate) OVER (
               PARTITION BY table_name ORDER BY measurement_date, measured_at
           ) AS delta
    FROM quality_metrics;
";

/// Names of the read-only views.
pub const VIEWS: &[&str] = &["active_golden_records", "open_violations", "quality_trend"];

/// Individual DDL statements of the schema.
fn statements() -> impl Iterator<Item = &'static str> {
    SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty())
}

/// Creates missing tables, indexes and views.
pub(super) async fn migrate(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| db_error("starting schema migration", e))?;
    for statement in statements() {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("applying schema", e))?;
    }
    tx.commit()
        .await
        .map_err(|e| db_error("committing schema migration", e))?;
    tracing::debug!("Entity store schema is up to date");
    Ok(())
}
