//! SQLite-backed entity store.
//!
//! # Module Structure
//! - `connection`: connection strings and pool setup
//! - `schema`: tables, indexes and the read-only views
//! - `rows`: row decoding
//!
//! Cluster commits, retirements, capture writes, guarded violation writes
//! and snapshots each run in one transaction.

pub mod connection;
mod rows;
pub mod schema;


pub use connection::SqliteStoreConfig;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteRow;
use std::collections::BTreeSet;

use super::{Capture, ClusterCommit, CommitOutcome, EntityStore, ReviewFlag, StoreStats};
use crate::models::{
    ActivityCount, Affiliation, ChangeEvent, DeadLetter, EntityGraph, EntityType, FacilityRecord,
    GoldenRecord, RawProviderRecord, RecordKey, Violation, ViolationKey, ViolationWrite,
};
use crate::quality::QualityMetric;
use crate::{GoldrecError, Result};
use rows::{RowExt, to_i64, to_json};

/// Maps a sqlx error, treating connectivity failures as environmental.
pub(crate) fn db_error(context: &str, error: sqlx::Error) -> GoldrecError {
    let unreachable = matches!(
        error,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    );
    if unreachable {
        GoldrecError::store_unavailable(context, error)
    } else {
        GoldrecError::persistence(context, error)
    }
}

/// Entity store persisted in a SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    in_memory: bool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("in_memory", &self.in_memory)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) a store and applies the schema.
    ///
    /// # Errors
    /// Returns a configuration error for an invalid connection string and
    /// `StoreUnavailable` if the database cannot be opened.
    pub async fn open(connection_string: &str) -> Result<Self> {
        Self::open_with(connection_string, &SqliteStoreConfig::default()).await
    }

    /// Opens a store with custom pool settings.
    pub async fn open_with(connection_string: &str, config: &SqliteStoreConfig) -> Result<Self> {
        let pool = connection::connect(connection_string, config).await?;
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            in_memory: connection::is_in_memory(connection_string),
        })
    }

    /// Fresh in-memory store.
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    /// Underlying pool, for read-only queries against the views.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("counting rows", e))?;
        Ok(rows::to_u64(count))
    }

    async fn current_of(&self, entity_type: EntityType) -> Result<Vec<Capture>> {
        sqlx::query(
            "SELECT payload FROM current_records WHERE entity_type = ? ORDER BY source, natural_key",
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("loading current records", e))?
        .iter()
        .map(rows::capture)
        .collect()
    }

    async fn current_by_keys(&self, entity_type: EntityType, keys: &[RecordKey]) -> Result<Vec<Capture>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            let row = sqlx::query(
                "SELECT payload FROM current_records
                 WHERE entity_type = ? AND source = ? AND natural_key = ?",
            )
            .bind(entity_type.as_str())
            .bind(&key.source)
            .bind(&key.natural_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("loading record by key", e))?;
            if let Some(row) = row {
                found.push(rows::capture(&row)?);
            }
        }
        Ok(found)
    }
}

/// Runs a query and decodes every row.
async fn load_all<'e, E, T>(
    executor: E,
    sql: &'static str,
    context: &str,
    decode: fn(&SqliteRow) -> Result<T>,
) -> Result<Vec<T>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(sql)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error(context, e))?
        .iter()
        .map(decode)
        .collect()
}

fn providers(captures: Vec<Capture>) -> Vec<RawProviderRecord> {
    captures
        .into_iter()
        .filter_map(|c| match c {
            Capture::Provider(record) => Some(record),
            _ => None,
        })
        .collect()
}

fn facilities(captures: Vec<Capture>) -> Vec<FacilityRecord> {
    captures
        .into_iter()
        .filter_map(|c| match c {
            Capture::Facility(record) => Some(record),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl EntityStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn health_check(&self) -> Result<()> {
        let one: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GoldrecError::store_unavailable("health check", e))?;
        if one != 1 {
            return Err(GoldrecError::configuration(
                "Basic connectivity test failed: unexpected result",
            ));
        }
        Ok(())
    }

    async fn append_events(&self, events: &[ChangeEvent]) -> Result<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("appending change events", e))?;
        let mut stored = 0;
        for event in events {
            let before = event
                .before
                .as_ref()
                .map(|v| to_json(v, "encoding event before image"))
                .transpose()?;
            let after = event
                .after
                .as_ref()
                .map(|v| to_json(v, "encoding event after image"))
                .transpose()?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO change_events
                 (batch_id, sequence, source, entity_type, entity_key, operation,
                  before_json, after_json, captured_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.batch_id)
            .bind(to_i64(event.sequence))
            .bind(&event.source)
            .bind(event.entity_type.as_str())
            .bind(&event.entity_key)
            .bind(event.operation.as_str())
            .bind(before)
            .bind(after)
            .bind(event.captured_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("appending change event", e))?;
            stored += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit()
            .await
            .map_err(|e| db_error("committing change events", e))?;
        Ok(stored)
    }

    async fn batch_events(&self, batch_id: &str) -> Result<Vec<ChangeEvent>> {
        sqlx::query("SELECT * FROM change_events WHERE batch_id = ? ORDER BY sequence")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading batch events", e))?
            .iter()
            .map(rows::change_event)
            .collect()
    }

    async fn applied_sequences(&self, batch_id: &str) -> Result<BTreeSet<u64>> {
        let sequences: Vec<i64> = sqlx::query_scalar(
            "SELECT sequence FROM change_events WHERE batch_id = ? AND applied = 1",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("loading applied sequences", e))?;
        Ok(sequences.into_iter().map(rows::to_u64).collect())
    }

    async fn mark_applied(&self, batch_id: &str, sequences: &[u64]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("marking events applied", e))?;
        for sequence in sequences {
            sqlx::query("UPDATE change_events SET applied = 1 WHERE batch_id = ? AND sequence = ?")
                .bind(batch_id)
                .bind(to_i64(*sequence))
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("marking event applied", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| db_error("committing applied events", e))
    }

    async fn is_batch_completed(&self, batch_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM completed_batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("checking batch completion", e))?;
        Ok(count > 0)
    }

    async fn complete_batch(&self, batch_id: &str, completed_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO completed_batches (batch_id, completed_at) VALUES (?, ?)")
            .bind(batch_id)
            .bind(completed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("completing batch", e))?;
        Ok(())
    }

    async fn record_capture(&self, capture: &Capture) -> Result<bool> {
        let entity_type = capture.entity_type().as_str();
        let key = capture.record_key();
        let captured_at = capture.captured_at();
        let payload = to_json(capture, "encoding capture")?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("recording capture", e))?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO record_captures
             (entity_type, source, natural_key, captured_at, payload)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entity_type)
        .bind(&key.source)
        .bind(&key.natural_key)
        .bind(captured_at)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("appending capture", e))?
        .rows_affected();

        let history: Vec<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT captured_at FROM record_captures
             WHERE entity_type = ? AND source = ? AND natural_key = ?",
        )
        .bind(entity_type)
        .bind(&key.source)
        .bind(&key.natural_key)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("loading capture history", e))?;

        // a later retraction keeps older captures from resurfacing
        let becomes_current = inserted > 0 && history.iter().all(|c| *c <= captured_at);
        let changed = if !becomes_current {
            false
        } else {
            sqlx::query(
                "DELETE FROM record_blocking_keys
                 WHERE entity_type = ? AND source = ? AND natural_key = ?",
            )
            .bind(entity_type)
            .bind(&key.source)
            .bind(&key.natural_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clearing blocking keys", e))?;

            if capture.is_retraction() {
                let deleted = sqlx::query(
                    "DELETE FROM current_records
                     WHERE entity_type = ? AND source = ? AND natural_key = ?",
                )
                .bind(entity_type)
                .bind(&key.source)
                .bind(&key.natural_key)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("retracting record", e))?
                .rows_affected();
                deleted > 0
            } else {
                sqlx::query(
                    "INSERT OR REPLACE INTO current_records
                     (entity_type, source, natural_key, captured_at, payload)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(entity_type)
                .bind(&key.source)
                .bind(&key.natural_key)
                .bind(captured_at)
                .bind(&payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("updating current record", e))?;

                for blocking_key in capture.blocking_keys() {
                    sqlx::query(
                        "INSERT OR IGNORE INTO record_blocking_keys
                         (entity_type, source, natural_key, blocking_key)
                         VALUES (?, ?, ?, ?)",
                    )
                    .bind(entity_type)
                    .bind(&key.source)
                    .bind(&key.natural_key)
                    .bind(blocking_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("indexing blocking key", e))?;
                }
                true
            }
        };

        tx.commit()
            .await
            .map_err(|e| db_error("committing capture", e))?;
        Ok(changed)
    }

    async fn capture_history(&self, entity_type: EntityType, key: &RecordKey) -> Result<Vec<Capture>> {
        sqlx::query(
            "SELECT payload FROM record_captures
             WHERE entity_type = ? AND source = ? AND natural_key = ?
             ORDER BY captured_at, id",
        )
        .bind(entity_type.as_str())
        .bind(&key.source)
        .bind(&key.natural_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("loading capture history", e))?
        .iter()
        .map(rows::capture)
        .collect()
    }

    async fn current_providers(&self) -> Result<Vec<RawProviderRecord>> {
        Ok(providers(self.current_of(EntityType::Provider).await?))
    }

    async fn current_facilities(&self) -> Result<Vec<FacilityRecord>> {
        Ok(facilities(self.current_of(EntityType::Facility).await?))
    }

    async fn providers_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<RawProviderRecord>> {
        Ok(providers(
            self.current_by_keys(EntityType::Provider, keys).await?,
        ))
    }

    async fn facilities_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<FacilityRecord>> {
        Ok(facilities(
            self.current_by_keys(EntityType::Facility, keys).await?,
        ))
    }

    async fn keys_by_blocking_key(
        &self,
        entity_type: EntityType,
        blocking_keys: &[String],
    ) -> Result<BTreeSet<RecordKey>> {
        let mut keys = BTreeSet::new();
        for blocking_key in blocking_keys {
            let found = sqlx::query(
                "SELECT source, natural_key FROM record_blocking_keys
                 WHERE entity_type = ? AND blocking_key = ?",
            )
            .bind(entity_type.as_str())
            .bind(blocking_key)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("looking up blocking key", e))?;
            for row in &found {
                keys.insert(rows::record_key(row)?);
            }
        }
        Ok(keys)
    }

    async fn cluster_of(&self, entity_type: EntityType, key: &RecordKey) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT cluster_id FROM cluster_members
             WHERE entity_type = ? AND source = ? AND natural_key = ?",
        )
        .bind(entity_type.as_str())
        .bind(&key.source)
        .bind(&key.natural_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("looking up cluster membership", e))
    }

    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<RecordKey>> {
        sqlx::query(
            "SELECT source, natural_key FROM cluster_members
             WHERE cluster_id = ? ORDER BY source, natural_key",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("loading cluster members", e))?
        .iter()
        .map(rows::record_key)
        .collect()
    }

    async fn commit_cluster(&self, commit: &ClusterCommit) -> Result<CommitOutcome> {
        let golden = &commit.golden;
        let cluster_id = golden.cluster_id.as_str();
        let entity_type = golden.entity_type.as_str();
        let at = commit.committed_at;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("committing cluster", e))?;

        let active = sqlx::query("SELECT * FROM golden_records WHERE cluster_id = ? AND active = 1")
            .bind(cluster_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("loading active golden record", e))?
            .map(|row| rows::golden_record(&row))
            .transpose()?;

        let outcome = match active {
            Some(active) if active.same_content(golden) => CommitOutcome::Unchanged(active.version),
            _ => {
                let latest: Option<u32> =
                    sqlx::query_scalar("SELECT MAX(version) FROM golden_records WHERE cluster_id = ?")
                        .bind(cluster_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| db_error("loading latest golden version", e))?;
                let version = latest.map_or(1, |v| v + 1);
                sqlx::query(
                    "UPDATE golden_records SET active = 0, superseded_at = ?
                     WHERE cluster_id = ? AND active = 1",
                )
                .bind(at)
                .bind(cluster_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("superseding golden record", e))?;

                sqlx::query(
                    "INSERT INTO golden_records
                     (cluster_id, version, entity_type, fields, source_records,
                      last_captured_at, active, created_at, superseded_at)
                     VALUES (?, ?, ?, ?, ?, ?, 1, ?, NULL)",
                )
                .bind(cluster_id)
                .bind(version)
                .bind(entity_type)
                .bind(to_json(&golden.fields, "encoding golden fields")?)
                .bind(to_json(&golden.source_records, "encoding golden provenance")?)
                .bind(golden.last_captured_at)
                .bind(at)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("inserting golden record", e))?;

                if version == 1 {
                    CommitOutcome::Created(version)
                } else {
                    CommitOutcome::Updated(version)
                }
            }
        };

        sqlx::query("DELETE FROM cluster_members WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clearing cluster membership", e))?;
        for member in &golden.source_records {
            sqlx::query(
                "INSERT OR REPLACE INTO cluster_members
                 (entity_type, source, natural_key, cluster_id) VALUES (?, ?, ?, ?)",
            )
            .bind(entity_type)
            .bind(&member.source)
            .bind(&member.natural_key)
            .bind(cluster_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("writing cluster membership", e))?;
        }

        if golden.entity_type == EntityType::Provider {
            sqlx::query("DELETE FROM affiliations WHERE provider_id = ?")
                .bind(cluster_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("clearing affiliations", e))?;
            for affiliation in &commit.affiliations {
                sqlx::query(
                    "INSERT OR REPLACE INTO affiliations
                     (provider_id, facility_id, start_date, end_date, is_primary, source)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&affiliation.provider_id)
                .bind(&affiliation.facility_id)
                .bind(affiliation.start_date)
                .bind(affiliation.end_date)
                .bind(affiliation.is_primary)
                .bind(&affiliation.source)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("writing affiliation", e))?;
            }
        }

        sqlx::query("DELETE FROM review_flags WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clearing review flag", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("committing cluster", e))?;
        Ok(outcome)
    }

    async fn retire_cluster(&self, cluster_id: &str, retired_at: DateTime<Utc>) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("retiring cluster", e))?;

        let retired = sqlx::query(
            "UPDATE golden_records SET active = 0, superseded_at = ?
             WHERE cluster_id = ? AND active = 1",
        )
        .bind(retired_at)
        .bind(cluster_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("retiring golden record", e))?
        .rows_affected();

        for sql in [
            "DELETE FROM cluster_members WHERE cluster_id = ?",
            "DELETE FROM affiliations WHERE provider_id = ?",
            "DELETE FROM review_flags WHERE cluster_id = ?",
        ] {
            sqlx::query(sql)
                .bind(cluster_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("retiring cluster", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("committing cluster retirement", e))?;
        Ok(retired > 0)
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO review_flags
             (cluster_id, entity_type, reason, members, flagged_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&flag.cluster_id)
        .bind(flag.entity_type.as_str())
        .bind(&flag.reason)
        .bind(to_json(&flag.members, "encoding review flag members")?)
        .bind(flag.flagged_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("flagging cluster for review", e))?;
        Ok(())
    }

    async fn review_flags(&self) -> Result<Vec<ReviewFlag>> {
        sqlx::query("SELECT * FROM review_flags ORDER BY cluster_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading review flags", e))?
            .iter()
            .map(rows::review_flag)
            .collect()
    }

    async fn active_golden(&self, cluster_id: &str) -> Result<Option<GoldenRecord>> {
        sqlx::query("SELECT * FROM golden_records WHERE cluster_id = ? AND active = 1")
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("loading golden record", e))?
            .map(|row| rows::golden_record(&row))
            .transpose()
    }

    async fn golden_history(&self, cluster_id: &str) -> Result<Vec<GoldenRecord>> {
        sqlx::query("SELECT * FROM golden_records WHERE cluster_id = ? ORDER BY version")
            .bind(cluster_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading golden history", e))?
            .iter()
            .map(rows::golden_record)
            .collect()
    }

    async fn active_golden_records(&self) -> Result<Vec<GoldenRecord>> {
        sqlx::query("SELECT * FROM golden_records WHERE active = 1 ORDER BY cluster_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading golden records", e))?
            .iter()
            .map(rows::golden_record)
            .collect()
    }

    async fn affiliations(&self) -> Result<Vec<Affiliation>> {
        sqlx::query("SELECT * FROM affiliations ORDER BY provider_id, facility_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading affiliations", e))?
            .iter()
            .map(rows::affiliation)
            .collect()
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let payload = letter
            .payload
            .as_ref()
            .map(|p| to_json(p, "encoding dead letter payload"))
            .transpose()?;
        sqlx::query(
            "INSERT INTO dead_letters (batch_id, entity_key, reason, message, payload, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&letter.batch_id)
        .bind(&letter.entity_key)
        .bind(&letter.reason)
        .bind(&letter.message)
        .bind(payload)
        .bind(letter.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("writing dead letter", e))?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        sqlx::query("SELECT * FROM dead_letters ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading dead letters", e))?
            .iter()
            .map(rows::dead_letter)
            .collect()
    }

    async fn violations(&self) -> Result<Vec<Violation>> {
        sqlx::query("SELECT * FROM violations ORDER BY rule_name, entity_type, entity_id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading violations", e))?
            .iter()
            .map(rows::violation)
            .collect()
    }

    async fn upsert_violations(&self, violations: &[Violation]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("writing violations", e))?;
        for violation in violations {
            sqlx::query(
                "INSERT OR REPLACE INTO violations
                 (rule_name, entity_type, entity_id, severity, description, detected_value,
                  expected_value, status, first_detected_at, last_detected_at, resolved_at,
                  resolution_note, reopen_count)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&violation.rule_name)
            .bind(violation.entity_type.as_str())
            .bind(&violation.entity_id)
            .bind(violation.severity.as_str())
            .bind(&violation.description)
            .bind(&violation.detected_value)
            .bind(&violation.expected_value)
            .bind(violation.status.as_str())
            .bind(violation.first_detected_at)
            .bind(violation.last_detected_at)
            .bind(violation.resolved_at)
            .bind(&violation.resolution_note)
            .bind(violation.reopen_count)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("writing violation", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| db_error("committing violations", e))
    }

    async fn compare_and_set_violations(&self, writes: &[ViolationWrite]) -> Result<Vec<ViolationKey>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("writing violations", e))?;
        let mut conflicts = Vec::new();
        for write in writes {
            let violation = &write.violation;
            let written = match write.expected {
                None => sqlx::query(
                    "INSERT OR IGNORE INTO violations
                     (severity, description, detected_value, expected_value, status,
                      first_detected_at, last_detected_at, resolved_at, resolution_note,
                      reopen_count, rule_name, entity_type, entity_id)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(violation.severity.as_str())
                .bind(&violation.description)
                .bind(&violation.detected_value)
                .bind(&violation.expected_value)
                .bind(violation.status.as_str())
                .bind(violation.first_detected_at)
                .bind(violation.last_detected_at)
                .bind(violation.resolved_at)
                .bind(&violation.resolution_note)
                .bind(violation.reopen_count)
                .bind(&violation.rule_name)
                .bind(violation.entity_type.as_str())
                .bind(&violation.entity_id)
                .execute(&mut *tx)
                .await,
                Some(expected) => sqlx::query(
                    "UPDATE violations
                     SET severity = ?, description = ?, detected_value = ?, expected_value = ?,
                         status = ?, first_detected_at = ?, last_detected_at = ?,
                         resolved_at = ?, resolution_note = ?, reopen_count = ?
                     WHERE rule_name = ? AND entity_type = ? AND entity_id = ? AND status = ?",
                )
                .bind(violation.severity.as_str())
                .bind(&violation.description)
                .bind(&violation.detected_value)
                .bind(&violation.expected_value)
                .bind(violation.status.as_str())
                .bind(violation.first_detected_at)
                .bind(violation.last_detected_at)
                .bind(violation.resolved_at)
                .bind(&violation.resolution_note)
                .bind(violation.reopen_count)
                .bind(&violation.rule_name)
                .bind(violation.entity_type.as_str())
                .bind(&violation.entity_id)
                .bind(expected.as_str())
                .execute(&mut *tx)
                .await,
            }
            .map_err(|e| db_error("writing violation", e))?;
            if written.rows_affected() == 0 {
                conflicts.push(violation.key());
            }
        }
        tx.commit()
            .await
            .map_err(|e| db_error("committing violations", e))?;
        Ok(conflicts)
    }

    async fn record_activity(&self, counts: &[ActivityCount]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("recording activity", e))?;
        for count in counts {
            sqlx::query(
                "INSERT OR REPLACE INTO activity_counts (entity_id, period, count) VALUES (?, ?, ?)",
            )
            .bind(&count.entity_id)
            .bind(count.period)
            .bind(to_i64(count.count))
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("writing activity count", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| db_error("committing activity", e))
    }

    async fn activity(&self) -> Result<Vec<ActivityCount>> {
        sqlx::query("SELECT * FROM activity_counts ORDER BY entity_id, period")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("loading activity", e))?
            .iter()
            .map(rows::activity)
            .collect()
    }

    async fn append_quality_metric(&self, metric: &QualityMetric) -> Result<bool> {
        let scores = &metric.scores;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO quality_metrics
             (table_name, measurement_date, batch_id, record_count, completeness, consistency,
              accuracy, timeliness, uniqueness, validity, aggregate, grade,
              threshold_violations, measured_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metric.table_name)
        .bind(metric.measurement_date)
        .bind(&metric.batch_id)
        .bind(to_i64(metric.record_count))
        .bind(scores.completeness)
        .bind(scores.consistency)
        .bind(scores.accuracy)
        .bind(scores.timeliness)
        .bind(scores.uniqueness)
        .bind(scores.validity)
        .bind(metric.aggregate)
        .bind(metric.grade.as_str())
        .bind(to_json(&metric.threshold_violations, "encoding threshold violations")?)
        .bind(metric.measured_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("appending quality metric", e))?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn quality_history(&self, table: &str) -> Result<Vec<QualityMetric>> {
        sqlx::query(
            "SELECT * FROM quality_metrics WHERE table_name = ?
             ORDER BY measurement_date, measured_at",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("loading quality history", e))?
        .iter()
        .map(rows::quality_metric)
        .collect()
    }

    async fn snapshot(&self) -> Result<EntityGraph> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("starting snapshot", e))?;
        let golden = load_all(
            &mut *tx,
            "SELECT * FROM golden_records WHERE active = 1 ORDER BY cluster_id",
            "loading golden records",
            rows::golden_record,
        )
        .await?;
        let affiliations = load_all(
            &mut *tx,
            "SELECT * FROM affiliations ORDER BY provider_id, facility_id",
            "loading affiliations",
            rows::affiliation,
        )
        .await?;
        let violations = load_all(
            &mut *tx,
            "SELECT * FROM violations ORDER BY rule_name, entity_type, entity_id",
            "loading violations",
            rows::violation,
        )
        .await?;
        let activity = load_all(
            &mut *tx,
            "SELECT * FROM activity_counts ORDER BY entity_id, period",
            "loading activity",
            rows::activity,
        )
        .await?;
        let current = load_all(
            &mut *tx,
            "SELECT payload FROM current_records ORDER BY entity_type, source, natural_key",
            "loading current records",
            rows::capture,
        )
        .await?;
        tx.commit()
            .await
            .map_err(|e| db_error("finishing snapshot", e))?;

        let (providers_golden, facilities_golden): (Vec<GoldenRecord>, Vec<GoldenRecord>) = golden
            .into_iter()
            .partition(|g| g.entity_type == EntityType::Provider);
        let (provider_rows, facility_rows): (Vec<Capture>, Vec<Capture>) = current
            .into_iter()
            .partition(|c| c.entity_type() == EntityType::Provider);
        Ok(EntityGraph {
            providers: providers_golden,
            facilities: facilities_golden,
            affiliations,
            violations,
            activity,
            current_providers: providers(provider_rows),
            current_facilities: facilities(facility_rows),
            taken_at: Some(Utc::now()),
        })
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            current_providers: self
                .count("SELECT COUNT(*) FROM current_records WHERE entity_type = 'provider'")
                .await?,
            current_facilities: self
                .count("SELECT COUNT(*) FROM current_records WHERE entity_type = 'facility'")
                .await?,
            change_events: self.count("SELECT COUNT(*) FROM change_events").await?,
            completed_batches: self.count("SELECT COUNT(*) FROM completed_batches").await?,
            active_golden_records: self
                .count("SELECT COUNT(*) FROM golden_records WHERE active = 1")
                .await?,
            superseded_golden_records: self
                .count("SELECT COUNT(*) FROM golden_records WHERE active = 0")
                .await?,
            affiliations: self.count("SELECT COUNT(*) FROM affiliations").await?,
            review_flags: self.count("SELECT COUNT(*) FROM review_flags").await?,
            dead_letters: self.count("SELECT COUNT(*) FROM dead_letters").await?,
            open_violations: self.count("SELECT COUNT(*) FROM open_violations").await?,
            quality_metrics: self.count("SELECT COUNT(*) FROM quality_metrics").await?,
        })
    }
}
