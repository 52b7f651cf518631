//! Entity store: the durable boundary of the pipeline.
//!
//! Everything the engines read or write goes through [`EntityStore`]:
//!
//! - the append-only change log and completed batch ids,
//! - raw captures (append-only history plus the current version per key),
//! - cluster membership, versioned golden records and affiliations,
//! - review flags and dead letters,
//! - violations, activity counts and the quality metric time series.
//!
//! Two implementations ship: [`MemoryStore`] for tests and embedding, and
//! `SqliteStore` (feature `sqlite`) for durable use.
//!
//! # Object Safety
//! The trait is object-safe and the engines hold it as
//! `Arc<dyn EntityStore>`.

mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(test)]
pub(crate) mod test_support;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::matching::{facility_blocking_keys, provider_blocking_keys};
use crate::models::{
    ActivityCount, Affiliation, ChangeEvent, DeadLetter, EntityGraph, EntityType, FacilityRecord,
    GoldenRecord, RawProviderRecord, RecordKey, Violation, ViolationKey, ViolationStatus,
    ViolationWrite,
};
use crate::quality::QualityMetric;
use crate::{GoldrecError, Result};

/// Attempts at a guarded steward update before giving up.
const STEWARD_WRITE_ATTEMPTS: usize = 3;

/// One immutable capture of a source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Capture {
    Provider(RawProviderRecord),
    Facility(FacilityRecord),
    /// The source deleted the row
    Retraction {
        entity_type: EntityType,
        key: RecordKey,
        captured_at: DateTime<Utc>,
    },
}

impl Capture {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Capture::Provider(_) => EntityType::Provider,
            Capture::Facility(_) => EntityType::Facility,
            Capture::Retraction { entity_type, .. } => *entity_type,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        match self {
            Capture::Provider(record) => RecordKey::new(&record.source, &record.natural_key),
            Capture::Facility(record) => RecordKey::new(&record.source, &record.natural_key),
            Capture::Retraction { key, .. } => key.clone(),
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        match self {
            Capture::Provider(record) => record.captured_at,
            Capture::Facility(record) => record.captured_at,
            Capture::Retraction { captured_at, .. } => *captured_at,
        }
    }

    pub fn is_retraction(&self) -> bool {
        matches!(self, Capture::Retraction { .. })
    }

    /// Blocking keys of the captured row; retractions have none.
    pub fn blocking_keys(&self) -> Vec<String> {
        match self {
            Capture::Provider(record) => provider_blocking_keys(record),
            Capture::Facility(record) => facility_blocking_keys(record),
            Capture::Retraction { .. } => Vec::new(),
        }
    }
}

/// Everything written for one cluster in a single transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCommit {
    /// Synthesized record; its `source_records` become the membership
    pub golden: GoldenRecord,
    /// Replaces the cluster's affiliations (providers only)
    pub affiliations: Vec<Affiliation>,
    pub committed_at: DateTime<Utc>,
}

impl ClusterCommit {
    pub fn new(golden: GoldenRecord, affiliations: Vec<Affiliation>, committed_at: DateTime<Utc>) -> Self {
        Self {
            golden,
            affiliations,
            committed_at,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.golden.cluster_id
    }
}

/// Result of a cluster commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "version", rename_all = "snake_case")]
pub enum CommitOutcome {
    /// First golden record for the cluster
    Created(u32),
    /// A new version superseded the previous one
    Updated(u32),
    /// Synthesized content matched the active version; nothing versioned
    Unchanged(u32),
}

impl CommitOutcome {
    pub fn version(&self) -> u32 {
        match self {
            CommitOutcome::Created(v) | CommitOutcome::Updated(v) | CommitOutcome::Unchanged(v) => {
                *v
            }
        }
    }

    /// Whether a new golden version was written.
    pub fn is_write(&self) -> bool {
        !matches!(self, CommitOutcome::Unchanged(_))
    }
}

/// A cluster held back from synthesis for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub cluster_id: String,
    pub entity_type: EntityType,
    pub reason: String,
    pub members: Vec<RecordKey>,
    pub flagged_at: DateTime<Utc>,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub current_providers: u64,
    pub current_facilities: u64,
    pub change_events: u64,
    pub completed_batches: u64,
    pub active_golden_records: u64,
    pub superseded_golden_records: u64,
    pub affiliations: u64,
    pub review_flags: u64,
    pub dead_letters: u64,
    pub open_violations: u64,
    pub quality_metrics: u64,
}

/// Storage boundary for the master-data pipeline.
///
/// Writes that touch a cluster go through [`EntityStore::commit_cluster`]
/// and [`EntityStore::retire_cluster`], which are atomic. All other writes
/// are idempotent so that a resumed batch can repeat them safely.
///
/// # Errors
/// Implementations return `Persistence` for failures worth retrying and
/// `StoreUnavailable` when the backend cannot be reached at all.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> Result<()>;

    // ---- change log ----

    /// Appends events, ignoring `(batch_id, sequence)` pairs already stored.
    ///
    /// Returns the number of newly stored events.
    async fn append_events(&self, events: &[ChangeEvent]) -> Result<usize>;

    /// Stored events of a batch in sequence order.
    async fn batch_events(&self, batch_id: &str) -> Result<Vec<ChangeEvent>>;

    /// Sequences of a batch that were already consumed.
    async fn applied_sequences(&self, batch_id: &str) -> Result<BTreeSet<u64>>;

    /// Marks events of a batch as consumed.
    async fn mark_applied(&self, batch_id: &str, sequences: &[u64]) -> Result<()>;

    async fn is_batch_completed(&self, batch_id: &str) -> Result<bool>;

    async fn complete_batch(&self, batch_id: &str, completed_at: DateTime<Utc>) -> Result<()>;

    // ---- raw captures ----

    /// Appends a capture to the history of its record key.
    ///
    /// The capture becomes current when it is at least as recent as the
    /// current version; a current retraction removes the row. A capture with
    /// the same key and timestamp as a stored one is ignored.
    ///
    /// Returns whether the current view changed.
    async fn record_capture(&self, capture: &Capture) -> Result<bool>;

    /// Capture history of one row, oldest first.
    async fn capture_history(&self, entity_type: EntityType, key: &RecordKey) -> Result<Vec<Capture>>;

    async fn current_providers(&self) -> Result<Vec<RawProviderRecord>>;

    async fn current_facilities(&self) -> Result<Vec<FacilityRecord>>;

    async fn providers_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<RawProviderRecord>>;

    async fn facilities_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<FacilityRecord>>;

    /// Current rows carrying any of the blocking keys.
    async fn keys_by_blocking_key(
        &self,
        entity_type: EntityType,
        blocking_keys: &[String],
    ) -> Result<BTreeSet<RecordKey>>;

    // ---- clusters and golden records ----

    /// Cluster a row currently belongs to.
    async fn cluster_of(&self, entity_type: EntityType, key: &RecordKey) -> Result<Option<String>>;

    /// Rows currently assigned to a cluster.
    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<RecordKey>>;

    /// Writes golden record, membership and affiliations of one cluster
    /// atomically. Identical content does not create a new version. Any
    /// review flag on the cluster is cleared.
    async fn commit_cluster(&self, commit: &ClusterCommit) -> Result<CommitOutcome>;

    /// Supersedes the active golden record and drops membership and
    /// affiliations of a cluster that no longer exists.
    ///
    /// Returns whether an active golden record was retired.
    async fn retire_cluster(&self, cluster_id: &str, retired_at: DateTime<Utc>) -> Result<bool>;

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()>;

    async fn review_flags(&self) -> Result<Vec<ReviewFlag>>;

    async fn active_golden(&self, cluster_id: &str) -> Result<Option<GoldenRecord>>;

    /// Every version of a cluster's golden record, oldest first.
    async fn golden_history(&self, cluster_id: &str) -> Result<Vec<GoldenRecord>>;

    /// Active golden records of all clusters, ordered by cluster id.
    async fn active_golden_records(&self) -> Result<Vec<GoldenRecord>>;

    async fn affiliations(&self) -> Result<Vec<Affiliation>>;

    // ---- dead letters ----

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    // ---- violations ----

    async fn violations(&self) -> Result<Vec<Violation>>;

    /// Inserts or replaces violations by key, unconditionally.
    async fn upsert_violations(&self, violations: &[Violation]) -> Result<()>;

    /// Applies violation writes atomically, each only if the stored row
    /// still has the expected status (or is still absent).
    ///
    /// Returns the keys whose stored row changed in the meantime; nothing is
    /// written for them.
    async fn compare_and_set_violations(&self, writes: &[ViolationWrite]) -> Result<Vec<ViolationKey>>;

    // ---- activity ----

    /// Inserts or replaces counts by `(entity_id, period)`.
    async fn record_activity(&self, counts: &[ActivityCount]) -> Result<()>;

    async fn activity(&self) -> Result<Vec<ActivityCount>>;

    // ---- quality ----

    /// Appends a metric; an existing `(table, date, batch)` entry is kept.
    ///
    /// Returns whether the metric was stored.
    async fn append_quality_metric(&self, metric: &QualityMetric) -> Result<bool>;

    /// Metrics of a table ordered by measurement time.
    async fn quality_history(&self, table: &str) -> Result<Vec<QualityMetric>>;

    // ---- reads ----

    async fn stats(&self) -> Result<StoreStats>;

    /// Read of the current golden graph for evaluation and scoring.
    ///
    /// Implementations should read everything at one point in time; this
    /// default issues separate reads.
    async fn snapshot(&self) -> Result<EntityGraph> {
        let (providers, facilities) = self
            .active_golden_records()
            .await?
            .into_iter()
            .partition(|g| g.entity_type == EntityType::Provider);
        Ok(EntityGraph {
            providers,
            facilities,
            affiliations: self.affiliations().await?,
            violations: self.violations().await?,
            activity: self.activity().await?,
            current_providers: self.current_providers().await?,
            current_facilities: self.current_facilities().await?,
            taken_at: Some(Utc::now()),
        })
    }

    /// Applies a steward decision to one violation.
    ///
    /// The write is guarded on the status that was read, so a concurrent
    /// evaluation cannot be overwritten; the decision is re-applied to the
    /// fresh row a few times before giving up.
    ///
    /// # Errors
    /// Returns a configuration error for an unknown key,
    /// `InvalidTransition` for a change the lifecycle forbids and
    /// `ConcurrentModification` if the row keeps changing.
    async fn set_violation_status(
        &self,
        key: &ViolationKey,
        status: ViolationStatus,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Violation> {
        for _ in 0..STEWARD_WRITE_ATTEMPTS {
            let mut violation = self
                .violations()
                .await?
                .into_iter()
                .find(|v| &v.key() == key)
                .ok_or_else(|| {
                    GoldrecError::configuration(format!(
                        "no violation for rule '{}' on {} '{}'",
                        key.rule_name, key.entity_type, key.entity_id
                    ))
                })?;
            let expected = Some(violation.status);

            if status == ViolationStatus::Open && violation.status.is_manual_override() {
                violation.clear_override(at)?;
            } else {
                violation.transition(status, at, note.clone())?;
            }
            let write = ViolationWrite {
                violation,
                expected,
            };
            if self
                .compare_and_set_violations(std::slice::from_ref(&write))
                .await?
                .is_empty()
            {
                return Ok(write.violation);
            }
            tracing::debug!(
                rule = %key.rule_name,
                entity_id = %key.entity_id,
                "Violation changed while updating, retrying"
            );
        }
        Err(GoldrecError::concurrent_modification(format!(
            "violation for rule '{}' on {} '{}' kept changing",
            key.rule_name, key.entity_type, key.entity_id
        )))
    }
}
