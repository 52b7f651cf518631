//! Incremental change processing.
//!
//! A batch of [`ChangeEvent`]s is applied exactly once:
//!
//! 1. Completed batch ids short-circuit; every event is reported as skipped.
//! 2. Events are appended to the change log, idempotently per sequence.
//! 3. Undecodable events are dead-lettered (quarantined) and the batch goes on.
//! 4. Decoded captures are recorded in capture-timestamp order.
//! 5. Touched records are grouped into disjoint partitions
//!    (see [`build_partitions`]) that are re-matched and re-synthesized on a
//!    bounded worker pool, each under its own timeout.
//! 6. The batch is marked complete unless cancellation deferred some work.
//!
//! Only environment-level faults abort a batch; everything else is isolated
//! to the event or partition that caused it and reported in [`BatchResult`].

mod decode;
mod partition;


pub use decode::decode_event;
pub use partition::{Partition, build_partitions};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::affiliations::derive_affiliations;
use crate::config::{CredibilityTable, GoldrecConfig, ProcessorConfig};
use crate::matching::{FacilityMatcher, MatchOutcome, ProviderMatcher};
use crate::models::{
    Affiliation, ChangeEvent, Cluster, DeadLetter, EntityType, RecordKey, SourceRecord,
};
use crate::retry::with_retry;
use crate::store::{Capture, ClusterCommit, EntityStore, ReviewFlag};
use crate::synthesis::try_synthesize;
use crate::{GoldrecError, Result};

/// Why one event or partition was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub entity_key: Option<String>,
    /// Error classification, see `GoldrecError::kind`
    pub kind: String,
    pub message: String,
}

/// Outcome of one `process_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    /// Events applied by this call
    pub processed: usize,
    /// Events dead-lettered before processing
    pub quarantined: usize,
    /// Events applied by an earlier call
    pub skipped: usize,
    /// Events whose partition failed or timed out
    pub failed: usize,
    /// Events left for a resumed run after cancellation
    pub deferred: usize,
    /// Clusters that received a new golden version
    pub clusters_written: usize,
    pub clusters_retired: usize,
    pub flagged_for_review: usize,
    pub failures: Vec<BatchFailure>,
    pub cancelled: bool,
    pub already_completed: bool,
}

impl BatchResult {
    fn new(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            ..Self::default()
        }
    }

    fn record_failure(&mut self, entity_key: Option<String>, err: &GoldrecError) {
        self.failures.push(BatchFailure {
            entity_key,
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }
}

#[derive(Debug, Default)]
struct PartitionStats {
    written: usize,
    retired: usize,
    flagged: usize,
}

enum UnitOutcome {
    Done(PartitionStats),
    Deferred,
    Failed(GoldrecError),
}

/// Applies change batches to an entity store.
pub struct CdcProcessor {
    store: Arc<dyn EntityStore>,
    credibility: CredibilityTable,
    providers: ProviderMatcher,
    facilities: FacilityMatcher,
    limits: ProcessorConfig,
}

impl std::fmt::Debug for CdcProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcProcessor")
            .field("store", &self.store.backend())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl CdcProcessor {
    pub fn new(store: Arc<dyn EntityStore>, config: &GoldrecConfig) -> Self {
        Self {
            store,
            credibility: config.credibility.clone(),
            providers: ProviderMatcher::new(config.matching.clone()),
            facilities: FacilityMatcher::new(config.matching.clone()),
            limits: config.processor.clone(),
        }
    }

    /// Replaces the provider matcher, e.g. to plug in another name similarity.
    pub fn with_provider_matcher(mut self, matcher: ProviderMatcher) -> Self {
        self.providers = matcher;
        self
    }

    /// Processes a batch to completion.
    ///
    /// # Errors
    /// Returns an error only when the store is unreachable or the change log
    /// cannot be written.
    pub async fn process_batch(&self, batch_id: &str, events: &[ChangeEvent]) -> Result<BatchResult> {
        self.process_batch_with_cancel(batch_id, events, &CancellationToken::new())
            .await
    }

    /// Processes a batch, stopping between partitions once `cancel` fires.
    ///
    /// Partitions already committed stay committed. A cancelled batch is not
    /// marked complete; calling again with the same id resumes it.
    pub async fn process_batch_with_cancel(
        &self,
        batch_id: &str,
        events: &[ChangeEvent],
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        let mut result = BatchResult::new(batch_id);

        if self.store.is_batch_completed(batch_id).await? {
            tracing::info!(batch_id, events = events.len(), "Batch already completed, skipping");
            result.already_completed = true;
            result.skipped = events.len();
            return Ok(result);
        }

        let mut seen = BTreeSet::new();
        let mut logged: Vec<ChangeEvent> = Vec::with_capacity(events.len());
        for event in events {
            if event.batch_id != batch_id {
                let err = GoldrecError::malformed(format!(
                    "event {} belongs to batch '{}'",
                    event.sequence, event.batch_id
                ));
                self.quarantine(&mut result, batch_id, event, &err).await?;
            } else if !seen.insert(event.sequence) {
                let err = GoldrecError::malformed(format!(
                    "sequence {} appears more than once",
                    event.sequence
                ));
                self.quarantine(&mut result, batch_id, event, &err).await?;
            } else {
                logged.push(event.clone());
            }
        }

        let appended = with_retry(&self.limits.retry, "append change events", || {
            self.store.append_events(&logged)
        })
        .await?;
        let applied = self.store.applied_sequences(batch_id).await?;
        tracing::debug!(
            batch_id,
            appended,
            already_applied = applied.len(),
            "Change events logged"
        );

        let mut pending: Vec<(u64, Capture)> = Vec::new();
        for event in &logged {
            if applied.contains(&event.sequence) {
                result.skipped += 1;
                continue;
            }
            match decode_event(event) {
                Ok(capture) => pending.push((event.sequence, capture)),
                Err(err) => {
                    self.quarantine(&mut result, batch_id, event, &err).await?;
                    self.mark_applied(batch_id, &[event.sequence]).await?;
                }
            }
        }
        pending.sort_by(|(seq_a, a), (seq_b, b)| {
            a.captured_at()
                .cmp(&b.captured_at())
                .then(seq_a.cmp(seq_b))
        });

        let mut touched: BTreeMap<EntityType, BTreeMap<RecordKey, Vec<u64>>> = BTreeMap::new();
        for (sequence, capture) in &pending {
            let recorded = with_retry(&self.limits.retry, "record capture", || {
                self.store.record_capture(capture)
            })
            .await;
            match recorded {
                Ok(_) => touched
                    .entry(capture.entity_type())
                    .or_default()
                    .entry(capture.record_key())
                    .or_default()
                    .push(*sequence),
                Err(err) if err.is_environmental() => return Err(err),
                Err(err) => {
                    let key = capture.record_key().to_string();
                    self.dead_letter(batch_id, Some(key.clone()), &err, None).await?;
                    self.mark_applied(batch_id, &[*sequence]).await?;
                    result.failed += 1;
                    result.record_failure(Some(key), &err);
                }
            }
        }

        let mut partitions = Vec::new();
        for (entity_type, keys) in &touched {
            partitions.extend(build_partitions(self.store.as_ref(), *entity_type, keys).await?);
        }
        tracing::info!(
            batch_id,
            events = events.len(),
            partitions = partitions.len(),
            "Processing batch"
        );

        self.run_partitions(batch_id, &partitions, cancel, &mut result)
            .await?;

        if result.deferred > 0 {
            result.cancelled = true;
            tracing::warn!(
                batch_id,
                deferred = result.deferred,
                "Batch cancelled before all partitions ran; it can be resumed"
            );
        } else {
            self.store.complete_batch(batch_id, Utc::now()).await?;
        }

        tracing::info!(
            batch_id,
            processed = result.processed,
            quarantined = result.quarantined,
            skipped = result.skipped,
            failed = result.failed,
            clusters_written = result.clusters_written,
            clusters_retired = result.clusters_retired,
            flagged_for_review = result.flagged_for_review,
            "Batch finished"
        );
        Ok(result)
    }

    async fn run_partitions(
        &self,
        batch_id: &str,
        partitions: &[Partition],
        cancel: &CancellationToken,
        result: &mut BatchResult,
    ) -> Result<()> {
        let timeout = self.limits.unit_timeout();
        let units = partitions.iter().map(|partition| async move {
            if cancel.is_cancelled() {
                return (partition, UnitOutcome::Deferred);
            }
            let outcome = match tokio::time::timeout(timeout, self.process_partition(partition)).await {
                Ok(Ok(stats)) => UnitOutcome::Done(stats),
                Ok(Err(err)) => UnitOutcome::Failed(err),
                Err(_) => UnitOutcome::Failed(GoldrecError::Timeout {
                    unit: partition.label(),
                    after_ms: self.limits.unit_timeout_ms,
                }),
            };
            (partition, outcome)
        });

        let mut stream = stream::iter(units).buffer_unordered(self.limits.max_concurrency.max(1));
        while let Some((partition, outcome)) = stream.next().await {
            let events = partition.sequences.len();
            match outcome {
                UnitOutcome::Done(stats) => {
                    self.mark_applied(batch_id, &partition.sequences).await?;
                    result.processed += events;
                    result.clusters_written += stats.written;
                    result.clusters_retired += stats.retired;
                    result.flagged_for_review += stats.flagged;
                }
                UnitOutcome::Deferred => result.deferred += events,
                UnitOutcome::Failed(err) if err.is_environmental() => {
                    tracing::error!(
                        batch_id,
                        partition = %partition.label(),
                        error = %err,
                        "Entity store unavailable, aborting batch"
                    );
                    return Err(err);
                }
                UnitOutcome::Failed(err) => {
                    tracing::warn!(
                        batch_id,
                        partition = %partition.label(),
                        error = %err,
                        "Partition failed"
                    );
                    let records: Vec<String> = partition.keys.iter().map(ToString::to_string).collect();
                    let payload = serde_json::json!({
                        "sequences": partition.sequences,
                        "records": records,
                    });
                    self.dead_letter(batch_id, Some(partition.label()), &err, Some(payload))
                        .await?;
                    self.mark_applied(batch_id, &partition.sequences).await?;
                    result.failed += events;
                    result.record_failure(Some(partition.label()), &err);
                }
            }
        }
        Ok(())
    }

    /// Re-matches one partition and writes the clusters it produces.
    async fn process_partition(&self, partition: &Partition) -> Result<PartitionStats> {
        let keys: Vec<RecordKey> = partition.keys.iter().cloned().collect();
        match partition.entity_type {
            EntityType::Provider => {
                let records = self.store.providers_by_keys(&keys).await?;
                let outcome = self.providers.match_records(&records);
                self.apply_outcome(partition, &outcome, derive_affiliations)
                    .await
            }
            EntityType::Facility => {
                let records = self.store.facilities_by_keys(&keys).await?;
                let outcome = self.facilities.match_records(&records);
                self.apply_outcome(partition, &outcome, |_| Vec::new())
                    .await
            }
        }
    }

    async fn apply_outcome<R, F>(
        &self,
        partition: &Partition,
        outcome: &MatchOutcome<R>,
        affiliations: F,
    ) -> Result<PartitionStats>
    where
        R: SourceRecord,
        F: Fn(&Cluster<R>) -> Vec<Affiliation>,
    {
        for edge in &outcome.rejected {
            tracing::debug!(
                from = %edge.from,
                to = %edge.to,
                tier = edge.tier.as_str(),
                "Refused edge joining two anchored entities"
            );
        }

        let mut stats = PartitionStats::default();
        let mut live: BTreeSet<&str> = BTreeSet::new();
        let mut held: BTreeSet<RecordKey> = BTreeSet::new();
        let now = Utc::now();

        for cluster in &outcome.clusters {
            match try_synthesize(cluster, &self.credibility) {
                Ok(golden) => {
                    let commit = ClusterCommit::new(golden, affiliations(cluster), now);
                    let committed = with_retry(&self.limits.retry, "commit cluster", || {
                        self.store.commit_cluster(&commit)
                    })
                    .await?;
                    tracing::debug!(
                        cluster_id = %cluster.id,
                        version = committed.version(),
                        written = committed.is_write(),
                        "Committed cluster"
                    );
                    if committed.is_write() {
                        stats.written += 1;
                    }
                    live.insert(cluster.id.as_str());
                }
                Err(err) => {
                    tracing::warn!(cluster_id = %cluster.id, error = %err, "Cluster held for review");
                    let flag = ReviewFlag {
                        cluster_id: cluster.id.clone(),
                        entity_type: cluster.entity_type,
                        reason: cluster.ambiguity.clone().unwrap_or_else(|| err.to_string()),
                        members: cluster.member_keys(),
                        flagged_at: now,
                    };
                    with_retry(&self.limits.retry, "flag cluster for review", || {
                        self.store.flag_for_review(&flag)
                    })
                    .await?;
                    held.extend(cluster.member_keys());
                    stats.flagged += 1;
                }
            }
        }

        for cluster_id in &partition.prior_clusters {
            if live.contains(cluster_id.as_str()) {
                continue;
            }
            let members = self.store.cluster_members(cluster_id).await?;
            if members.iter().any(|m| held.contains(m)) {
                tracing::debug!(cluster_id = %cluster_id, "Keeping prior cluster while under review");
                continue;
            }
            let retired = with_retry(&self.limits.retry, "retire cluster", || {
                self.store.retire_cluster(cluster_id, now)
            })
            .await?;
            if retired {
                tracing::debug!(cluster_id = %cluster_id, "Retired absorbed cluster");
                stats.retired += 1;
            }
        }
        Ok(stats)
    }

    async fn quarantine(
        &self,
        result: &mut BatchResult,
        batch_id: &str,
        event: &ChangeEvent,
        err: &GoldrecError,
    ) -> Result<()> {
        let key = event.record_key().to_string();
        tracing::warn!(batch_id, sequence = event.sequence, record = %key, error = %err, "Quarantined event");
        self.dead_letter(batch_id, Some(key.clone()), err, serde_json::to_value(event).ok())
            .await?;
        result.quarantined += 1;
        result.record_failure(Some(key), err);
        Ok(())
    }

    async fn dead_letter(
        &self,
        batch_id: &str,
        entity_key: Option<String>,
        err: &GoldrecError,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let letter = DeadLetter {
            batch_id: batch_id.to_string(),
            entity_key,
            reason: err.kind().to_string(),
            message: err.to_string(),
            payload,
            recorded_at: Utc::now(),
        };
        with_retry(&self.limits.retry, "write dead letter", || {
            self.store.dead_letter(&letter)
        })
        .await
    }

    async fn mark_applied(&self, batch_id: &str, sequences: &[u64]) -> Result<()> {
        with_retry(&self.limits.retry, "mark events applied", || {
            self.store.mark_applied(batch_id, sequences)
        })
        .await
    }
}
