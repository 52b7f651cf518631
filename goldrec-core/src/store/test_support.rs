//! Store wrapper with injectable faults for engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::{Capture, ClusterCommit, CommitOutcome, EntityStore, MemoryStore, ReviewFlag, StoreStats};
use crate::models::{
    ActivityCount, Affiliation, ChangeEvent, DeadLetter, EntityType, FacilityRecord, GoldenRecord,
    RawProviderRecord, RecordKey, Violation, ViolationKey, ViolationStatus, ViolationWrite,
};
use crate::quality::QualityMetric;
use crate::{GoldrecError, Result};

/// Memory store with injectable commit faults and a steward decision that
/// lands just before the next guarded violation write.
pub(crate) struct FaultyStore {
    pub(crate) inner: MemoryStore,
    commit_failures: AtomicU32,
    commit_delay: Option<Duration>,
    unavailable: bool,
    steward_decision: Mutex<Option<(ViolationKey, ViolationStatus)>>,
}

impl FaultyStore {
    pub(crate) fn failing(times: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            commit_failures: AtomicU32::new(times),
            commit_delay: None,
            unavailable: false,
            steward_decision: Mutex::new(None),
        }
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            commit_delay: Some(delay),
            ..Self::failing(0)
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            unavailable: true,
            ..Self::failing(0)
        }
    }

    /// Applies `status` to `key` right before the next guarded write.
    pub(crate) fn steward_before_next_write(&self, key: ViolationKey, status: ViolationStatus) {
        *self.steward_decision.lock().unwrap() = Some((key, status));
    }
}

#[async_trait]
impl EntityStore for FaultyStore {
    fn backend(&self) -> &'static str {
        "faulty"
    }
    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
    async fn append_events(&self, events: &[ChangeEvent]) -> Result<usize> {
        self.inner.append_events(events).await
    }
    async fn batch_events(&self, batch_id: &str) -> Result<Vec<ChangeEvent>> {
        self.inner.batch_events(batch_id).await
    }
    async fn applied_sequences(&self, batch_id: &str) -> Result<BTreeSet<u64>> {
        self.inner.applied_sequences(batch_id).await
    }
    async fn mark_applied(&self, batch_id: &str, sequences: &[u64]) -> Result<()> {
        self.inner.mark_applied(batch_id, sequences).await
    }
    async fn is_batch_completed(&self, batch_id: &str) -> Result<bool> {
        self.inner.is_batch_completed(batch_id).await
    }
    async fn complete_batch(&self, batch_id: &str, completed_at: DateTime<Utc>) -> Result<()> {
        self.inner.complete_batch(batch_id, completed_at).await
    }
    async fn record_capture(&self, capture: &Capture) -> Result<bool> {
        self.inner.record_capture(capture).await
    }
    async fn capture_history(&self, entity_type: EntityType, key: &RecordKey) -> Result<Vec<Capture>> {
        self.inner.capture_history(entity_type, key).await
    }
    async fn current_providers(&self) -> Result<Vec<RawProviderRecord>> {
        self.inner.current_providers().await
    }
    async fn current_facilities(&self) -> Result<Vec<FacilityRecord>> {
        self.inner.current_facilities().await
    }
    async fn providers_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<RawProviderRecord>> {
        self.inner.providers_by_keys(keys).await
    }
    async fn facilities_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<FacilityRecord>> {
        self.inner.facilities_by_keys(keys).await
    }
    async fn keys_by_blocking_key(
        &self,
        entity_type: EntityType,
        blocking_keys: &[String],
    ) -> Result<BTreeSet<RecordKey>> {
        self.inner.keys_by_blocking_key(entity_type, blocking_keys).await
    }
    async fn cluster_of(&self, entity_type: EntityType, key: &RecordKey) -> Result<Option<String>> {
        self.inner.cluster_of(entity_type, key).await
    }
    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<RecordKey>> {
        self.inner.cluster_members(cluster_id).await
    }
    async fn commit_cluster(&self, commit: &ClusterCommit) -> Result<CommitOutcome> {
        if self.unavailable {
            return Err(GoldrecError::store_unavailable(
                "committing cluster",
                std::io::Error::other("connection refused"),
            ));
        }
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }
        if self.commit_failures.load(Ordering::SeqCst) > 0 {
            self.commit_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(GoldrecError::persistence(
                "committing cluster",
                std::io::Error::other("database is locked"),
            ));
        }
        self.inner.commit_cluster(commit).await
    }
    async fn retire_cluster(&self, cluster_id: &str, retired_at: DateTime<Utc>) -> Result<bool> {
        self.inner.retire_cluster(cluster_id, retired_at).await
    }
    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()> {
        self.inner.flag_for_review(flag).await
    }
    async fn review_flags(&self) -> Result<Vec<ReviewFlag>> {
        self.inner.review_flags().await
    }
    async fn active_golden(&self, cluster_id: &str) -> Result<Option<GoldenRecord>> {
        self.inner.active_golden(cluster_id).await
    }
    async fn golden_history(&self, cluster_id: &str) -> Result<Vec<GoldenRecord>> {
        self.inner.golden_history(cluster_id).await
    }
    async fn active_golden_records(&self) -> Result<Vec<GoldenRecord>> {
        self.inner.active_golden_records().await
    }
    async fn affiliations(&self) -> Result<Vec<Affiliation>> {
        self.inner.affiliations().await
    }
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.inner.dead_letter(letter).await
    }
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters().await
    }
    async fn violations(&self) -> Result<Vec<Violation>> {
        self.inner.violations().await
    }
    async fn upsert_violations(&self, violations: &[Violation]) -> Result<()> {
        self.inner.upsert_violations(violations).await
    }
    async fn compare_and_set_violations(&self, writes: &[ViolationWrite]) -> Result<Vec<ViolationKey>> {
        let decision = self.steward_decision.lock().unwrap().take();
        if let Some((key, status)) = decision {
            self.inner
                .set_violation_status(&key, status, Some("steward decision".to_string()), Utc::now())
                .await?;
        }
        self.inner.compare_and_set_violations(writes).await
    }
    async fn record_activity(&self, counts: &[ActivityCount]) -> Result<()> {
        self.inner.record_activity(counts).await
    }
    async fn activity(&self) -> Result<Vec<ActivityCount>> {
        self.inner.activity().await
    }
    async fn append_quality_metric(&self, metric: &QualityMetric) -> Result<bool> {
        self.inner.append_quality_metric(metric).await
    }
    async fn quality_history(&self, table: &str) -> Result<Vec<QualityMetric>> {
        self.inner.quality_history(table).await
    }
    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}
