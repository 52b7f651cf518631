//! In-memory entity store.
//!
//! All state sits behind one `RwLock`; every trait method takes the lock
//! once, so cluster commits are atomic and snapshots are point-in-time.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

use super::{Capture, ClusterCommit, CommitOutcome, EntityStore, ReviewFlag, StoreStats};
use crate::Result;
use crate::models::{
    ActivityCount, Affiliation, ChangeEvent, DeadLetter, EntityGraph, EntityType, FacilityRecord,
    GoldenRecord, RawProviderRecord, RecordKey, Violation, ViolationKey, ViolationWrite,
};
use crate::quality::QualityMetric;

type RowId = (EntityType, RecordKey);

#[derive(Debug, Default)]
struct MemoryState {
    events: BTreeMap<(String, u64), ChangeEvent>,
    applied: BTreeSet<(String, u64)>,
    completed: BTreeMap<String, DateTime<Utc>>,
    captures: BTreeMap<RowId, Vec<Capture>>,
    current: BTreeMap<RowId, Capture>,
    blocking: BTreeMap<(EntityType, String), BTreeSet<RecordKey>>,
    membership: BTreeMap<RowId, String>,
    golden: BTreeMap<String, Vec<GoldenRecord>>,
    affiliations: BTreeMap<String, Vec<Affiliation>>,
    review_flags: BTreeMap<String, ReviewFlag>,
    dead_letters: Vec<DeadLetter>,
    violations: BTreeMap<ViolationKey, Violation>,
    activity: BTreeMap<(String, NaiveDate), u64>,
    quality: Vec<QualityMetric>,
}

impl MemoryState {
    fn current_providers(&self) -> Vec<RawProviderRecord> {
        self.current
            .values()
            .filter_map(|c| match c {
                Capture::Provider(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    fn current_facilities(&self) -> Vec<FacilityRecord> {
        self.current
            .values()
            .filter_map(|c| match c {
                Capture::Facility(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    fn set_current(&mut self, id: RowId, capture: Option<Capture>) {
        if let Some(previous) = self.current.remove(&id) {
            for key in previous.blocking_keys() {
                let bucket = (id.0, key);
                if let Some(rows) = self.blocking.get_mut(&bucket) {
                    rows.remove(&id.1);
                    if rows.is_empty() {
                        self.blocking.remove(&bucket);
                    }
                }
            }
        }
        if let Some(capture) = capture {
            for key in capture.blocking_keys() {
                self.blocking
                    .entry((id.0, key))
                    .or_default()
                    .insert(id.1.clone());
            }
            self.current.insert(id, capture);
        }
    }

    fn active_golden(&self, cluster_id: &str) -> Option<&GoldenRecord> {
        self.golden
            .get(cluster_id)
            .and_then(|versions| versions.iter().find(|g| g.active))
    }

    fn retire(&mut self, cluster_id: &str, at: DateTime<Utc>) -> bool {
        let mut retired = false;
        if let Some(versions) = self.golden.get_mut(cluster_id) {
            for golden in versions.iter_mut().filter(|g| g.active) {
                golden.active = false;
                golden.superseded_at = Some(at);
                retired = true;
            }
        }
        self.membership.retain(|_, cluster| cluster != cluster_id);
        self.affiliations.remove(cluster_id);
        self.review_flags.remove(cluster_id);
        retired
    }
}

/// Entity store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn append_events(&self, events: &[ChangeEvent]) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut stored = 0;
        for event in events {
            let id = (event.batch_id.clone(), event.sequence);
            if !state.events.contains_key(&id) {
                state.events.insert(id, event.clone());
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn batch_events(&self, batch_id: &str) -> Result<Vec<ChangeEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|((batch, _), _)| batch == batch_id)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn applied_sequences(&self, batch_id: &str) -> Result<BTreeSet<u64>> {
        let state = self.state.read().await;
        Ok(state
            .applied
            .iter()
            .filter(|(batch, _)| batch == batch_id)
            .map(|(_, sequence)| *sequence)
            .collect())
    }

    async fn mark_applied(&self, batch_id: &str, sequences: &[u64]) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .applied
            .extend(sequences.iter().map(|s| (batch_id.to_string(), *s)));
        Ok(())
    }

    async fn is_batch_completed(&self, batch_id: &str) -> Result<bool> {
        Ok(self.state.read().await.completed.contains_key(batch_id))
    }

    async fn complete_batch(&self, batch_id: &str, completed_at: DateTime<Utc>) -> Result<()> {
        self.state
            .write()
            .await
            .completed
            .entry(batch_id.to_string())
            .or_insert(completed_at);
        Ok(())
    }

    async fn record_capture(&self, capture: &Capture) -> Result<bool> {
        let mut state = self.state.write().await;
        let id = (capture.entity_type(), capture.record_key());
        let history = state.captures.entry(id.clone()).or_default();
        if history
            .iter()
            .any(|c| c.captured_at() == capture.captured_at())
        {
            return Ok(false);
        }
        history.push(capture.clone());
        history.sort_by_key(Capture::captured_at);

        let newest = history
            .last()
            .is_some_and(|latest| latest.captured_at() == capture.captured_at());
        if !newest {
            return Ok(false);
        }
        if capture.is_retraction() {
            let existed = state.current.contains_key(&id);
            state.set_current(id, None);
            Ok(existed)
        } else {
            state.set_current(id, Some(capture.clone()));
            Ok(true)
        }
    }

    async fn capture_history(&self, entity_type: EntityType, key: &RecordKey) -> Result<Vec<Capture>> {
        let state = self.state.read().await;
        Ok(state
            .captures
            .get(&(entity_type, key.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn current_providers(&self) -> Result<Vec<RawProviderRecord>> {
        Ok(self.state.read().await.current_providers())
    }

    async fn current_facilities(&self) -> Result<Vec<FacilityRecord>> {
        Ok(self.state.read().await.current_facilities())
    }

    async fn providers_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<RawProviderRecord>> {
        let state = self.state.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| match state.current.get(&(EntityType::Provider, key.clone())) {
                Some(Capture::Provider(record)) => Some(record.clone()),
                _ => None,
            })
            .collect())
    }

    async fn facilities_by_keys(&self, keys: &[RecordKey]) -> Result<Vec<FacilityRecord>> {
        let state = self.state.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| match state.current.get(&(EntityType::Facility, key.clone())) {
                Some(Capture::Facility(record)) => Some(record.clone()),
                _ => None,
            })
            .collect())
    }

    async fn keys_by_blocking_key(
        &self,
        entity_type: EntityType,
        blocking_keys: &[String],
    ) -> Result<BTreeSet<RecordKey>> {
        let state = self.state.read().await;
        Ok(blocking_keys
            .iter()
            .filter_map(|key| state.blocking.get(&(entity_type, key.clone())))
            .flatten()
            .cloned()
            .collect())
    }

    async fn cluster_of(&self, entity_type: EntityType, key: &RecordKey) -> Result<Option<String>> {
        let state = self.state.read().await;
        Ok(state.membership.get(&(entity_type, key.clone())).cloned())
    }

    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<RecordKey>> {
        let state = self.state.read().await;
        Ok(state
            .membership
            .iter()
            .filter(|(_, cluster)| cluster.as_str() == cluster_id)
            .map(|((_, key), _)| key.clone())
            .collect())
    }

    async fn commit_cluster(&self, commit: &ClusterCommit) -> Result<CommitOutcome> {
        let mut state = self.state.write().await;
        let cluster_id = commit.cluster_id().to_string();
        let entity_type = commit.golden.entity_type;
        let at = commit.committed_at;

        let active = state
            .active_golden(&cluster_id)
            .map(|g| (g.version, g.same_content(&commit.golden)));
        let outcome = match active {
            Some((version, true)) => CommitOutcome::Unchanged(version),
            _ => {
                let latest = state
                    .golden
                    .get(&cluster_id)
                    .and_then(|versions| versions.iter().map(|g| g.version).max());
                let version = latest.map_or(1, |v| v + 1);
                let outcome = if version == 1 {
                    CommitOutcome::Created(version)
                } else {
                    CommitOutcome::Updated(version)
                };
                let versions = state.golden.entry(cluster_id.clone()).or_default();
                for previous in versions.iter_mut().filter(|g| g.active) {
                    previous.active = false;
                    previous.superseded_at = Some(at);
                }
                versions.push(GoldenRecord {
                    version,
                    active: true,
                    created_at: Some(at),
                    superseded_at: None,
                    ..commit.golden.clone()
                });
                outcome
            }
        };

        state.membership.retain(|_, cluster| *cluster != cluster_id);
        for key in &commit.golden.source_records {
            state
                .membership
                .insert((entity_type, key.clone()), cluster_id.clone());
        }
        if entity_type == EntityType::Provider {
            if commit.affiliations.is_empty() {
                state.affiliations.remove(&cluster_id);
            } else {
                state
                    .affiliations
                    .insert(cluster_id.clone(), commit.affiliations.clone());
            }
        }
        state.review_flags.remove(&cluster_id);
        Ok(outcome)
    }

    async fn retire_cluster(&self, cluster_id: &str, retired_at: DateTime<Utc>) -> Result<bool> {
        Ok(self.state.write().await.retire(cluster_id, retired_at))
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()> {
        self.state
            .write()
            .await
            .review_flags
            .insert(flag.cluster_id.clone(), flag.clone());
        Ok(())
    }

    async fn review_flags(&self) -> Result<Vec<ReviewFlag>> {
        Ok(self.state.read().await.review_flags.values().cloned().collect())
    }

    async fn active_golden(&self, cluster_id: &str) -> Result<Option<GoldenRecord>> {
        Ok(self.state.read().await.active_golden(cluster_id).cloned())
    }

    async fn golden_history(&self, cluster_id: &str) -> Result<Vec<GoldenRecord>> {
        let state = self.state.read().await;
        Ok(state.golden.get(cluster_id).cloned().unwrap_or_default())
    }

    async fn active_golden_records(&self) -> Result<Vec<GoldenRecord>> {
        let state = self.state.read().await;
        Ok(state
            .golden
            .values()
            .flatten()
            .filter(|g| g.active)
            .cloned()
            .collect())
    }

    async fn affiliations(&self) -> Result<Vec<Affiliation>> {
        let state = self.state.read().await;
        Ok(state.affiliations.values().flatten().cloned().collect())
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.state.write().await.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.read().await.dead_letters.clone())
    }

    async fn violations(&self) -> Result<Vec<Violation>> {
        Ok(self.state.read().await.violations.values().cloned().collect())
    }

    async fn upsert_violations(&self, violations: &[Violation]) -> Result<()> {
        let mut state = self.state.write().await;
        for violation in violations {
            state.violations.insert(violation.key(), violation.clone());
        }
        Ok(())
    }

    async fn compare_and_set_violations(&self, writes: &[ViolationWrite]) -> Result<Vec<ViolationKey>> {
        let mut state = self.state.write().await;
        let mut conflicts = Vec::new();
        for write in writes {
            let key = write.violation.key();
            let stored = state.violations.get(&key).map(|v| v.status);
            if stored == write.expected {
                state.violations.insert(key, write.violation.clone());
            } else {
                conflicts.push(key);
            }
        }
        Ok(conflicts)
    }

    async fn record_activity(&self, counts: &[ActivityCount]) -> Result<()> {
        let mut state = self.state.write().await;
        for count in counts {
            state
                .activity
                .insert((count.entity_id.clone(), count.period), count.count);
        }
        Ok(())
    }

    async fn activity(&self) -> Result<Vec<ActivityCount>> {
        let state = self.state.read().await;
        Ok(state
            .activity
            .iter()
            .map(|((entity_id, period), count)| ActivityCount {
                entity_id: entity_id.clone(),
                period: *period,
                count: *count,
            })
            .collect())
    }

    async fn append_quality_metric(&self, metric: &QualityMetric) -> Result<bool> {
        let mut state = self.state.write().await;
        let exists = state.quality.iter().any(|m| {
            m.table_name == metric.table_name
                && m.measurement_date == metric.measurement_date
                && m.batch_id == metric.batch_id
        });
        if exists {
            return Ok(false);
        }
        state.quality.push(metric.clone());
        Ok(true)
    }

    async fn quality_history(&self, table: &str) -> Result<Vec<QualityMetric>> {
        let state = self.state.read().await;
        let mut history: Vec<QualityMetric> = state
            .quality
            .iter()
            .filter(|m| m.table_name == table)
            .cloned()
            .collect();
        history.sort_by_key(|m| (m.measurement_date, m.measured_at));
        Ok(history)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.read().await;
        let count = |n: usize| n as u64;
        let golden = state.golden.values().flatten();
        let active = golden.clone().filter(|g| g.active).count();
        Ok(StoreStats {
            current_providers: count(
                state
                    .current
                    .keys()
                    .filter(|(t, _)| *t == EntityType::Provider)
                    .count(),
            ),
            current_facilities: count(
                state
                    .current
                    .keys()
                    .filter(|(t, _)| *t == EntityType::Facility)
                    .count(),
            ),
            change_events: count(state.events.len()),
            completed_batches: count(state.completed.len()),
            active_golden_records: count(active),
            superseded_golden_records: count(golden.count() - active),
            affiliations: count(state.affiliations.values().map(Vec::len).sum()),
            review_flags: count(state.review_flags.len()),
            dead_letters: count(state.dead_letters.len()),
            open_violations: count(
                state
                    .violations
                    .values()
                    .filter(|v| v.status.is_active())
                    .count(),
            ),
            quality_metrics: count(state.quality.len()),
        })
    }

    async fn snapshot(&self) -> Result<EntityGraph> {
        let state = self.state.read().await;
        let (providers, facilities) = state
            .golden
            .values()
            .flatten()
            .filter(|g| g.active)
            .cloned()
            .partition(|g| g.entity_type == EntityType::Provider);
        Ok(EntityGraph {
            providers,
            facilities,
            affiliations: state.affiliations.values().flatten().cloned().collect(),
            violations: state.violations.values().cloned().collect(),
            activity: state
                .activity
                .iter()
                .map(|((entity_id, period), count)| ActivityCount {
                    entity_id: entity_id.clone(),
                    period: *period,
                    count: *count,
                })
                .collect(),
            current_providers: state.current_providers(),
            current_facilities: state.current_facilities(),
            taken_at: Some(Utc::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, ResolvedField, Severity, ViolationStatus};
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
    }

    fn provider(key: &str, npi: &str, day: u32) -> Capture {
        let mut record = RawProviderRecord::new("cms", key, at(day));
        record.npi = Some(npi.to_string());
        Capture::Provider(record)
    }

    fn golden(cluster_id: &str, members: &[&str], specialty: &str) -> GoldenRecord {
        let mut fields = BTreeMap::new();
        fields.insert(
            "specialty".to_string(),
            ResolvedField {
                value: Some(crate::models::FieldValue::Text(specialty.to_string())),
                ..ResolvedField::absent()
            },
        );
        GoldenRecord {
            cluster_id: cluster_id.to_string(),
            entity_type: EntityType::Provider,
            fields,
            source_records: members.iter().map(|m| RecordKey::new("cms", *m)).collect(),
            last_captured_at: Some(at(1)),
            version: 0,
            active: true,
            created_at: None,
            superseded_at: None,
        }
    }

    #[tokio::test]
    async fn test_newer_capture_replaces_current() {
        let store = MemoryStore::new();
        assert!(store.record_capture(&provider("1", "1234567893", 1)).await.unwrap());
        assert!(store.record_capture(&provider("1", "1245319599", 3)).await.unwrap());
        // late arrival is kept in history only
        assert!(!store.record_capture(&provider("1", "1000000004", 2)).await.unwrap());
        // repeat is ignored
        assert!(!store.record_capture(&provider("1", "1245319599", 3)).await.unwrap());

        let current = store.current_providers().await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].npi.as_deref(), Some("1245319599"));

        let key = RecordKey::new("cms", "1");
        let history = store.capture_history(EntityType::Provider, &key).await.unwrap();
        assert_eq!(history.len(), 3);

        let by_old_npi = store
            .keys_by_blocking_key(EntityType::Provider, &["npi:1234567893".to_string()])
            .await
            .unwrap();
        assert!(by_old_npi.is_empty());
        let by_new_npi = store
            .keys_by_blocking_key(EntityType::Provider, &["npi:1245319599".to_string()])
            .await
            .unwrap();
        assert!(by_new_npi.contains(&key));
    }

    #[tokio::test]
    async fn test_retraction_removes_current() {
        let store = MemoryStore::new();
        store.record_capture(&provider("1", "1234567893", 1)).await.unwrap();
        let retraction = Capture::Retraction {
            entity_type: EntityType::Provider,
            key: RecordKey::new("cms", "1"),
            captured_at: at(2),
        };
        assert!(store.record_capture(&retraction).await.unwrap());
        assert!(store.current_providers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_versions_only_on_change() {
        let store = MemoryStore::new();
        let first = ClusterCommit::new(golden("prov:npi:1", &["a"], "FM"), vec![], at(1));
        assert_eq!(store.commit_cluster(&first).await.unwrap(), CommitOutcome::Created(1));

        let same = ClusterCommit::new(golden("prov:npi:1", &["a"], "FM"), vec![], at(2));
        assert_eq!(store.commit_cluster(&same).await.unwrap(), CommitOutcome::Unchanged(1));

        let changed = ClusterCommit::new(golden("prov:npi:1", &["a", "b"], "IM"), vec![], at(3));
        assert_eq!(store.commit_cluster(&changed).await.unwrap(), CommitOutcome::Updated(2));

        let history = store.golden_history("prov:npi:1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|g| g.active).count(), 1);
        assert_eq!(history[0].superseded_at, Some(at(3)));
        assert_eq!(store.cluster_members("prov:npi:1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retire_cluster() {
        let store = MemoryStore::new();
        let commit = ClusterCommit::new(golden("prov:rec:cms:a", &["a"], "FM"), vec![], at(1));
        store.commit_cluster(&commit).await.unwrap();

        assert!(store.retire_cluster("prov:rec:cms:a", at(2)).await.unwrap());
        assert!(!store.retire_cluster("prov:rec:cms:a", at(3)).await.unwrap());
        assert!(store.active_golden("prov:rec:cms:a").await.unwrap().is_none());
        assert!(
            store
                .cluster_of(EntityType::Provider, &RecordKey::new("cms", "a"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_quality_metric_append_is_idempotent() {
        use crate::quality::{DimensionScores, Grade};
        let store = MemoryStore::new();
        let metric = QualityMetric {
            table_name: "providers".to_string(),
            measurement_date: at(1).date_naive(),
            batch_id: "b1".to_string(),
            record_count: 10,
            scores: DimensionScores::uniform(100.0),
            aggregate: 100.0,
            grade: Grade::A,
            threshold_violations: vec![],
            measured_at: at(1),
        };
        assert!(store.append_quality_metric(&metric).await.unwrap());
        assert!(!store.append_quality_metric(&metric).await.unwrap());
        assert_eq!(store.quality_history("providers").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_violation_status() {
        let store = MemoryStore::new();
        let violation = Violation {
            rule_name: "npi_format".to_string(),
            entity_type: EntityType::Provider,
            entity_id: "p1".to_string(),
            severity: Severity::High,
            description: "NPI has 5 digits".to_string(),
            detected_value: Some("12345".to_string()),
            expected_value: None,
            status: ViolationStatus::Open,
            first_detected_at: at(1),
            last_detected_at: at(1),
            resolved_at: None,
            resolution_note: None,
            reopen_count: 0,
        };
        store.upsert_violations(&[violation.clone()]).await.unwrap();

        let updated = store
            .set_violation_status(
                &violation.key(),
                ViolationStatus::FalsePositive,
                Some("legacy id".to_string()),
                at(2),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ViolationStatus::FalsePositive);
        assert_eq!(store.stats().await.unwrap().open_violations, 0);

        let reopened = store
            .set_violation_status(&violation.key(), ViolationStatus::Open, None, at(3))
            .await
            .unwrap();
        assert_eq!(reopened.status, ViolationStatus::Open);
    }

    #[tokio::test]
    async fn test_compare_and_set_violations_skips_changed_rows() {
        let store = MemoryStore::new();
        let mut stored = Violation {
            rule_name: "npi_format".to_string(),
            entity_type: EntityType::Provider,
            entity_id: "p1".to_string(),
            severity: Severity::High,
            description: "NPI has 5 digits".to_string(),
            detected_value: Some("12345".to_string()),
            expected_value: None,
            status: ViolationStatus::AcceptedRisk,
            first_detected_at: at(1),
            last_detected_at: at(1),
            resolved_at: Some(at(2)),
            resolution_note: Some("legacy id".to_string()),
            reopen_count: 0,
        };
        store.upsert_violations(&[stored.clone()]).await.unwrap();

        let mut fresh = stored.clone();
        fresh.entity_id = "p2".to_string();
        fresh.status = ViolationStatus::Open;
        stored.status = ViolationStatus::Open;
        let conflicts = store
            .compare_and_set_violations(&[
                ViolationWrite {
                    violation: stored.clone(),
                    expected: Some(ViolationStatus::Open),
                },
                ViolationWrite {
                    violation: fresh.clone(),
                    expected: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(conflicts, vec![stored.key()]);
        let violations = store.violations().await.unwrap();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].status, ViolationStatus::AcceptedRisk);
        assert_eq!(violations[1].entity_id, "p2");

        // a second insert of the same key is a conflict as well
        let conflicts = store
            .compare_and_set_violations(&[ViolationWrite {
                violation: fresh.clone(),
                expected: None,
            }])
            .await
            .unwrap();
        assert_eq!(conflicts, vec![fresh.key()]);
    }
}
