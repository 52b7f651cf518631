//! Library-level trigger surface: process a batch, evaluate rules, score
//! quality.
//!
//! An external scheduler calls these in order after each ingestion. Each call
//! works on the store alone, so the three can also run independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cdc::{BatchResult, CdcProcessor};
use crate::config::GoldrecConfig;
use crate::ingest::ActivityRow;
use crate::matching::normalize::{normalize_code, normalize_npi};
use crate::models::{
    ActivityCount, ChangeEvent, EntityGraph, EntityType, FacilityRecord, RawProviderRecord, RecordKey, Severity,
    SourceRecord, ViolationKey, ViolationWrite,
};
use crate::quality::{
    QualityAnalyzer, QualityMetric, QualityTrend, SnapshotRow, TableSnapshot, analyze_trend,
};
use crate::retry::with_retry;
use crate::rules::{ReconcileSummary, RuleEngine, RuleFailure, ViolationLedger};
use crate::store::EntityStore;
use crate::{GoldrecError, Result};

/// Table name of the provider quality series.
pub const PROVIDERS_TABLE: &str = "providers";
/// Table name of the facility quality series.
pub const FACILITIES_TABLE: &str = "facilities";

/// Guarded write rounds before evaluation gives up on contended violations.
const MAX_RECONCILE_ROUNDS: usize = 5;

/// Outcome of one rule evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub findings: usize,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub rule_failures: Vec<RuleFailure>,
    pub reconciled: ReconcileSummary,
    /// OPEN and IN_PROGRESS violations after reconciliation
    pub open_violations: usize,
    pub evaluated_at: DateTime<Utc>,
}

/// Outcome of recording activity rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityReport {
    /// Distinct `(cluster, period)` counts written
    pub recorded: usize,
    /// Rows whose record belongs to no provider cluster
    pub unresolved: Vec<RecordKey>,
}

/// Quality score of one table with its trend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableScore {
    pub metric: QualityMetric,
    /// False when a metric for the same table, date and batch already existed
    pub stored: bool,
    pub trend: Option<QualityTrend>,
}

/// Runs the master-data pipeline against one entity store.
pub struct Pipeline {
    store: Arc<dyn EntityStore>,
    config: GoldrecConfig,
    processor: CdcProcessor,
    rules: RuleEngine,
    quality: QualityAnalyzer,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store.backend())
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Builds a pipeline from a validated configuration.
    ///
    /// # Errors
    /// Returns a configuration error if any section is invalid.
    pub fn new(store: Arc<dyn EntityStore>, config: GoldrecConfig) -> Result<Self> {
        config.validate()?;
        let rules = RuleEngine::new(&config.rules)?;
        Ok(Self {
            processor: CdcProcessor::new(Arc::clone(&store), &config),
            quality: QualityAnalyzer::new(config.quality.clone()),
            rules,
            store,
            config,
        })
    }

    /// Pins the reference date of time-relative rules.
    pub fn with_as_of(mut self, as_of: chrono::NaiveDate) -> Self {
        self.rules = self.rules.with_as_of(as_of);
        self
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn config(&self) -> &GoldrecConfig {
        &self.config
    }

    /// Applies a change batch; see [`CdcProcessor::process_batch`].
    pub async fn process_batch(&self, batch_id: &str, events: &[ChangeEvent]) -> Result<BatchResult> {
        self.processor.process_batch(batch_id, events).await
    }

    /// Applies a change batch that can be cancelled between partitions.
    pub async fn process_batch_with_cancel(
        &self,
        batch_id: &str,
        events: &[ChangeEvent],
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        self.processor
            .process_batch_with_cancel(batch_id, events, cancel)
            .await
    }

    /// Resolves activity rows to their provider clusters and stores the
    /// counts.
    ///
    /// Rows of one cluster and period are summed across its member records,
    /// and the sum replaces any stored count for that period. Call after the
    /// batch that introduced the records has been applied.
    ///
    /// # Errors
    /// Returns store errors that persist after retries.
    pub async fn record_activity(&self, rows: &[ActivityRow]) -> Result<ActivityReport> {
        let mut report = ActivityReport::default();
        let mut totals: BTreeMap<(String, chrono::NaiveDate), u64> = BTreeMap::new();
        for row in rows {
            match self.store.cluster_of(EntityType::Provider, &row.key).await? {
                Some(cluster_id) => {
                    let total = totals.entry((cluster_id, row.period)).or_default();
                    *total = total.saturating_add(row.count);
                }
                None => {
                    if !report.unresolved.contains(&row.key) {
                        report.unresolved.push(row.key.clone());
                    }
                }
            }
        }

        let counts: Vec<ActivityCount> = totals
            .into_iter()
            .map(|((entity_id, period), count)| ActivityCount {
                entity_id,
                period,
                count,
            })
            .collect();
        if !counts.is_empty() {
            with_retry(&self.config.processor.retry, "record activity", || {
                self.store.record_activity(&counts)
            })
            .await?;
        }
        report.recorded = counts.len();

        if report.unresolved.is_empty() {
            tracing::info!(recorded = report.recorded, "Recorded activity");
        } else {
            tracing::warn!(
                recorded = report.recorded,
                unresolved = report.unresolved.len(),
                first_unresolved = %report.unresolved[0],
                "Recorded activity with unresolved rows"
            );
        }
        Ok(report)
    }

    /// Evaluates every enabled rule and reconciles the stored violations.
    ///
    /// Violation writes are guarded on the status read in the snapshot. A
    /// violation changed in the meantime (e.g. by a steward) is reconciled
    /// again against its fresh state instead of being overwritten.
    ///
    /// # Errors
    /// Fails only on store errors or when violations keep changing under
    /// every write round; rules that cannot be evaluated for an entity are
    /// reported in [`EvaluationReport::rule_failures`].
    pub async fn evaluate(&self) -> Result<EvaluationReport> {
        let graph = self.store.snapshot().await?;
        let evaluation = self.rules.evaluate_graph(&graph);
        let now = evaluation.evaluated_at;
        let (mut changes, first) = ViolationLedger::reconcile(&graph.violations, &evaluation, now);
        let mut reconciled = ReconcileSummary {
            untouched: first.untouched,
            ..ReconcileSummary::default()
        };

        let mut round = 0;
        while !changes.is_empty() {
            round += 1;
            let writes: Vec<ViolationWrite> = changes.iter().map(|c| c.write.clone()).collect();
            let conflicts: BTreeSet<ViolationKey> =
                with_retry(&self.config.processor.retry, "write violations", || {
                    self.store.compare_and_set_violations(&writes)
                })
                .await?
                .into_iter()
                .collect();
            for change in &changes {
                if !conflicts.contains(&change.violation().key()) {
                    reconciled.record(change.action);
                }
            }
            if conflicts.is_empty() {
                break;
            }
            if round == MAX_RECONCILE_ROUNDS {
                return Err(GoldrecError::concurrent_modification(format!(
                    "{} violations kept changing during evaluation",
                    conflicts.len()
                )));
            }
            tracing::warn!(
                conflicts = conflicts.len(),
                "Violations changed during evaluation, reconciling them again"
            );

            let fresh = self.store.violations().await?;
            let (again, _) = ViolationLedger::reconcile(&fresh, &evaluation, now);
            changes = again
                .into_iter()
                .filter(|c| conflicts.contains(&c.violation().key()))
                .collect();
            reconciled.untouched += conflicts.len() - changes.len();
        }
        tracing::info!(
            opened = reconciled.opened,
            updated = reconciled.updated,
            reopened = reconciled.reopened,
            resolved = reconciled.resolved,
            untouched = reconciled.untouched,
            "Violations reconciled"
        );

        let open_violations = self
            .store
            .violations()
            .await?
            .iter()
            .filter(|v| v.status.is_active())
            .count();

        Ok(EvaluationReport {
            findings: evaluation.findings.len(),
            severity_counts: evaluation.severity_counts(),
            rule_failures: evaluation.failures,
            reconciled,
            open_violations,
            evaluated_at: evaluation.evaluated_at,
        })
    }

    /// Scores the provider and facility tables for a batch and appends the
    /// metrics to the quality series.
    pub async fn score(&self, batch_id: &str) -> Result<Vec<TableScore>> {
        let graph = self.store.snapshot().await?;
        let measured_at = Utc::now();
        let date = measured_at.date_naive();

        let memberships = cluster_index(&graph);

        let snapshots = [
            TableSnapshot::new(PROVIDERS_TABLE, batch_id, date).with_rows(
                graph
                    .current_providers
                    .iter()
                    .map(|r| snapshot_row(r, &memberships, provider_identity(r)))
                    .collect(),
            ),
            TableSnapshot::new(FACILITIES_TABLE, batch_id, date).with_rows(
                graph
                    .current_facilities
                    .iter()
                    .map(|r| snapshot_row(r, &memberships, facility_identity(r)))
                    .collect(),
            ),
        ];

        let mut scores = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let metric = self
                .quality
                .score_at(snapshot, &graph.violations, measured_at)?;
            let stored = with_retry(&self.config.processor.retry, "append quality metric", || {
                self.store.append_quality_metric(&metric)
            })
            .await?;
            if !stored {
                tracing::info!(
                    table = %metric.table_name,
                    batch_id,
                    "Quality metric already recorded for this batch, keeping the first"
                );
            }
            let history = self.store.quality_history(&snapshot.table_name).await?;
            let trend = analyze_trend(&history, &self.config.quality.trend);
            tracing::info!(
                table = %metric.table_name,
                records = metric.record_count,
                aggregate = metric.aggregate,
                grade = %metric.grade,
                "Scored table"
            );
            scores.push(TableScore {
                metric,
                stored,
                trend,
            });
        }
        Ok(scores)
    }
}

/// Cluster id of every record that contributes to an active golden record.
fn cluster_index(graph: &EntityGraph) -> BTreeMap<(EntityType, RecordKey), String> {
    graph
        .providers
        .iter()
        .chain(graph.facilities.iter())
        .flat_map(|golden| {
            golden
                .source_records
                .iter()
                .map(move |key| ((golden.entity_type, key.clone()), golden.cluster_id.clone()))
        })
        .collect()
}

fn provider_identity(record: &RawProviderRecord) -> Option<String> {
    let npi = record.npi.as_deref().and_then(normalize_npi)?;
    Some(format!("{}|{}", record.source, npi))
}

fn facility_identity(record: &FacilityRecord) -> Option<String> {
    let identifier = record.identifier.as_deref().and_then(normalize_code)?;
    Some(format!("{}|{}", record.source, identifier))
}

fn snapshot_row<R: SourceRecord>(
    record: &R,
    memberships: &BTreeMap<(EntityType, RecordKey), String>,
    key: Option<String>,
) -> SnapshotRow {
    let record_key = record.record_key();
    // records held for review have no cluster yet
    let entity_id = memberships
        .get(&(R::ENTITY_TYPE, record_key.clone()))
        .cloned()
        .unwrap_or_else(|| record_key.to_string());
    let values = R::field_names()
        .iter()
        .map(|field| {
            let value = record
                .field_value(field)
                .map_or(serde_json::Value::Null, |v| v.to_json());
            ((*field).to_string(), value)
        })
        .collect();
    SnapshotRow {
        entity_id,
        key,
        values,
        verified_at: Some(record.captured_at()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeOperation, ViolationStatus};
    use crate::store::MemoryStore;
    use crate::store::test_support::FaultyStore;
    use chrono::TimeZone;
    use serde_json::{Value, json};

    fn event(sequence: u64, source: &str, key: &str, after: Value) -> ChangeEvent {
        ChangeEvent {
            batch_id: "b1".to_string(),
            sequence,
            source: source.to_string(),
            entity_type: EntityType::Provider,
            entity_key: key.to_string(),
            operation: ChangeOperation::Insert,
            before: None,
            after: Some(after),
            captured_at: Utc::now(),
        }
    }

    fn pipeline(store: Arc<MemoryStore>) -> Pipeline {
        Pipeline::new(store, GoldrecConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = GoldrecConfig::default();
        config.processor.max_concurrency = 0;
        assert!(Pipeline::new(Arc::new(MemoryStore::new()), config).is_err());
    }

    #[tokio::test]
    async fn test_evaluate_opens_and_resolves_violations() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        pipeline
            .process_batch(
                "b1",
                &[event(
                    1,
                    "state_board",
                    "SB-1",
                    json!({"npi": "12345", "first_name": "John", "last_name": "Smith"}),
                )],
            )
            .await
            .unwrap();

        let report = pipeline.evaluate().await.unwrap();
        assert!(report.reconciled.opened >= 1);
        let npi = store
            .violations()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.rule_name == "npi_format")
            .unwrap();
        assert_eq!(npi.status, ViolationStatus::Open);
        assert_eq!(npi.severity, Severity::High);

        let mut fixed = event(
            1,
            "state_board",
            "SB-1",
            json!({"npi": "1234567893", "first_name": "John", "last_name": "Smith"}),
        );
        fixed.batch_id = "b2".to_string();
        fixed.operation = ChangeOperation::Update;
        pipeline.process_batch("b2", &[fixed]).await.unwrap();

        let second = pipeline.evaluate().await.unwrap();
        assert!(second.reconciled.resolved >= 1);
        let resolved = store
            .violations()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.rule_name == "npi_format")
            .unwrap();
        assert_eq!(resolved.status, ViolationStatus::Resolved);
    }

    #[tokio::test]
    async fn test_steward_decision_during_evaluate_is_kept() {
        let store = Arc::new(FaultyStore::failing(0));
        let pipeline = Pipeline::new(store.clone(), GoldrecConfig::default()).unwrap();
        pipeline
            .process_batch(
                "b1",
                &[event(
                    1,
                    "state_board",
                    "SB-1",
                    json!({"npi": "12345", "first_name": "John", "last_name": "Smith"}),
                )],
            )
            .await
            .unwrap();
        pipeline.evaluate().await.unwrap();
        let npi = store
            .violations()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.rule_name == "npi_format")
            .unwrap();
        assert_eq!(npi.status, ViolationStatus::Open);

        // evaluation reads the violation as OPEN, the steward accepts the
        // risk before the write lands
        store.steward_before_next_write(npi.key(), ViolationStatus::AcceptedRisk);
        let report = pipeline.evaluate().await.unwrap();

        let stored = store
            .violations()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.key() == npi.key())
            .unwrap();
        assert_eq!(stored.status, ViolationStatus::AcceptedRisk);
        assert_eq!(stored.resolution_note.as_deref(), Some("steward decision"));
        assert!(report.reconciled.untouched >= 1);
    }

    #[tokio::test]
    async fn test_recorded_activity_spike_is_flagged() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        pipeline
            .process_batch(
                "b1",
                &[
                    event(
                        1,
                        "state_board",
                        "SB-1",
                        json!({"npi": "1234567893", "first_name": "John", "last_name": "Smith"}),
                    ),
                    event(
                        2,
                        "claims",
                        "C-1",
                        json!({"npi": "1234567893", "first_name": "John", "last_name": "Smith"}),
                    ),
                ],
            )
            .await
            .unwrap();

        let period = |month| chrono::NaiveDate::from_ymd_opt(2024, month, 1).unwrap();
        let mut rows: Vec<ActivityRow> = (1..=4)
            .map(|month| ActivityRow {
                key: RecordKey::new("state_board", "SB-1"),
                period: period(month),
                count: 5,
            })
            .collect();
        rows.push(ActivityRow {
            key: RecordKey::new("state_board", "SB-1"),
            period: period(5),
            count: 300,
        });
        rows.push(ActivityRow {
            key: RecordKey::new("claims", "C-1"),
            period: period(5),
            count: 200,
        });
        rows.push(ActivityRow {
            key: RecordKey::new("claims", "C-404"),
            period: period(5),
            count: 1,
        });

        let report = pipeline.record_activity(&rows).await.unwrap();
        assert_eq!(report.recorded, 5);
        assert_eq!(report.unresolved, vec![RecordKey::new("claims", "C-404")]);

        let cluster_id = store
            .cluster_of(EntityType::Provider, &RecordKey::new("claims", "C-1"))
            .await
            .unwrap()
            .unwrap();
        let stored = store.activity().await.unwrap();
        let spike = stored.iter().find(|c| c.period == period(5)).unwrap();
        assert_eq!(spike.entity_id, cluster_id);
        assert_eq!(spike.count, 500);

        pipeline.evaluate().await.unwrap();
        let anomaly = store
            .violations()
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.rule_name == "activity_anomaly")
            .unwrap();
        assert_eq!(anomaly.entity_id, cluster_id);
        assert_eq!(anomaly.status, ViolationStatus::Open);
    }

    #[tokio::test]
    async fn test_evaluate_twice_is_stable() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        pipeline
            .process_batch(
                "b1",
                &[event(1, "state_board", "SB-1", json!({"npi": "12345", "last_name": "Smith"}))],
            )
            .await
            .unwrap();

        let first = pipeline.evaluate().await.unwrap();
        let second = pipeline.evaluate().await.unwrap();
        assert_eq!(second.reconciled.opened, 0);
        assert_eq!(second.open_violations, first.open_violations);
    }

    #[tokio::test]
    async fn test_score_appends_once_per_batch() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        pipeline
            .process_batch(
                "b1",
                &[
                    event(1, "state_board", "SB-1", json!({"npi": "1234567893", "first_name": "John", "last_name": "Smith", "specialty": "Family Medicine"})),
                    event(2, "claims", "C-1", json!({"npi": "1234567893", "first_name": "John", "last_name": "Smith", "specialty": "Family Medicine"})),
                ],
            )
            .await
            .unwrap();

        let scores = pipeline.score("b1").await.unwrap();
        assert_eq!(scores.len(), 2);
        let providers = &scores[0];
        assert_eq!(providers.metric.table_name, PROVIDERS_TABLE);
        assert_eq!(providers.metric.record_count, 2);
        assert!(providers.stored);
        assert!(providers.trend.is_some());

        let facilities = &scores[1];
        assert_eq!(facilities.metric.record_count, 0);
        assert!((facilities.metric.aggregate - 100.0).abs() < 1e-9);

        let again = pipeline.score("b1").await.unwrap();
        assert!(!again[0].stored);
        assert_eq!(store.quality_history(PROVIDERS_TABLE).await.unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_row_falls_back_to_record_key() {
        let mut record = RawProviderRecord::new(
            "claims",
            "C-1",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        record.npi = Some("1234-567-893".to_string());
        let key = provider_identity(&record);
        let row = snapshot_row(&record, &BTreeMap::new(), key);
        assert_eq!(row.entity_id, "claims:C-1");
        assert_eq!(row.key.as_deref(), Some("claims|1234567893"));
        assert_eq!(row.values["npi"], json!("1234-567-893"));
        assert_eq!(row.values["first_name"], Value::Null);
    }
}
