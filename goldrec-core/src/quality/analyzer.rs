//! Quality analyzer facade.
//!
//! This module provides the main `QualityAnalyzer` that runs every dimension
//! over a table snapshot and folds the results into one `QualityMetric`.

use chrono::{DateTime, Utc};

use crate::Result;
use crate::models::Violation;

use super::accuracy::analyze_accuracy;
use super::completeness::analyze_completeness;
use super::config::QualityConfig;
use super::consistency::analyze_consistency;
use super::models::{DimensionScores, QualityMetric, TableSnapshot, ThresholdViolation};
use super::timeliness::analyze_timeliness;
use super::uniqueness::analyze_uniqueness;
use super::validity::analyze_validity;

/// Quality analyzer for scoring table snapshots.
///
/// # Example
///
/// ```rust,ignore
/// use goldrec_core::quality::{QualityAnalyzer, QualityConfig};
///
/// let analyzer = QualityAnalyzer::new(QualityConfig::default());
/// let metric = analyzer.score(&snapshot, &violations)?;
/// println!("{} scored {:.1} ({})", metric.table_name, metric.aggregate, metric.grade);
/// ```
#[derive(Debug, Clone)]
pub struct QualityAnalyzer {
    config: QualityConfig,
}

impl QualityAnalyzer {
    /// Creates a new quality analyzer with the given configuration.
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Creates a new quality analyzer with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(QualityConfig::default())
    }

    /// Returns a reference to the analyzer configuration.
    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Scores a snapshot, stamping the metric with the current time.
    ///
    /// # Errors
    /// Returns a configuration error if an accuracy pattern does not compile.
    pub fn score(&self, snapshot: &TableSnapshot, violations: &[Violation]) -> Result<QualityMetric> {
        self.score_at(snapshot, violations, Utc::now())
    }

    /// Scores a snapshot with an explicit measurement timestamp.
    ///
    /// Scores depend only on the snapshot, the violations and the
    /// configuration; `measured_at` is recorded as-is.
    pub fn score_at(
        &self,
        snapshot: &TableSnapshot,
        violations: &[Violation],
        measured_at: DateTime<Utc>,
    ) -> Result<QualityMetric> {
        let scores = if self.config.enabled {
            let profile = self.config.profile(&snapshot.table_name);
            DimensionScores {
                completeness: analyze_completeness(snapshot, &profile.required_fields).score,
                consistency: analyze_consistency(snapshot, &profile.canonical_fields).score,
                accuracy: analyze_accuracy(snapshot, &profile.validators)?.score,
                timeliness: analyze_timeliness(snapshot, self.config.freshness_days).score,
                uniqueness: analyze_uniqueness(snapshot).score,
                validity: analyze_validity(snapshot, violations).score,
            }
        } else {
            DimensionScores::uniform(100.0)
        };

        let aggregate = self.aggregate(&scores);
        let threshold_violations: Vec<ThresholdViolation> = scores
            .iter()
            .filter(|(dimension, score)| *score < self.config.minimums.get(*dimension))
            .map(|(dimension, score)| {
                ThresholdViolation::new(
                    dimension.as_str(),
                    self.config.minimums.get(dimension),
                    score,
                )
            })
            .collect();

        for violation in &threshold_violations {
            tracing::warn!(
                table = %snapshot.table_name,
                batch = %snapshot.batch_id,
                "Quality threshold violated: {} scored {:.2} (minimum {:.2}, {:?})",
                violation.metric,
                violation.actual,
                violation.threshold,
                violation.severity
            );
        }

        Ok(QualityMetric {
            table_name: snapshot.table_name.clone(),
            measurement_date: snapshot.measurement_date,
            batch_id: snapshot.batch_id.clone(),
            record_count: snapshot.rows.len() as u64,
            scores,
            aggregate,
            grade: self.config.grades.grade(aggregate),
            threshold_violations,
            measured_at,
        })
    }

    /// Weighted average of the dimension scores.
    fn aggregate(&self, scores: &DimensionScores) -> f64 {
        let weights = &self.config.weights;
        let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
        if total_weight <= 0.0 {
            return 100.0;
        }
        let weighted: f64 = scores
            .iter()
            .map(|(dimension, score)| score * weights.get(dimension))
            .sum();
        (weighted / total_weight).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Severity, ViolationStatus};
    use crate::quality::config::{FieldValidator, TableProfile};
    use crate::quality::models::{Grade, SnapshotRow, ThresholdSeverity};
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;

    fn measurement_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn create_row(entity: &str, key: &str, values: serde_json::Value) -> SnapshotRow {
        SnapshotRow {
            entity_id: entity.to_string(),
            key: Some(key.to_string()),
            values: values.as_object().cloned().unwrap_or_default(),
            verified_at: Some(Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap()),
        }
    }

    fn create_snapshot(table_name: &str, rows: Vec<SnapshotRow>) -> TableSnapshot {
        TableSnapshot::new(table_name, "b1", measurement_date()).with_rows(rows)
    }

    fn clean_provider(i: usize) -> SnapshotRow {
        create_row(
            &format!("p{}", i),
            &format!("src|{:010}", i),
            json!({
                "npi": format!("{:010}", 1_000_000_000 + i),
                "first_name": "Ann",
                "last_name": "Lee",
                "specialty": "Cardiology",
            }),
        )
    }

    #[test]
    fn test_analyzer_creation() {
        let analyzer = QualityAnalyzer::new(QualityConfig::default().with_freshness_days(30));
        assert_eq!(analyzer.config().freshness_days, 30);
    }

    #[test]
    fn test_analyzer_with_defaults() {
        let analyzer = QualityAnalyzer::with_defaults();
        assert!(analyzer.config().enabled);
    }

    #[test]
    fn test_analyzer_empty_snapshot() {
        let analyzer = QualityAnalyzer::with_defaults();
        let metric = analyzer
            .score(&create_snapshot("providers", vec![]), &[])
            .unwrap();

        assert_eq!(metric.scores, DimensionScores::uniform(100.0));
        assert!((metric.aggregate - 100.0).abs() < 1e-9);
        assert_eq!(metric.grade, Grade::A);
        assert!(metric.threshold_violations.is_empty());
        assert_eq!(metric.record_count, 0);
    }

    #[test]
    fn test_analyzer_disabled() {
        let analyzer = QualityAnalyzer::new(QualityConfig::default().with_enabled(false));
        let snapshot = create_snapshot(
            "providers",
            vec![create_row("p1", "k", json!({"npi": "bad"}))],
        );

        let metric = analyzer.score(&snapshot, &[]).unwrap();
        assert!((metric.aggregate - 100.0).abs() < 1e-9);
        assert_eq!(metric.record_count, 1);
    }

    #[test]
    fn test_analyzer_clean_table() {
        let analyzer = QualityAnalyzer::with_defaults();
        let rows = (0..20).map(clean_provider).collect();

        let metric = analyzer
            .score(&create_snapshot("providers", rows), &[])
            .unwrap();

        assert!((metric.aggregate - 100.0).abs() < 1e-9);
        assert_eq!(metric.grade, Grade::A);
        assert!(!metric.has_critical_violation());
    }

    #[test]
    fn test_accuracy_scenario_thousand_records() {
        let analyzer = QualityAnalyzer::with_defaults();
        let rows = (0..1000)
            .map(|i| {
                let mut row = clean_provider(i);
                if i >= 950 {
                    row.values.insert("npi".to_string(), json!("12345"));
                }
                row
            })
            .collect();

        let metric = analyzer
            .score(&create_snapshot("providers", rows), &[])
            .unwrap();

        assert!((metric.scores.accuracy - 95.0).abs() < 1e-9);
        // every other dimension is perfect, so the aggregate is 99.0
        assert!((metric.aggregate - 99.0).abs() < 1e-9);
        assert_eq!(metric.grade, Grade::A);
        assert!(metric.threshold_violations.is_empty());
    }

    #[test]
    fn test_grade_follows_aggregate_not_single_dimension() {
        let config = QualityConfig::default().with_weights(DimensionScores {
            completeness: 0.0,
            consistency: 0.0,
            accuracy: 1.0,
            timeliness: 0.0,
            uniqueness: 0.0,
            validity: 0.0,
        });
        let analyzer = QualityAnalyzer::new(config);
        let rows = (0..100)
            .map(|i| {
                let mut row = clean_provider(i);
                if i >= 94 {
                    row.values.insert("npi".to_string(), json!("x"));
                }
                row
            })
            .collect();

        let metric = analyzer
            .score(&create_snapshot("providers", rows), &[])
            .unwrap();

        assert!((metric.aggregate - 94.0).abs() < 1e-9);
        assert_eq!(metric.grade, Grade::B);
    }

    #[test]
    fn test_analyzer_threshold_violations() {
        let analyzer = QualityAnalyzer::with_defaults();
        let rows = vec![
            clean_provider(1),
            create_row("p2", "src|0000000001", json!({"npi": null})),
        ];

        let metric = analyzer
            .score(&create_snapshot("providers", rows), &[])
            .unwrap();

        let completeness = metric
            .threshold_violations
            .iter()
            .find(|v| v.metric == "completeness")
            .unwrap();
        assert_eq!(completeness.actual, 50.0);
        assert_eq!(completeness.severity, ThresholdSeverity::Critical);
        assert!(metric.has_critical_violation());
    }

    #[test]
    fn test_validity_uses_open_violations() {
        let analyzer = QualityAnalyzer::with_defaults();
        let rows = (0..4).map(clean_provider).collect();
        let now = Utc::now();
        let violations = vec![Violation {
            rule_name: "npi_format".to_string(),
            entity_type: EntityType::Provider,
            entity_id: "p0".to_string(),
            severity: Severity::Critical,
            description: "missing NPI".to_string(),
            detected_value: None,
            expected_value: None,
            status: ViolationStatus::Open,
            first_detected_at: now,
            last_detected_at: now,
            resolved_at: None,
            resolution_note: None,
            reopen_count: 0,
        }];

        let metric = analyzer
            .score(&create_snapshot("providers", rows), &violations)
            .unwrap();
        assert_eq!(metric.scores.validity, 75.0);
    }

    #[test]
    fn test_unknown_table_scores_generic_dimensions() {
        let analyzer = QualityAnalyzer::with_defaults();
        let rows = vec![
            create_row("x1", "dup", json!({})),
            create_row("x2", "dup", json!({})),
        ];

        let metric = analyzer.score(&create_snapshot("other", rows), &[]).unwrap();
        assert_eq!(metric.scores.completeness, 100.0);
        assert_eq!(metric.scores.uniqueness, 50.0);
    }

    #[test]
    fn test_invalid_validator_pattern_errors() {
        let config = QualityConfig::default().with_profile(
            "providers",
            TableProfile {
                validators: vec![FieldValidator::Pattern {
                    field: "email".to_string(),
                    pattern: "[".to_string(),
                }],
                ..TableProfile::default()
            },
        );
        let analyzer = QualityAnalyzer::new(config);
        assert!(
            analyzer
                .score(&create_snapshot("providers", vec![clean_provider(1)]), &[])
                .is_err()
        );
    }

    #[test]
    fn test_score_at_is_deterministic() {
        let analyzer = QualityAnalyzer::with_defaults();
        let snapshot = create_snapshot("providers", (0..5).map(clean_provider).collect());
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();

        let first = analyzer.score_at(&snapshot, &[], at).unwrap();
        let second = analyzer.score_at(&snapshot, &[], at).unwrap();
        assert_eq!(first, second);
    }
}
