//! Data quality metrics models.
//!
//! Scores are percentages in [0, 100]. Metrics carry counts and scores
//! only, never the underlying field values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Quality dimensions scored for every table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityDimension {
    Completeness,
    Consistency,
    Accuracy,
    Timeliness,
    Uniqueness,
    Validity,
}

impl QualityDimension {
    /// All dimensions in reporting order.
    pub const ALL: [QualityDimension; 6] = [
        QualityDimension::Completeness,
        QualityDimension::Consistency,
        QualityDimension::Accuracy,
        QualityDimension::Timeliness,
        QualityDimension::Uniqueness,
        QualityDimension::Validity,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityDimension::Completeness => "completeness",
            QualityDimension::Consistency => "consistency",
            QualityDimension::Accuracy => "accuracy",
            QualityDimension::Timeliness => "timeliness",
            QualityDimension::Uniqueness => "uniqueness",
            QualityDimension::Validity => "validity",
        }
    }
}

impl std::fmt::Display for QualityDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per dimension.
///
/// Used for scores, weights and minimum thresholds alike.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub completeness: f64,
    pub consistency: f64,
    pub accuracy: f64,
    pub timeliness: f64,
    pub uniqueness: f64,
    pub validity: f64,
}

impl DimensionScores {
    /// Same value for every dimension.
    pub fn uniform(value: f64) -> Self {
        Self {
            completeness: value,
            consistency: value,
            accuracy: value,
            timeliness: value,
            uniqueness: value,
            validity: value,
        }
    }

    /// Value of one dimension.
    pub fn get(&self, dimension: QualityDimension) -> f64 {
        match dimension {
            QualityDimension::Completeness => self.completeness,
            QualityDimension::Consistency => self.consistency,
            QualityDimension::Accuracy => self.accuracy,
            QualityDimension::Timeliness => self.timeliness,
            QualityDimension::Uniqueness => self.uniqueness,
            QualityDimension::Validity => self.validity,
        }
    }

    /// Dimension and value pairs in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (QualityDimension, f64)> + '_ {
        QualityDimension::ALL.into_iter().map(|d| (d, self.get(d)))
    }
}

/// Score of one dimension with the counts behind it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionMeasure {
    pub dimension: QualityDimension,
    /// Score in [0, 100]
    pub score: f64,
    /// Units that failed the dimension's check
    pub failing: u64,
    /// Units checked
    pub total: u64,
}

impl DimensionMeasure {
    /// Score from failing and total counts; an empty table scores 100.
    pub fn from_failures(dimension: QualityDimension, failing: u64, total: u64) -> Self {
        if failing > total {
            tracing::warn!(
                "Quality metrics anomaly: {} failing units exceed total ({}) for {}",
                failing,
                total,
                dimension
            );
        }
        let score = if total == 0 {
            100.0
        } else {
            100.0 * total.saturating_sub(failing) as f64 / total as f64
        };
        Self {
            dimension,
            score: score.clamp(0.0, 100.0),
            failing,
            total,
        }
    }
}

/// Letter grade for an aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            "C" => Some(Grade::C),
            "D" => Some(Grade::D),
            "F" => Some(Grade::F),
            _ => None,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity level for threshold violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdSeverity {
    /// Metric is below threshold but not critical
    Warning,
    /// Metric is significantly below threshold
    Critical,
}

/// A dimension that scored below its configured minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdViolation {
    /// Name of the dimension that violated its threshold
    pub metric: String,
    /// The configured threshold value
    pub threshold: f64,
    /// The actual measured value
    pub actual: f64,
    pub severity: ThresholdSeverity,
}

/// Values below this fraction of the threshold are classified as critical.
const CRITICAL_SEVERITY_RATIO: f64 = 0.8;

impl ThresholdViolation {
    /// Creates a new threshold violation.
    ///
    /// # Severity Classification
    /// - Critical: actual value is below 80% of threshold
    /// - Warning: actual value is between 80% and 100% of threshold
    pub fn new(metric: impl Into<String>, threshold: f64, actual: f64) -> Self {
        let severity = if actual < threshold * CRITICAL_SEVERITY_RATIO {
            ThresholdSeverity::Critical
        } else {
            ThresholdSeverity::Warning
        };

        Self {
            metric: metric.into(),
            threshold,
            actual,
            severity,
        }
    }
}

/// One row of a table snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Entity the row describes (golden cluster id)
    pub entity_id: String,
    /// Identity key used for duplicate detection, if the row has one
    pub key: Option<String>,
    /// Field values; missing and null are treated alike
    pub values: serde_json::Map<String, serde_json::Value>,
    /// When the row was last verified by its source
    pub verified_at: Option<DateTime<Utc>>,
}

/// Point-in-time rows of one table, scored as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table_name: String,
    pub batch_id: String,
    pub measurement_date: NaiveDate,
    pub rows: Vec<SnapshotRow>,
}

impl TableSnapshot {
    /// Creates an empty snapshot.
    pub fn new(
        table_name: impl Into<String>,
        batch_id: impl Into<String>,
        measurement_date: NaiveDate,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            batch_id: batch_id.into(),
            measurement_date,
            rows: Vec::new(),
        }
    }

    /// Adds rows.
    pub fn with_rows(mut self, rows: Vec<SnapshotRow>) -> Self {
        self.rows = rows;
        self
    }
}

/// Quality scores of one table for one batch.
///
/// Identity is `(table_name, measurement_date, batch_id)`; the stored series
/// is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub table_name: String,
    pub measurement_date: NaiveDate,
    pub batch_id: String,
    pub record_count: u64,
    pub scores: DimensionScores,
    /// Weighted average of the dimension scores
    pub aggregate: f64,
    pub grade: Grade,
    pub threshold_violations: Vec<ThresholdViolation>,
    pub measured_at: DateTime<Utc>,
}

impl QualityMetric {
    /// Whether any dimension fell below its critical level.
    pub fn has_critical_violation(&self) -> bool {
        self.threshold_violations
            .iter()
            .any(|v| v.severity == ThresholdSeverity::Critical)
    }
}
