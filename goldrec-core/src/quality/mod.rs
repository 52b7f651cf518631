//! Data quality scoring module.
//!
//! Scores a point-in-time table snapshot on six dimensions:
//! - **Completeness**: required fields carry a value
//! - **Consistency**: an entity's rows agree on canonical fields
//! - **Accuracy**: values pass format and range validators
//! - **Timeliness**: rows were verified recently
//! - **Uniqueness**: identity keys are not repeated
//! - **Validity**: entities carry no open CRITICAL/HIGH violations
//!
//! Scores are percentages in [0, 100]. The aggregate is a weighted average
//! graded against configured cutoffs; metrics hold counts and scores only,
//! never field values.
//!
//! # Example
//! ```rust,ignore
//! use goldrec_core::quality::{QualityAnalyzer, QualityConfig};
//!
//! let analyzer = QualityAnalyzer::new(QualityConfig::default());
//! let metric = analyzer.score(&snapshot, &violations)?;
//! println!("Quality score: {:.2} ({})", metric.aggregate, metric.grade);
//! ```

mod accuracy;
mod analyzer;
mod completeness;
mod config;
mod consistency;
mod models;
mod timeliness;
mod trend;
mod uniqueness;
mod validity;

// Re-export public API
pub use accuracy::analyze_accuracy;
pub use analyzer::QualityAnalyzer;
pub use completeness::analyze_completeness;
pub use config::{FieldValidator, GradeCutoffs, QualityConfig, TableProfile, TrendConfig};
pub use consistency::analyze_consistency;
pub use models::{
    DimensionMeasure, DimensionScores, Grade, QualityDimension, QualityMetric, SnapshotRow,
    TableSnapshot, ThresholdSeverity, ThresholdViolation,
};
pub use timeliness::analyze_timeliness;
pub use trend::{QualityTrend, TrendDirection, analyze_dimension_trend, analyze_trend};
pub use uniqueness::analyze_uniqueness;
pub use validity::analyze_validity;
