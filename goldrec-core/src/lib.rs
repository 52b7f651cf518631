//! Core library for goldrec, a provider master-data engine.
//!
//! Raw provider and facility captures from several source systems are
//! resolved into clusters, synthesized into versioned golden records, checked
//! against data-quality rules and scored per table.
//!
//! # Processing model
//! - Change events arrive in batches and are applied exactly once per batch
//! - Work is partitioned by blocking-key neighborhood and run concurrently
//! - Failures are isolated to the smallest unit they affect; only an
//!   unreachable store aborts a batch
//!
//! # Architecture
//! - [`store::EntityStore`] abstracts persistence (in-memory and SQLite)
//! - [`pipeline::Pipeline`] is the trigger surface for process, evaluate and
//!   score
//! - Matching, synthesis, rules and quality scoring are pure over their inputs

pub mod affiliations;
pub mod cdc;
pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod matching;
pub mod models;
pub mod pipeline;
pub mod quality;
pub mod retry;
pub mod rules;
pub mod store;
pub mod synthesis;

// Re-export commonly used types
pub use cdc::{BatchResult, CdcProcessor};
pub use config::{GoldrecConfig, ProcessorConfig, RetryPolicy};
pub use error::{GoldrecError, Result};
pub use logging::{LogFormat, init_logging};
pub use models::{
    Affiliation, ChangeEvent, ChangeOperation, EntityGraph, EntityType, FacilityRecord,
    GoldenRecord, RawProviderRecord, RecordKey, Severity, Violation, ViolationStatus,
};
pub use pipeline::{ActivityReport, EvaluationReport, Pipeline, TableScore};
pub use quality::{QualityAnalyzer, QualityMetric};
pub use rules::{RuleEngine, RuleSetConfig};
pub use store::{EntityStore, MemoryStore};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
