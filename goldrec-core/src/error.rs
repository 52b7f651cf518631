//! Error taxonomy for the master-data core.
//!
//! Every failure is classified by the smallest unit it affects: a record, an
//! entity, a rule, or the environment. Only environment-level faults are
//! allowed to abort a whole batch; everything else is isolated and surfaced
//! through batch results and evaluation reports.

use thiserror::Error;

/// Main error type for goldrec operations.
#[derive(Debug, Error)]
pub enum GoldrecError {
    /// Record failed schema or format checks (quarantined, batch continues)
    #[error("Malformed record: {context}")]
    MalformedRecord { context: String },

    /// Matching produced conflicting cluster assignments for an entity
    #[error("Ambiguous match for cluster '{cluster_id}': {reason}")]
    AmbiguousMatch { cluster_id: String, reason: String },

    /// Synthesizer could not pick a winner for a field
    #[error("Unresolved conflict on field '{field}' in cluster '{cluster_id}'")]
    ConflictUnresolved { cluster_id: String, field: String },

    /// A rule predicate could not be evaluated for an entity
    #[error("Rule '{rule}' failed for entity '{entity_id}': {reason}")]
    RuleEvaluation {
        rule: String,
        entity_id: String,
        reason: String,
    },

    /// Storage write or read failed (retryable)
    #[error("Persistence failure: {context}")]
    Persistence {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Storage is unreachable; aborts the calling operation
    #[error("Entity store unavailable: {context}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A work unit exceeded its time budget
    #[error("Work unit '{unit}' timed out after {after_ms}ms")]
    Timeout { unit: String, after_ms: u64 },

    /// Processing was cancelled between work units
    #[error("Processing cancelled: {context}")]
    Cancelled { context: String },

    /// Violation status change not permitted by the lifecycle
    #[error("Invalid violation transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A guarded write kept losing to concurrent changes
    #[error("Concurrent modification: {context}")]
    ConcurrentModification { context: String },

    /// Configuration or validation error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// I/O operation failed
    #[error("I/O operation failed: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization or deserialization failed
    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results with GoldrecError
pub type Result<T> = std::result::Result<T, GoldrecError>;

impl GoldrecError {
    /// Creates a malformed record error
    pub fn malformed(context: impl Into<String>) -> Self {
        Self::MalformedRecord {
            context: context.into(),
        }
    }

    /// Creates a persistence error with context
    pub fn persistence<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates a store-unavailable error with context
    pub fn store_unavailable<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable {
            context: context.into(),
            source: Box::new(error),
        }
    }

    /// Creates a rule evaluation error
    pub fn rule_failed(
        rule: impl Into<String>,
        entity_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::RuleEvaluation {
            rule: rule.into(),
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a concurrent modification error
    pub fn concurrent_modification(context: impl Into<String>) -> Self {
        Self::ConcurrentModification {
            context: context.into(),
        }
    }

    /// Creates a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a serialization error with context
    pub fn serialization(context: impl Into<String>, error: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source: error,
        }
    }

    /// Creates an I/O error with context
    pub fn io(context: impl Into<String>, error: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: error,
        }
    }

    /// Whether the operation that produced this error may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }

    /// Whether this error is an environment-level fault that aborts a batch.
    pub fn is_environmental(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Short machine-readable classification used in dead letters and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRecord { .. } => "malformed_record",
            Self::AmbiguousMatch { .. } => "ambiguous_match",
            Self::ConflictUnresolved { .. } => "conflict_unresolved",
            Self::RuleEvaluation { .. } => "rule_evaluation_failure",
            Self::Persistence { .. } => "persistence_failure",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = GoldrecError::configuration("credibility weight out of range");
        assert!(error.to_string().contains("credibility weight out of range"));

        let error = GoldrecError::rule_failed("npi_format", "prov:npi:1234567890", "bad input");
        assert!(error.to_string().contains("npi_format"));
        assert!(error.to_string().contains("prov:npi:1234567890"));
    }

    #[test]
    fn test_retryable_classification() {
        let io = std::io::Error::other("disk full");
        assert!(GoldrecError::persistence("write golden", io).is_retryable());
        assert!(!GoldrecError::malformed("missing source").is_retryable());

        let io = std::io::Error::other("connection refused");
        let unavailable = GoldrecError::store_unavailable("health check", io);
        assert!(unavailable.is_environmental());
        assert!(!unavailable.is_retryable());
    }

    #[test]
    fn test_error_kind() {
        let timeout = GoldrecError::Timeout {
            unit: "partition-1".to_string(),
            after_ms: 500,
        };
        assert_eq!(timeout.kind(), "timeout");
        assert_eq!(GoldrecError::malformed("x").kind(), "malformed_record");
    }
}
