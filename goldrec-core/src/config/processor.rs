//! Incremental processor limits: worker pool size, unit timeouts and
//! persistence retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ConfigValidationError;

/// Exponential backoff policy for persistence retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Configuration for batch processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Maximum partitions processed concurrently.
    ///
    /// Default: 4
    pub max_concurrency: usize,
    /// Time budget per partition work unit
    pub unit_timeout_ms: u64,
    /// Retry policy for store writes
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            unit_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum concurrency for partition processing.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the per-partition timeout.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-partition timeout as a duration.
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_concurrency == 0 {
            return Err(ConfigValidationError::Inconsistent {
                message: "max_concurrency must be at least 1".to_string(),
            });
        }
        if self.unit_timeout_ms == 0 {
            return Err(ConfigValidationError::Inconsistent {
                message: "unit_timeout_ms must be positive".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigValidationError::Inconsistent {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigValidationError::OutOfRange {
                field: "retry.multiplier".to_string(),
                value: self.retry.multiplier,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_config_default() {
        let config = ProcessorConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.unit_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_min_concurrency() {
        let config = ProcessorConfig::new().with_max_concurrency(0);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(8), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validate_zero_attempts() {
        let config = ProcessorConfig::new().with_retry(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        assert!(config.validate().is_err());
    }
}
