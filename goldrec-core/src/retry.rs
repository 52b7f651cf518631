//! Retry with exponential backoff for retryable store operations.

use std::future::Future;

use crate::Result;
use crate::config::RetryPolicy;

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let wait = policy.backoff_for(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after retryable failure"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
