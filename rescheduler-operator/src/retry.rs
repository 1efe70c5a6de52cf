//! Optimistic-concurrency retry for read-modify-write cycles.
//!
//! The closure passed to [`retry_on_conflict`] should re-read the object on
//! every call. Only errors accepted by the retry predicate are retried; any
//! other error is returned immediately.

use std::future::Future;
use std::time::Duration;

use crate::error::{OperatorError, OperatorResult};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub steps: u32,
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Multiplier applied after each attempt.
    pub factor: u32,
    /// Upper bound for a single delay.
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 5,
            initial: Duration::from_millis(10),
            factor: 2,
            cap: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Slower schedule for waiting out a deleted object's termination before
    /// its replacement can be created. Roughly half a minute in total.
    pub fn recreate() -> Self {
        Self {
            steps: 10,
            initial: Duration::from_millis(200),
            factor: 2,
            cap: Duration::from_secs(5),
        }
    }

    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self.factor.saturating_pow(attempt - 2);
        self.initial.saturating_mul(exp).min(self.cap)
    }
}

/// Retry `op` while it fails with a version conflict.
pub async fn retry_on_conflict<T, F, Fut>(
    backoff: &Backoff,
    target: &str,
    op: F,
) -> OperatorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OperatorResult<T>>,
{
    retry_while(backoff, target, OperatorError::is_conflict, op).await
}

/// Retry `op` while it fails with an error `retryable` accepts.
pub async fn retry_while<T, F, Fut>(
    backoff: &Backoff,
    target: &str,
    retryable: fn(&OperatorError) -> bool,
    mut op: F,
) -> OperatorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OperatorResult<T>>,
{
    let steps = backoff.steps.max(1);
    for attempt in 1..=steps {
        tokio::time::sleep(backoff.delay(attempt)).await;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => {
                tracing::debug!(object = %target, attempt, error = %e, "Retrying after conflict");
            }
            Err(e) => return Err(e),
        }
    }
    Err(OperatorError::ConflictRetriesExhausted {
        target: target.to_string(),
        attempts: steps,
    })
}
