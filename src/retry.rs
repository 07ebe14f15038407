//! Bounded retry with exponential backoff around single network calls.
//!
//! Multi-call operations such as subtree rename walks retry each network
//! call independently, never the walk as a whole; a walk that fails
//! partway is not replayed or rolled back.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::error::Result;

/// Retry tuning applied to every network call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub backoff: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Overall budget for one call including all retries.
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            max_timeout: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = (attempt - 1).min(31);
        self.backoff.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}

/// Run one network call with up to `policy.max_retries` retries.
///
/// Only errors classified transient by [`crate::CloudFsError::is_transient`]
/// are retried; not-found, conflicts, bad ranges, and auth failures return
/// to the caller immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if attempt > policy.max_retries {
                    warn!(op, attempts = attempt, "retries exhausted: {err}");
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                if started.elapsed() + delay >= policy.max_timeout {
                    warn!(op, "retry budget exhausted: {err}");
                    return Err(err);
                }
                warn!(
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, retrying: {err}"
                );
                sleep(delay).await;
            }
        }
    }
}
