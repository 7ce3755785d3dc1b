//! Capped exponential backoff for the signaling RPC paths

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Backoff schedule for one retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied to the exponential schedule.
    pub max_delay: Duration,
    /// Retry budget; `None` retries until cancelled or fatal.
    pub max_retries: Option<u32>,
}

impl RetryPolicy {
    /// Unbounded schedule, used by the receive loop and outbound sends.
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries: None,
        }
    }

    /// Delay before the retry following `attempt` failures, jitter-free:
    /// `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether another retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }
}

/// Run `op` under `policy` until it succeeds, fails fatally, exhausts its
/// retry budget, or `cancel` fires.
///
/// `is_recoverable` classifies errors; a non-recoverable error is returned
/// immediately. Cancellation surfaces as [`Error::Cancelled`], which is
/// never retried regardless of the predicate.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_recoverable: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("operation aborted".to_string()));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ Error::Cancelled(_)) => return Err(err),
            Err(err) if is_recoverable(&err) && policy.should_retry(attempt) => {
                let delay = policy.backoff_delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled("operation aborted".to_string()))
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
