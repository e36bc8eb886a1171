//! Bounded retry with a fixed interval
//!
//! Every wait in the bootstrapper goes through here, so an exhausted budget
//! always surfaces as `RecoverableTimeout` rather than hanging.

use hive_common::error::{HiveError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

/// Conditions worth another attempt. A missing handoff file is expected
/// while the primary is still initialising.
fn should_retry(err: &HiveError) -> bool {
    err.is_retryable() || matches!(err, HiveError::ConfigurationMissing(_))
}

/// Run `op` until it succeeds, a non-retryable error occurs or the budget runs out
pub async fn retry<T, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=policy.attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) => {
                debug!(what, attempt, error = %e, "attempt failed");
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(HiveError::RecoverableTimeout {
        what: what.to_string(),
        attempts: policy.attempts,
    })
}

/// Poll until `op` yields `Some`
pub async fn poll<T, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    retry(what, policy, |_| {
        let fut = op();
        async move {
            fut.await?
                .ok_or_else(|| HiveError::ConfigurationMissing(what.to_string()))
        }
    })
    .await
}
