//! Retry with exponential backoff
//!
//! Used for operations whose effect depends on a slow external system,
//! such as writing settings to a remote object store.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_interval_ms: u64,
    /// Upper bound of the doubling delay, in milliseconds
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval_ms: 100,
            max_interval_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_interval_ms
            .saturating_mul(factor)
            .min(self.max_interval_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails definitively, or retries run out
///
/// A non-retryable error is returned as is. Running out of retries on a
/// retryable error yields [`Error::Timeout`].
pub async fn retry_until<T, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                tracing::error!("{} failed after {} retries: {}", what, attempt, e);
                return Err(Error::Timeout(format!("{}: {}", what, e)));
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!("{} failed ({}), retrying in {:?}", what, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
