//! Retry engine: exponential backoff with jitter.
//!
//! Deliberately a primitive. It does not classify errors into transient and
//! permanent; the caller picks the policy. The loader accepts this because
//! duplicate inserts are absorbed by the replacing engine on CDC tables, and
//! initial-load duplicates surface as errors a human must investigate.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Error;

/// Backoff policy for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up (first try included)
    pub max_attempts: u32,
    /// Base delay, doubled on every failed attempt
    pub base_delay: Duration,
    /// Ceiling for the exponential term
    pub max_delay: Duration,
    /// Add a uniform random delay in `[0, backoff/2)` on top
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy used by the loader for destination inserts.
    pub const fn insert_defaults() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }

    /// Sleep duration before retry number `attempt` (1-based):
    /// `min(base * 2^attempt, max)` plus jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        // Cap the shift so the multiplier cannot overflow.
        let exp = 2u32.saturating_pow(attempt.min(20));
        let mut backoff = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter {
            let half_ms = (backoff.as_millis() as u64) / 2;
            if half_ms > 0 {
                backoff += Duration::from_millis(rand::thread_rng().gen_range(0..half_ms));
            }
        }
        backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::insert_defaults()
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// The backoff sleep is cancellation-aware: if `cancel` fires while
/// sleeping, the function returns `Cancelled` promptly instead of finishing
/// the sleep. On exhaustion the last error is wrapped as `RetryExhausted`
/// ("max retry attempts reached").
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if attempt >= policy.max_attempts {
            return Err(Error::RetryExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let backoff = policy.backoff(attempt);
        warn!(
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
