//! Bounded retry with exponential backoff
//!
//! A `RetryPolicy` value is passed to call sites and applied by
//! [`retry_with_policy`], so retry behavior stays inspectable and testable.
//! Only errors that are retryable on the same provider are retried; anything
//! else is returned immediately for the failover walk to handle.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::failover as failover_constants;
use crate::types::Result;

/// Retry budget for one provider call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: failover_constants::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: failover_constants::BASE_DELAY_MS,
            max_delay_ms: failover_constants::MAX_DELAY_MS,
            factor: failover_constants::BACKOFF_FACTOR,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff schedule for the retries after the first attempt
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(self.max_delay())
            .with_factor(self.factor)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Run `op` under `policy`. The closure receives the 1-based attempt number.
///
/// A provider `retry_after` hint stretches the next delay, bounded by the
/// policy's `max_delay`.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = policy.backoff().build();
    let mut attempt = 1u32;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                let Some(delay) = delays.next() else {
                    debug!(operation, attempt, "Retry budget exhausted");
                    return Err(err);
                };
                let delay = err
                    .retry_after()
                    .map_or(delay, |hint| hint.min(policy.max_delay()).max(delay));

                warn!(
                    operation,
                    attempt,
                    category = %err.category(),
                    ?delay,
                    "Retryable failure, backing off: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
