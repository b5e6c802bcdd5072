//! Per-provider Rate Limiter
//!
//! Token bucket consulted before every outbound call. Buckets refill
//! continuously at `requests_per_minute / 60` tokens per second up to `burst`.
//! A remote 429 carrying `retry_after` penalizes the bucket so local callers
//! stop sending until the provider's window reopens.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::constants::failover::MAX_RETRY_AFTER_SECS;
use crate::types::{Result, UltraError};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

/// Token bucket for one provider
#[derive(Debug)]
pub struct RateLimiter {
    provider: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            provider: provider.into(),
            capacity,
            refill_per_sec: f64::from(requests_per_minute.max(1)) / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Take a token now, or report how long until one is available
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        if let Some(until) = state.blocked_until {
            if until > now {
                return Err(until - now);
            }
            state.blocked_until = None;
        }

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Suspend until a token is available
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            debug!(provider = %self.provider, ?wait, "Rate limited locally, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Suspend for at most `max_wait`; a longer queue is reported as a
    /// rate-limit error so the failover walk can move on.
    pub async fn acquire_within(&self, max_wait: Duration) -> Result<()> {
        let give_up_at = Instant::now() + max_wait;
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) if Instant::now() + wait > give_up_at => {
                    return Err(UltraError::RateLimitExceeded {
                        provider: self.provider.clone(),
                        retry_after: Some(wait),
                    });
                }
                Err(wait) => {
                    debug!(provider = %self.provider, ?wait, "Rate limited locally, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Stop issuing calls until `retry_after` has elapsed
    pub fn penalize(&self, retry_after: Duration) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let retry_after = retry_after.min(Duration::from_secs(MAX_RETRY_AFTER_SECS));
        let until = Instant::now() + retry_after;
        state.blocked_until = Some(state.blocked_until.map_or(until, |u| u.max(until)));
        state.tokens = 0.0;

        debug!(provider = %self.provider, ?retry_after, "Rate limiter penalized by provider");
    }

    /// Tokens currently available (without refilling)
    pub fn available(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .tokens
    }
}

/// Rate limiters keyed by provider id; unconfigured providers are unlimited
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, provider: &str, requests_per_minute: u32, burst: u32) {
        self.limiters.insert(
            provider.to_string(),
            Arc::new(RateLimiter::new(provider, requests_per_minute, burst)),
        );
    }

    pub fn get(&self, provider: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(provider).map(|l| Arc::clone(l.value()))
    }

    pub async fn acquire_within(&self, provider: &str, max_wait: Duration) -> Result<()> {
        // Clone out of the map so no shard guard is held across the await
        match self.get(provider) {
            Some(limiter) => limiter.acquire_within(max_wait).await,
            None => Ok(()),
        }
    }

    pub fn penalize(&self, provider: &str, retry_after: Duration) {
        if let Some(limiter) = self.get(provider) {
            limiter.penalize(retry_after);
        }
    }
}
