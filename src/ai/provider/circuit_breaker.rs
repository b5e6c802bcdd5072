//! Circuit Breaker Pattern for Provider Resilience
//!
//! Per-provider failure tracker used by the failover manager to skip a
//! provider that is currently unhealthy. Never shared across providers, so
//! lock contention is bounded by provider count.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: Provider is failing, requests are short-circuited without a network call
//! - **HalfOpen**: Cool-down elapsed, a limited number of probes are admitted
//!
//! ## Transitions
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[open_timeout elapsed]--> HalfOpen
//! HalfOpen --[success_threshold probe successes]--> Closed
//! HalfOpen --[any failure]--> Open (cool-down restarted)
//! ```

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::constants::circuit_breaker as cb_constants;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Provider is failing - requests rejected immediately
    Open,
    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Number of probe successes in half-open to close circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub open_timeout: Duration,
    /// Maximum probe requests allowed in half-open state
    pub half_open_max_requests: u32,
    /// Outcomes kept for the success rate
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            success_threshold: cb_constants::SUCCESS_THRESHOLD,
            open_timeout: Duration::from_secs(cb_constants::RECOVERY_TIMEOUT_SECS),
            half_open_max_requests: cb_constants::HALF_OPEN_MAX_REQUESTS,
            window_size: cb_constants::HEALTH_WINDOW,
        }
    }
}

/// A state change, returned so callers can log it and feed degraded mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub provider: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Mutable breaker state; every transition happens under one write lock
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    success_count: u32,
    half_open_requests: u32,
    opened_at: Option<Instant>,
    probes_started_at: Option<Instant>,
    last_failure_ts: Option<DateTime<Utc>>,
    blocked_count: u64,
    window: VecDeque<bool>,
}

impl CircuitBreakerInner {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            success_count: 0,
            half_open_requests: 0,
            opened_at: None,
            probes_started_at: None,
            last_failure_ts: None,
            blocked_count: 0,
            window: VecDeque::with_capacity(window_size),
        }
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.success_count = 0;
        self.half_open_requests = 0;
        self.opened_at = None;
        self.probes_started_at = None;
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.probes_started_at = None;
        self.half_open_requests = 0;
        self.success_count = 0;
    }

    fn push_outcome(&mut self, success: bool, window_size: usize) {
        if window_size == 0 {
            return;
        }
        while self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|ok| **ok).count();
        successes as f64 / self.window.len() as f64
    }
}

/// Per-provider health gate.
///
/// Closed until `failure_threshold` consecutive failures, then open for
/// `open_timeout`, then half-open for at most `half_open_max_requests` probes.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    provider_name: String,
    inner: RwLock<CircuitBreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider_name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a provider. `success_threshold` is
    /// clamped to `half_open_max_requests` so half-open can always close.
    pub fn new(provider_name: impl Into<String>, mut config: CircuitBreakerConfig) -> Self {
        config.half_open_max_requests = config.half_open_max_requests.max(1);
        config.success_threshold = config
            .success_threshold
            .clamp(1, config.half_open_max_requests);
        let window_size = config.window_size;
        Self {
            config,
            provider_name: provider_name.into(),
            inner: RwLock::new(CircuitBreakerInner::new(window_size)),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(provider_name: impl Into<String>) -> Self {
        Self::new(provider_name, CircuitBreakerConfig::default())
    }

    pub fn provider(&self) -> &str {
        &self.provider_name
    }

    /// Get current circuit state (checking for timeout transitions)
    pub fn state(&self) -> CircuitState {
        self.check_state_transition();

        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    /// Check if request should be allowed
    ///
    /// Returns `true` if the request can proceed, `false` if it must be
    /// short-circuited.
    pub fn allow_request(&self) -> bool {
        self.check_state_transition();

        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                inner.blocked_count += 1;
                tracing::debug!(
                    "Circuit breaker [{}]: Request blocked (circuit OPEN)",
                    self.provider_name
                );
                false
            }
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    if inner.probes_started_at.is_none() {
                        inner.probes_started_at = Some(Instant::now());
                    }
                    tracing::debug!(
                        "Circuit breaker [{}]: Allowing probe request ({}/{})",
                        self.provider_name,
                        inner.half_open_requests,
                        self.config.half_open_max_requests
                    );
                    true
                } else {
                    inner.blocked_count += 1;
                    tracing::debug!(
                        "Circuit breaker [{}]: Half-open probe limit reached",
                        self.provider_name
                    );
                    false
                }
            }
        }
    }

    /// Record a successful request
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.consecutive_failures = 0;
        inner.push_outcome(true, self.config.window_size);

        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;

            if inner.success_count >= self.config.success_threshold {
                inner.reset();

                tracing::info!(
                    provider = %self.provider_name,
                    "Circuit breaker [{}]: Closed (provider recovered)",
                    self.provider_name
                );

                return Some(CircuitTransition {
                    provider: self.provider_name.clone(),
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                });
            }
        }

        None
    }

    /// Record a failed request
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.success_count = 0;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_ts = Some(Utc::now());
        inner.push_outcome(false, self.config.window_size);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();

                    tracing::warn!(
                        provider = %self.provider_name,
                        "Circuit breaker [{}]: Opened after {} consecutive failures (cool-down: {:?})",
                        self.provider_name,
                        inner.consecutive_failures,
                        self.config.open_timeout
                    );

                    return Some(CircuitTransition {
                        provider: self.provider_name.clone(),
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    });
                }
                None
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open immediately opens the circuit
                inner.open();

                tracing::warn!(
                    provider = %self.provider_name,
                    "Circuit breaker [{}]: Re-opened after failure in half-open state",
                    self.provider_name
                );

                Some(CircuitTransition {
                    provider: self.provider_name.clone(),
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            // Late result from a request admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    /// Health snapshot for metrics and degraded mode
    pub fn health(&self) -> ProviderHealth {
        self.check_state_transition();

        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        ProviderHealth {
            provider: self.provider_name.clone(),
            circuit_state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_ts: inner.last_failure_ts,
            success_rate: inner.success_rate(),
            blocked_count: inner.blocked_count,
        }
    }

    /// Force reset to closed state (for manual intervention)
    pub fn reset(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.reset();

        tracing::info!(
            "Circuit breaker [{}]: Manually reset to CLOSED",
            self.provider_name
        );
    }

    /// Open -> half-open after cool-down. A half-open window whose probes
    /// never reported back is re-armed after another cool-down.
    fn check_state_transition(&self) {
        let should_transition = {
            let inner = self
                .inner
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.config.open_timeout),
                CircuitState::HalfOpen => {
                    inner.half_open_requests >= self.config.half_open_max_requests
                        && inner
                            .probes_started_at
                            .is_some_and(|t| t.elapsed() >= self.config.open_timeout)
                }
                CircuitState::Closed => false,
            }
        };

        if should_transition {
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            // Double-check state (may have changed between read and write)
            if matches!(inner.state, CircuitState::Open | CircuitState::HalfOpen) {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_requests = 0;
                inner.success_count = 0;
                inner.probes_started_at = None;

                tracing::info!(
                    provider = %self.provider_name,
                    "Circuit breaker [{}]: Transitioning to HALF_OPEN (testing recovery)",
                    self.provider_name
                );
            }
        }
    }
}

/// Per-provider health record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_ts: Option<DateTime<Utc>>,
    /// Success ratio over the sliding window (1.0 with no history)
    pub success_rate: f64,
    pub blocked_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
            window_size: 4,
        }
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
        assert_eq!(cb.health().success_rate, 1.0);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        assert!(cb.record_failure().is_none());
        assert!(cb.record_failure().is_none());
        assert_eq!(cb.state(), CircuitState::Closed);

        let transition = cb.record_failure().unwrap();
        assert_eq!(transition.from, CircuitState::Closed);
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.health().consecutive_failures, 2);
    }

    async fn cool_down() {
        tokio::time::advance(Duration::from_secs(61)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_probe_count() {
        let cb = CircuitBreaker::new("test", fast_config());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cool_down().await;

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(cb.allow_request());
        assert!(!cb.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_on_success() {
        let cb = CircuitBreaker::new("test", fast_config());

        cb.record_failure();
        cool_down().await;

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(cb.allow_request());

        assert!(cb.record_success().is_none());
        let transition = cb.record_success().unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_above_probe_budget_still_closes() {
        let config = CircuitBreakerConfig {
            success_threshold: 4,
            half_open_max_requests: 3,
            ..fast_config()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        cool_down().await;

        for _ in 0..3 {
            assert!(cb.allow_request());
        }
        assert!(!cb.allow_request());

        assert!(cb.record_success().is_none());
        assert!(cb.record_success().is_none());
        let transition = cb.record_success().unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_opens_on_failure() {
        let cb = CircuitBreaker::new("test", fast_config());

        cb.record_failure();
        cool_down().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());

        let transition = cb.record_failure().unwrap();
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(transition.to, CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_blocked_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        assert_eq!(cb.health().blocked_count, 3);
        assert_eq!(cb.health().blocked_count, 3);
    }

    #[test]
    fn test_manual_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_success_rate_sliding_window() {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            window_size: 4,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_success();
        assert!((cb.health().success_rate - 0.5).abs() < f64::EPSILON);

        // Oldest two failures fall out of the window
        cb.record_success();
        cb.record_success();
        assert!((cb.health().success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_health_records_last_failure() {
        let cb = CircuitBreaker::with_defaults("openai");
        assert!(cb.health().last_failure_ts.is_none());

        cb.record_failure();
        let health = cb.health();
        assert_eq!(health.provider, "openai");
        assert!(health.last_failure_ts.is_some());
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.circuit_state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_half_open_window_rearms() {
        let config = CircuitBreakerConfig {
            half_open_max_requests: 1,
            ..fast_config()
        };
        let cb = CircuitBreaker::new("test", config);

        cb.record_failure();
        cool_down().await;
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        // Probe never reported back; window re-arms after another cool-down
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!cb.allow_request());
        cool_down().await;
        assert!(cb.allow_request());
    }
}
