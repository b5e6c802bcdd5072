//! Failover Manager with Circuit Breakers
//!
//! Executes one model call against its primary provider and, on a
//! fallback-eligible failure, walks the configured fallback chain.
//!
//! ## Strategy
//!
//! 1. Map every chain provider to an equivalent model via the registry;
//!    providers with no equivalent are skipped
//! 2. Per candidate: rate limiter, then circuit breaker check, then the call,
//!    retried on the same provider under the [`RetryPolicy`]
//! 3. On failure, classify and update the breaker
//! 4. Fallback-eligible failures move to the next candidate; configuration
//!    errors on the primary and invalid requests anywhere stop the walk
//! 5. Return the first success or `AllFallbacksFailed` with every attempt
//!
//! Chain order is the configured order; breaker health only gates, it never
//! reorders, so the attempt order is a pure function of configuration and
//! the observed failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitTransition};
use super::rate_limiter::RateLimiterRegistry;
use super::{GenerateOptions, LlmResponse, ProviderHealth, ProviderRegistry};
use crate::ai::degraded::{DegradedModeController, Severity, SharedDegradedController};
use crate::ai::metrics::{MetricsCollector, SharedMetrics};
use crate::ai::registry::ModelRegistry;
use crate::ai::retry::{RetryPolicy, retry_with_policy};
use crate::constants::rate_limit as rate_limit_constants;
use crate::types::{
    AttemptFailure, ErrorCategory, FallbackEvent, ModelTarget, Result, UltraError,
};

/// Degraded-mode component name for a provider
pub fn provider_component(provider: &str) -> String {
    format!("provider:{}", provider)
}

/// Configuration for the failover walk
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Same-provider retry budget
    pub retry: RetryPolicy,
    /// Ordered fallback providers keyed by primary provider
    pub fallback_chains: BTreeMap<String, Vec<String>>,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Longest local rate-limit queue wait before the provider is treated as
    /// rate limited
    pub max_rate_limit_wait: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            fallback_chains: BTreeMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_rate_limit_wait: Duration::from_secs(rate_limit_constants::MAX_QUEUE_WAIT_SECS),
        }
    }
}

impl FailoverConfig {
    pub fn with_chain(mut self, primary: &str, chain: &[&str]) -> Self {
        self.fallback_chains.insert(
            primary.to_string(),
            chain.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// Successful result of a failover walk
#[derive(Debug, Clone)]
pub struct FailoverOutcome {
    pub response: LlmResponse,
    pub served_by: ModelTarget,
    /// Event for the candidate that served the call, when it was a fallback
    pub fallback: Option<FallbackEvent>,
    /// Every fallback attempted, in order
    pub events: Vec<FallbackEvent>,
    /// Failed attempts before the success
    pub attempts: Vec<AttemptFailure>,
}

impl FailoverOutcome {
    pub fn used_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Primary + fallback-chain executor shared by all pipeline tasks
pub struct FailoverManager {
    providers: ProviderRegistry,
    registry: Arc<ModelRegistry>,
    config: FailoverConfig,
    /// Circuit breakers keyed by provider id
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    rate_limiters: Arc<RateLimiterRegistry>,
    metrics: SharedMetrics,
    degraded: SharedDegradedController,
}

impl FailoverManager {
    pub fn new(providers: ProviderRegistry, registry: Arc<ModelRegistry>, config: FailoverConfig) -> Self {
        // Flagged features are re-probed on the breaker cool-down
        let degraded = DegradedModeController::with_probe_interval(config.circuit_breaker.open_timeout);
        Self {
            providers,
            registry,
            config,
            circuit_breakers: DashMap::new(),
            rate_limiters: Arc::new(RateLimiterRegistry::new()),
            metrics: Arc::new(MetricsCollector::new("failover")),
            degraded: Arc::new(degraded),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_degraded(mut self, degraded: SharedDegradedController) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn with_rate_limiters(mut self, rate_limiters: Arc<RateLimiterRegistry>) -> Self {
        self.rate_limiters = rate_limiters;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn degraded(&self) -> &SharedDegradedController {
        &self.degraded
    }

    pub fn rate_limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.rate_limiters
    }

    /// Configured fallback providers for `primary_provider`
    pub fn fallback_chain(&self, primary_provider: &str) -> &[String] {
        self.config
            .fallback_chains
            .get(primary_provider)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuit_breakers.get(provider) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuit_breakers
                .entry(provider.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(provider, self.config.circuit_breaker.clone()))
                })
                .value(),
        )
    }

    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.breaker(provider).state()
    }

    /// Health of every registered provider, sorted by id
    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.providers
            .ids()
            .map(|id| self.breaker(id).health())
            .collect()
    }

    /// Candidate list for `primary`: the primary itself, then each chain
    /// provider that is registered and has an equivalent model
    pub fn plan(&self, primary: &ModelTarget, chain: &[String]) -> Vec<ModelTarget> {
        let mut candidates = vec![primary.clone()];
        for provider in chain {
            if candidates.iter().any(|c| &c.provider == provider) {
                continue;
            }
            if !self.providers.contains(provider) {
                debug!(provider = %provider, "Fallback provider not registered, skipping");
                continue;
            }
            match self
                .registry
                .map_model(&primary.provider, &primary.model, provider)
            {
                Some(model) => candidates.push(ModelTarget::new(provider.as_str(), model)),
                None => {
                    debug!(
                        provider = %provider,
                        source = %primary,
                        "No equivalent model on fallback provider, skipping"
                    );
                }
            }
        }
        candidates
    }

    /// Execute `primary` with the fallback chain configured for its provider
    pub async fn execute_with_fallback(
        &self,
        primary: &ModelTarget,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FailoverOutcome> {
        let chain = self.fallback_chain(&primary.provider);
        self.execute_with_chain(primary, chain, prompt, options).await
    }

    /// Execute `primary` with an explicit fallback chain
    pub async fn execute_with_chain(
        &self,
        primary: &ModelTarget,
        chain: &[String],
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FailoverOutcome> {
        let candidates = self.plan(primary, chain);
        self.execute_with_candidates(&candidates, prompt, options)
            .await
    }

    /// Walk pre-resolved candidates in order; the first is the primary
    pub async fn execute_with_candidates(
        &self,
        candidates: &[ModelTarget],
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<FailoverOutcome> {
        let Some(primary) = candidates.first() else {
            return Err(UltraError::Config("No candidates for failover".to_string()));
        };

        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut events: Vec<FallbackEvent> = Vec::new();
        let mut last_error: Option<UltraError> = None;

        for (idx, candidate) in candidates.iter().enumerate() {
            if let Some(previous) = &last_error {
                let failed = &candidates[idx - 1];
                let event = FallbackEvent::new(primary, candidate, previous.category());
                info!(
                    from = %failed,
                    to = %candidate,
                    reason = %event.reason,
                    "Falling back to next provider"
                );
                self.metrics
                    .record_fallback(&failed.provider, &candidate.provider);
                events.push(event);
            }

            match self.attempt(candidate, prompt, options).await {
                Ok(response) => {
                    if !events.is_empty() {
                        info!(served_by = %candidate, fallbacks = events.len(), "Fallback succeeded");
                    }
                    return Ok(FailoverOutcome {
                        response,
                        served_by: candidate.clone(),
                        fallback: events.last().cloned(),
                        events,
                        attempts,
                    });
                }
                Err(err) => {
                    attempts.push(AttemptFailure {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        category: err.category(),
                        message: err.to_string(),
                    });

                    if err.category() == ErrorCategory::InvalidRequest {
                        warn!(candidate = %candidate, "Invalid request, stopping failover: {}", err);
                        return Err(err);
                    }
                    if idx == 0 && !err.should_fallback() {
                        warn!(
                            candidate = %candidate,
                            category = %err.category(),
                            "Primary failed with non-fallback error: {}",
                            err
                        );
                        return Err(err);
                    }

                    warn!(
                        candidate = %candidate,
                        category = %err.category(),
                        "Candidate failed: {}",
                        err
                    );
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if events.is_empty() => Err(err),
            _ => {
                warn!(attempts = attempts.len(), "All fallbacks failed");
                Err(UltraError::AllFallbacksFailed { attempts })
            }
        }
    }

    /// One candidate: rate limit, breaker gate, call, retried in place
    async fn attempt(
        &self,
        candidate: &ModelTarget,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        let provider = self.providers.get(&candidate.provider).ok_or_else(|| {
            UltraError::Config(format!("Provider '{}' is not configured", candidate.provider))
        })?;
        let breaker = self.breaker(&candidate.provider);
        let operation = candidate.to_string();

        retry_with_policy(&self.config.retry, &operation, |attempt| {
            let breaker = &breaker;
            async move {
                self.rate_limiters
                    .acquire_within(&candidate.provider, self.config.max_rate_limit_wait)
                    .await?;

                if !breaker.allow_request() {
                    self.metrics
                        .record_failure(&candidate.provider, ErrorCategory::CircuitOpen, 0);
                    return Err(UltraError::CircuitOpen {
                        provider: candidate.provider.clone(),
                    });
                }

                debug!(candidate = %candidate, attempt, "Calling provider");
                let started = Instant::now();
                match provider.generate(prompt, &candidate.model, options).await {
                    Ok(response) => {
                        debug!(
                            candidate = %candidate,
                            tokens = response.usage.total(),
                            latency_ms = response.timing.total_ms,
                            "Provider call succeeded"
                        );
                        self.metrics.record_success(&candidate.provider, &response);
                        let transition = breaker.record_success();
                        self.apply_transition(transition);
                        Ok(response)
                    }
                    Err(err) => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        self.record_provider_failure(&candidate.provider, breaker, &err, latency_ms);
                        Err(err)
                    }
                }
            }
        })
        .await
    }

    fn record_provider_failure(
        &self,
        provider: &str,
        breaker: &CircuitBreaker,
        err: &UltraError,
        latency_ms: u64,
    ) {
        let category = err.category();
        self.metrics.record_failure(provider, category, latency_ms);

        if category == ErrorCategory::RateLimitExceeded
            && let Some(retry_after) = err.retry_after()
        {
            self.rate_limiters.penalize(provider, retry_after);
        }

        if category.counts_against_provider() {
            let transition = breaker.record_failure();
            self.apply_transition(transition);
        }
    }

    /// Mirror breaker transitions into degraded mode
    fn apply_transition(&self, transition: Option<CircuitTransition>) {
        let Some(transition) = transition else {
            return;
        };
        let component = provider_component(&transition.provider);
        warn!(
            provider = %transition.provider,
            from = %transition.from,
            to = %transition.to,
            "Circuit state changed"
        );
        match transition.to {
            CircuitState::Open => {
                self.degraded
                    .mark_degraded(&component, Severity::Degraded, "circuit open");
            }
            CircuitState::Closed => {
                self.degraded.mark_recovered(&component);
            }
            CircuitState::HalfOpen => {}
        }
    }

    /// Health-check one provider; a pass closes its breaker and clears its
    /// degraded flag
    pub async fn probe_provider(&self, provider_id: &str) -> Result<bool> {
        let provider = self.providers.get(provider_id).ok_or_else(|| {
            UltraError::Config(format!("Provider '{}' is not configured", provider_id))
        })?;

        let healthy = provider.health_check().await?;
        if healthy {
            self.breaker(provider_id).reset();
            self.degraded.mark_recovered(&provider_component(provider_id));
            info!(provider = provider_id, "Provider probe passed");
        } else {
            debug!(provider = provider_id, "Provider probe reported unhealthy");
        }
        Ok(healthy)
    }
}
