//! Orchestration Metrics Collection
//!
//! Per-provider call accounting (latency, outcomes, tokens, fallbacks and
//! circuit short-circuits) plus per-stage durations. Thread-safe for
//! concurrent fan-out: counters are atomics inside a `DashMap` entry per
//! provider, so contention is bounded by provider count.
//!
//! ## Usage
//!
//! ```ignore
//! let metrics = MetricsCollector::new("session-123");
//! metrics.record_success("openai", &response);
//! let report = metrics.health_report(breaker_health, degraded.snapshot());
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::ai::degraded::OperationState;
use crate::ai::provider::{LlmResponse, ProviderHealth};
use crate::constants::pipeline as pipeline_constants;
use crate::types::{ErrorCategory, PipelineStage};

// =============================================================================
// Per-provider counters
// =============================================================================

#[derive(Debug, Default)]
struct ProviderCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuits: AtomicU64,
    /// Calls this provider served as a fallback candidate
    fallbacks_served: AtomicU64,
    /// Times a call left this provider for a fallback
    fallbacks_from: AtomicU64,
    total_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    failures_by_category: Mutex<BTreeMap<ErrorCategory, u64>>,
}

impl ProviderCounters {
    fn snapshot(&self, provider: &str) -> ProviderMetrics {
        let calls = self.calls.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        ProviderMetrics {
            provider: provider.to_string(),
            calls,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            short_circuits: self.short_circuits.load(Ordering::Relaxed),
            fallbacks_served: self.fallbacks_served.load(Ordering::Relaxed),
            fallbacks_from: self.fallbacks_from.load(Ordering::Relaxed),
            avg_latency_ms: if calls > 0 {
                total_latency as f64 / calls as f64
            } else {
                0.0
            },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            failures_by_category: self
                .failures_by_category
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    fn record_latency(&self, latency_ms: u64) {
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);
    }
}

/// Point-in-time view of one provider's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMetrics {
    pub provider: String,
    /// Network calls issued (short-circuits excluded)
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub short_circuits: u64,
    pub fallbacks_served: u64,
    pub fallbacks_from: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub failures_by_category: BTreeMap<ErrorCategory, u64>,
}

impl ProviderMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Duration and outcome of one completed pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageMetrics {
    pub stage: PipelineStage,
    pub duration_ms: u64,
    pub successes: usize,
    pub failures: usize,
    pub degraded: bool,
}

// =============================================================================
// Metrics Collector
// =============================================================================

/// Thread-safe metrics collector shared by the failover manager and the
/// pipeline coordinator
pub struct MetricsCollector {
    session_id: String,
    start_time: Instant,
    providers: DashMap<String, Arc<ProviderCounters>>,
    pipelines_started: AtomicU64,
    pipelines_succeeded: AtomicU64,
    pipelines_failed: AtomicU64,
    stage_history: Mutex<Vec<StageMetrics>>,
}

/// Summary statistics across all providers
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub session_id: String,
    pub uptime_ms: u64,
    pub pipelines_started: u64,
    pub pipelines_succeeded: u64,
    pub pipelines_failed: u64,
    pub total_calls: u64,
    pub total_fallbacks: u64,
    pub total_tokens: u64,
    pub providers: Vec<ProviderMetrics>,
    pub recent_stages: Vec<StageMetrics>,
}

impl MetricsCollector {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: Instant::now(),
            providers: DashMap::new(),
            pipelines_started: AtomicU64::new(0),
            pipelines_succeeded: AtomicU64::new(0),
            pipelines_failed: AtomicU64::new(0),
            stage_history: Mutex::new(Vec::new()),
        }
    }

    fn counters(&self, provider: &str) -> Arc<ProviderCounters> {
        if let Some(existing) = self.providers.get(provider) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.providers
                .entry(provider.to_string())
                .or_default()
                .value(),
        )
    }

    /// Record a successful provider call
    pub fn record_success(&self, provider: &str, response: &LlmResponse) {
        let counters = self.counters(provider);
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.successes.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(response.timing.total_ms);
        counters
            .prompt_tokens
            .fetch_add(u64::from(response.usage.prompt_tokens), Ordering::Relaxed);
        counters
            .completion_tokens
            .fetch_add(u64::from(response.usage.completion_tokens), Ordering::Relaxed);
    }

    /// Record a failed provider call. Circuit-open rejections never reached
    /// the network and are counted as short-circuits instead.
    pub fn record_failure(&self, provider: &str, category: ErrorCategory, latency_ms: u64) {
        let counters = self.counters(provider);
        if category == ErrorCategory::CircuitOpen {
            counters.short_circuits.fetch_add(1, Ordering::Relaxed);
            return;
        }

        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.failures.fetch_add(1, Ordering::Relaxed);
        counters.record_latency(latency_ms);
        *counters
            .failures_by_category
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(category)
            .or_default() += 1;
    }

    /// Record that a call moved from `from` to the fallback `to`
    pub fn record_fallback(&self, from: &str, to: &str) {
        self.counters(from)
            .fallbacks_from
            .fetch_add(1, Ordering::Relaxed);
        self.counters(to)
            .fallbacks_served
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_started(&self) {
        self.pipelines_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_finished(&self, success: bool) {
        let counter = if success {
            &self.pipelines_succeeded
        } else {
            &self.pipelines_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish a stage completion; history keeps the most recent entries
    pub fn record_stage(&self, stage: StageMetrics) {
        let mut history = self.stage_history.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Metrics stage_history mutex poisoned, recovering");
            poisoned.into_inner()
        });
        if history.len() >= pipeline_constants::MAX_STAGE_HISTORY {
            history.remove(0);
        }
        history.push(stage);
    }

    pub fn provider(&self, provider: &str) -> Option<ProviderMetrics> {
        self.providers
            .get(provider)
            .map(|counters| counters.snapshot(provider))
    }

    pub fn snapshot(&self) -> MetricsSummary {
        let mut providers: Vec<ProviderMetrics> = self
            .providers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));

        let recent_stages = self
            .stage_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        MetricsSummary {
            session_id: self.session_id.clone(),
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            pipelines_started: self.pipelines_started.load(Ordering::Relaxed),
            pipelines_succeeded: self.pipelines_succeeded.load(Ordering::Relaxed),
            pipelines_failed: self.pipelines_failed.load(Ordering::Relaxed),
            total_calls: providers.iter().map(|p| p.calls).sum(),
            total_fallbacks: providers.iter().map(|p| p.fallbacks_served).sum(),
            total_tokens: providers.iter().map(|p| p.total_tokens()).sum(),
            providers,
            recent_stages,
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        self.snapshot()
    }

    /// Join the counters with breaker health and the current operation mode
    pub fn health_report(&self, health: Vec<ProviderHealth>, state: OperationState) -> HealthReport {
        let providers = health
            .into_iter()
            .map(|health| {
                let metrics = self
                    .provider(&health.provider)
                    .unwrap_or_else(|| ProviderCounters::default().snapshot(&health.provider));
                ProviderReport { health, metrics }
            })
            .collect();

        HealthReport {
            mode: state.mode,
            degraded_components: state.degraded_components.into_keys().collect(),
            providers,
            summary: self.snapshot(),
        }
    }
}

impl MetricsSummary {
    /// Format summary for display
    pub fn display(&self) -> String {
        format!(
            "Session: {}\n\
             Uptime: {:.1}s\n\
             Pipelines: {} started ({} ok, {} failed)\n\
             Provider calls: {}\n\
             Fallbacks: {}\n\
             Tokens: {}",
            self.session_id,
            self.uptime_ms as f64 / 1000.0,
            self.pipelines_started,
            self.pipelines_succeeded,
            self.pipelines_failed,
            self.total_calls,
            self.total_fallbacks,
            self.total_tokens
        )
    }
}

// =============================================================================
// Health Report
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    pub health: ProviderHealth,
    pub metrics: ProviderMetrics,
}

/// Process health: operation mode, degraded components and per-provider
/// breaker state with call metrics
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub mode: crate::ai::degraded::OperationMode,
    pub degraded_components: Vec<String>,
    pub providers: Vec<ProviderReport>,
    pub summary: MetricsSummary,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.degraded_components.is_empty()
    }
}

// =============================================================================
// Shared Type
// =============================================================================

pub type SharedMetrics = Arc<MetricsCollector>;

pub fn create_shared_metrics(session_id: impl Into<String>) -> SharedMetrics {
    Arc::new(MetricsCollector::new(session_id))
}

// =============================================================================
// Tests
// =============================================================================
