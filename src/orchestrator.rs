//! Orchestrator
//!
//! Upstream entry point. Owns the shared transport, provider registry,
//! failover manager and pipeline coordinator for the process lifetime, and
//! turns every run into a `PipelineResult`, success or not.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ai::metrics::{HealthReport, create_shared_metrics};
use crate::ai::provider::{
    FailoverManager, ProviderRegistry, RateLimiterRegistry, SharedTransport, create_provider,
    provider_component,
};
use crate::ai::timeout::{TimeoutConfig, with_timeout_map};
use crate::config::Config;
use crate::constants::rate_limit;
use crate::pipeline::{PipelineCoordinator, PipelineSettings};
use crate::types::{PipelineResult, Request, Result, UltraError};

/// Outcome of one provider probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub provider: String,
    pub healthy: bool,
    /// Set when the probe itself failed (timeout, auth, network)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Orchestrator {
    coordinator: PipelineCoordinator,
    failover: Arc<FailoverManager>,
    timeouts: TimeoutConfig,
}

impl Orchestrator {
    /// Build every component from configuration. Providers that cannot be
    /// constructed (usually a missing API key) are skipped with a warning.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = SharedTransport::new(&config.transport, config.timeouts.transport)?;
        let registry = Arc::new(config.model_registry()?);
        let rate_limiters = Arc::new(RateLimiterRegistry::new());

        let mut providers = ProviderRegistry::new();
        for (id, provider_config) in config.enabled_providers() {
            match create_provider(id, provider_config, &transport) {
                Ok(provider) => {
                    if let Some(rpm) = provider_config.requests_per_minute {
                        let burst = provider_config.burst.unwrap_or(rate_limit::DEFAULT_BURST);
                        rate_limiters.configure(id, rpm, burst);
                    }
                    providers.register(provider);
                }
                Err(err) => warn!(provider = id, "Provider skipped: {}", err),
            }
        }

        if providers.is_empty() {
            return Err(UltraError::Config(
                "No provider could be configured; check API keys and enabled flags".to_string(),
            ));
        }
        info!(
            providers = providers.len(),
            models = registry.len(),
            "Orchestrator configured"
        );

        let failover = FailoverManager::new(providers, registry, config.failover_config())
            .with_metrics(create_shared_metrics(Uuid::new_v4().to_string()))
            .with_rate_limiters(rate_limiters);

        Ok(Self::with_components(
            failover,
            config.pipeline.clone(),
            config.timeouts.clone(),
        ))
    }

    /// Assemble from pre-built parts. Metrics and degraded-mode state are
    /// whatever the failover manager carries.
    pub fn with_components(
        failover: FailoverManager,
        settings: PipelineSettings,
        timeouts: TimeoutConfig,
    ) -> Self {
        let failover = Arc::new(failover);
        let coordinator =
            PipelineCoordinator::new(Arc::clone(&failover), settings, timeouts.clone());
        Self {
            coordinator,
            failover,
            timeouts,
        }
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub async fn run_pipeline(&self, request: Request) -> PipelineResult {
        self.run_pipeline_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Run one request to completion. Never fails: errors are folded into
    /// the returned result together with the partial trace.
    #[instrument(
        skip(self, request, cancel),
        fields(correlation_id = %request.id, models = request.requested_models.len())
    )]
    pub async fn run_pipeline_with_cancel(
        &self,
        mut request: Request,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let started = Instant::now();
        let request_id: Uuid = request.id;
        if request.deadline.is_none() {
            request.deadline = Some(started + self.timeouts.pipeline);
        }

        let metrics = self.failover.metrics();
        metrics.record_pipeline_started();
        info!(pattern = %request.pattern, "Pipeline started");

        let outcome = self.coordinator.run_with_cancel(&request, cancel).await;
        let mode = self.failover.degraded().mode();

        match outcome {
            Ok(output) => {
                metrics.record_pipeline_finished(true);
                info!(
                    lead = %output.lead_model,
                    served_by = %output.served_by,
                    fallbacks = output.trace.fallback_events.len(),
                    %mode,
                    "Pipeline succeeded"
                );
                PipelineResult::from_output(request_id, output, mode, started.elapsed())
            }
            Err(err) => {
                metrics.record_pipeline_finished(false);
                warn!(category = %err.category(), %mode, "Pipeline failed: {}", err);
                PipelineResult::from_error(request_id, err, mode, started.elapsed())
            }
        }
    }

    /// Metrics, breaker health and the current operation mode in one report
    pub fn health_report(&self) -> HealthReport {
        self.failover.metrics().health_report(
            self.failover.provider_health(),
            self.failover.degraded().snapshot(),
        )
    }

    /// Health-check every registered provider
    pub async fn probe_all(&self) -> Vec<ProbeResult> {
        let ids: Vec<String> = self.failover.providers().ids().map(String::from).collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.probe(&id).await);
        }
        results
    }

    /// Probe only providers flagged degraded. Once no provider flag remains,
    /// degraded features are cleared too so the next run takes the full path.
    pub async fn probe_recovery(&self) -> Vec<ProbeResult> {
        let degraded = self.failover.degraded();
        let mut results = Vec::new();

        for id in self
            .failover
            .providers()
            .ids()
            .map(String::from)
            .collect::<Vec<_>>()
        {
            if degraded.is_degraded(&provider_component(&id)) {
                results.push(self.probe(&id).await);
            }
        }

        let providers_clear = !degraded
            .degraded_components()
            .iter()
            .any(|c| c.starts_with(&provider_component("")));
        if providers_clear {
            for feature in degraded.degraded_components() {
                degraded.mark_recovered(&feature);
                debug!(feature = %feature, "Feature flag cleared after provider recovery");
            }
        }

        results
    }

    async fn probe(&self, id: &str) -> ProbeResult {
        let outcome = with_timeout_map(
            self.timeouts.transport,
            self.failover.probe_provider(id),
            "health check",
        )
        .await
        .and_then(|inner| inner);

        match outcome {
            Ok(healthy) => ProbeResult {
                provider: id.to_string(),
                healthy,
                error: None,
            },
            Err(err) => {
                debug!(provider = id, "Probe failed: {}", err);
                ProbeResult {
                    provider: id.to_string(),
                    healthy: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
