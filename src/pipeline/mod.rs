//! Multi-Stage Pipeline Coordinator
//!
//! Drives one request through the linear stage machine:
//!
//! ```text
//! INITIAL_RESPONSE → PEER_REVIEW_REVISION → ULTRA_SYNTHESIS → DONE
//! ```
//!
//! ## Stages
//!
//! 1. **Initial response**: the prompt fans out to every requested model.
//!    Partial success is valid; zero successes ends the run with
//!    `PipelineExhausted`.
//! 2. **Peer review**: each survivor revises its answer against the others.
//!    A model failing here keeps its stage-1 answer. The stage runs through
//!    the `peer_review` feature gate, so in degraded mode every answer is
//!    carried forward without calls.
//! 3. **Ultra synthesis**: the highest-priority survivor leads one call over
//!    all stage-2 answers; the remaining survivors, in priority order, are
//!    its fallback chain.
//!
//! No stage starts before the previous stage's join barrier completes.

mod fanout;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::metrics::StageMetrics;
use crate::ai::prompt::PromptTemplates;
use crate::ai::provider::FailoverManager;
use crate::ai::registry::default_priority;
use crate::ai::timeout::{TimeoutConfig, with_timeout};
use crate::constants::pipeline as pipeline_constants;
use crate::types::{
    FallbackEvent, ModelOutput, ModelTarget, PipelineOutput, PipelineStage, PipelineTrace, Request, Result,
    StageResult, UltraError,
};

use fanout::{FanOut, FanOutResults, FanOutTask};

/// Stage layout selected by `Request::pattern`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePattern {
    /// All three stages
    Ultra,
    /// Initial responses straight into synthesis; stage 2 carries forward
    Quick,
}

impl FromStr for PipelinePattern {
    type Err = UltraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "ultra" => Ok(Self::Ultra),
            "quick" => Ok(Self::Quick),
            other => Err(UltraError::invalid_request(
                "pipeline",
                format!("Unknown pipeline pattern '{}'", other),
            )),
        }
    }
}

/// Coordinator settings (the `[pipeline]` config section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Walk provider fallback chains for stage 1 and 2 calls. Off by default:
    /// a failed model is recorded as failed for that stage.
    pub fallback_during_fanout: bool,
    /// Requested models beyond this are dropped
    pub max_models: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fallback_during_fanout: false,
            max_models: pipeline_constants::MAX_MODELS,
        }
    }
}

/// A requested model resolved against the registry
#[derive(Debug, Clone)]
struct ResolvedModel {
    label: String,
    target: ModelTarget,
    priority: u32,
}

pub struct PipelineCoordinator {
    failover: Arc<FailoverManager>,
    settings: PipelineSettings,
    timeouts: TimeoutConfig,
}

impl PipelineCoordinator {
    pub fn new(failover: Arc<FailoverManager>, settings: PipelineSettings, timeouts: TimeoutConfig) -> Self {
        Self {
            failover,
            settings,
            timeouts,
        }
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run(&self, request: &Request) -> Result<PipelineOutput> {
        self.run_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Run all stages. Cancelling `cancel` drops every in-flight call of the
    /// current stage and returns `Cancelled` with the stages completed so far.
    pub async fn run_with_cancel(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutput> {
        let pattern: PipelinePattern = request.pattern.parse()?;
        let (models, unresolved) = self.resolve_models(request)?;
        let mut trace = PipelineTrace::default();

        // Stage 1
        let stage1 = self
            .initial_response(request, &models, unresolved, cancel, &mut trace)
            .await;
        let stage1 = match stage1 {
            Ok(stage1) => stage1,
            Err(err) => return Err(err.with_trace(trace)),
        };
        if !stage1.has_survivors() {
            warn!(failures = stage1.failure_count(), "No model produced an initial response");
            return Err(exhausted(PipelineStage::InitialResponse, trace, None));
        }
        let survivors: Vec<&ResolvedModel> = stage1
            .successful_models
            .iter()
            .filter_map(|label| models.iter().find(|m| &m.label == label))
            .collect();

        // Stage 2
        let stage2 = match pattern {
            PipelinePattern::Quick => {
                carry_forward(&stage1, PipelineStage::PeerReviewRevision, false, Instant::now())
            }
            PipelinePattern::Ultra => {
                let reviewed = self
                    .peer_review(request, &stage1, &survivors, cancel, &mut trace)
                    .await;
                match reviewed {
                    Ok(stage2) => stage2,
                    Err(err) => return Err(err.with_trace(trace)),
                }
            }
        };
        self.publish_stage(&stage2);
        trace.record_stage(stage2.clone());

        // Stage 3
        self.ultra_synthesis(request, &models, &stage2, cancel, trace)
            .await
    }

    /// Resolve requested names: registry entries first, then explicit
    /// `provider/model` on a registered provider. Unresolvable names are
    /// returned separately with their error.
    fn resolve_models(&self, request: &Request) -> Result<(Vec<ResolvedModel>, Vec<(String, UltraError)>)> {
        let mut models: Vec<ResolvedModel> = Vec::new();
        let mut unresolved = Vec::new();
        let mut seen = HashSet::new();

        for name in &request.requested_models {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let resolved = if let Some(def) = self.failover.registry().resolve(name) {
                ResolvedModel {
                    label: name.to_string(),
                    target: def.target(),
                    priority: def.priority,
                }
            } else if let Some((provider, model)) = name.split_once('/')
                && self.failover.providers().contains(provider)
            {
                ResolvedModel {
                    label: name.to_string(),
                    target: ModelTarget::new(provider, model),
                    priority: default_priority(),
                }
            } else {
                if !unresolved.iter().any(|(label, _)| label == name) {
                    unresolved.push((
                        name.to_string(),
                        UltraError::ModelNotFound {
                            provider: name.split_once('/').map_or("registry", |(p, _)| p).to_string(),
                            model: name.to_string(),
                        },
                    ));
                }
                continue;
            };

            if seen.insert(resolved.target.clone()) {
                models.push(resolved);
            } else {
                debug!(model = name, "Duplicate requested model ignored");
            }
        }

        if models.len() + unresolved.len() > self.settings.max_models {
            warn!(
                requested = models.len() + unresolved.len(),
                max = self.settings.max_models,
                "Too many models requested, truncating"
            );
            models.truncate(self.settings.max_models);
            unresolved.truncate(self.settings.max_models.saturating_sub(models.len()));
        }

        if models.is_empty() && unresolved.is_empty() {
            return Err(UltraError::invalid_request("pipeline", "No models requested"));
        }
        Ok((models, unresolved))
    }

    fn fan_out<'a>(&'a self, stage: PipelineStage, request: &'a Request, use_fallback: bool) -> FanOut<'a> {
        FanOut {
            failover: &self.failover,
            stage,
            options: &request.options,
            use_fallback,
            deadline: self.timeouts.stage_deadline(request.deadline),
        }
    }

    async fn initial_response(
        &self,
        request: &Request,
        models: &[ResolvedModel],
        unresolved: Vec<(String, UltraError)>,
        cancel: &CancellationToken,
        trace: &mut PipelineTrace,
    ) -> Result<StageResult> {
        let stage = PipelineStage::InitialResponse;
        let started = Instant::now();
        info!(stage = %stage, models = models.len(), "Stage started");

        let tasks = models
            .iter()
            .map(|m| FanOutTask {
                label: m.label.clone(),
                target: m.target.clone(),
                prompt: request.prompt.clone(),
            })
            .collect();
        let mut results = self
            .fan_out(stage, request, self.settings.fallback_during_fanout)
            .run(tasks, cancel)
            .await?;

        for (label, err) in unresolved {
            warn!(model = %label, "Requested model is not registered");
            results.insert(label, Err(err));
        }

        let order: Vec<String> = request
            .requested_models
            .iter()
            .map(|m| m.trim().to_string())
            .collect();
        let (result, events) = build_stage(stage, &order, results, started);

        trace.record_fallbacks(stage, events);
        self.publish_stage(&result);
        trace.record_stage(result.clone());
        Ok(result)
    }

    async fn peer_review(
        &self,
        request: &Request,
        stage1: &StageResult,
        survivors: &[&ResolvedModel],
        cancel: &CancellationToken,
        trace: &mut PipelineTrace,
    ) -> Result<StageResult> {
        let stage = PipelineStage::PeerReviewRevision;
        let started = Instant::now();

        if survivors.len() < 2 {
            debug!("Single survivor, nothing to review against");
            return Ok(carry_forward(stage1, stage, false, started));
        }

        info!(stage = %stage, models = survivors.len(), "Stage started");
        let mut events = Vec::new();
        let events_sink = &mut events;

        let review = self.failover.degraded().execute_feature(
            pipeline_constants::PEER_REVIEW_FEATURE,
            move || async move {
                let tasks = survivors
                    .iter()
                    .map(|model| FanOutTask {
                        label: model.label.clone(),
                        target: model.target.clone(),
                        prompt: revision_prompt(&request.prompt, stage1, &model.label),
                    })
                    .collect();

                // Cancellation is handled around the feature call so it
                // never marks the feature degraded
                let results = self
                    .fan_out(stage, request, self.settings.fallback_during_fanout)
                    .run(tasks, &CancellationToken::new())
                    .await?;

                let first_error = results
                    .values()
                    .find_map(|r| r.as_ref().err())
                    .map(|e| UltraError::FeatureUnavailable {
                        feature: pipeline_constants::PEER_REVIEW_FEATURE.to_string(),
                        reason: e.to_string(),
                    });
                let any_ok = results.values().any(|r| r.is_ok());

                let order: Vec<String> = survivors.iter().map(|m| m.label.clone()).collect();
                let (mut result, stage_events) = build_stage(stage, &order, results, started);
                events_sink.extend(stage_events);

                match (any_ok, first_error) {
                    (false, Some(err)) => Err(err),
                    _ => {
                        // Failed revisions keep their stage-1 answer
                        for label in &order {
                            if !result.successful_models.contains(label)
                                && let Some(text) = stage1.output_for(label)
                            {
                                result
                                    .per_model_output
                                    .insert(label.clone(), ModelOutput::text(text));
                                result.carried_forward.push(label.clone());
                            }
                        }
                        Ok(result)
                    }
                }
            },
            || async { Ok(carry_forward(stage1, stage, true, started)) },
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(UltraError::cancelled(format!("stage {}", stage)));
            }
            result = review => result?,
        };

        trace.record_fallbacks(stage, events);
        if result.degraded {
            warn!(stage = %stage, "Peer review degraded, stage-1 answers carried forward");
        }
        Ok(result)
    }

    async fn ultra_synthesis(
        &self,
        request: &Request,
        models: &[ResolvedModel],
        stage2: &StageResult,
        cancel: &CancellationToken,
        mut trace: PipelineTrace,
    ) -> Result<PipelineOutput> {
        let stage = PipelineStage::UltraSynthesis;
        let started = Instant::now();

        // Lead order: priority, then request order
        let mut leads: Vec<&ResolvedModel> = models
            .iter()
            .filter(|m| stage2.output_for(&m.label).is_some())
            .collect();
        leads.sort_by_key(|m| m.priority);

        let Some(lead) = leads.first() else {
            return Err(exhausted(PipelineStage::PeerReviewRevision, trace, None));
        };
        let lead_label = lead.label.clone();
        info!(stage = %stage, lead = %lead_label, candidates = leads.len(), "Stage started");

        let answers: Vec<(&str, &str)> = models
            .iter()
            .filter_map(|m| stage2.output_for(&m.label).map(|text| (m.label.as_str(), text)))
            .collect();
        let prompt = PromptTemplates::ultra_synthesis(&request.prompt, &answers);
        let candidates: Vec<ModelTarget> = leads.iter().map(|m| m.target.clone()).collect();

        let deadline = self.timeouts.stage_deadline(request.deadline);
        let call = with_timeout(
            deadline.saturating_duration_since(Instant::now()),
            self.failover
                .execute_with_candidates(&candidates, &prompt, &request.options),
            stage.as_str(),
        );
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(stage = %stage, "Synthesis cancelled");
                return Err(UltraError::cancelled(format!("stage {}", stage)).with_trace(trace));
            }
            outcome = call => outcome,
        };

        let label_for = |target: &ModelTarget| {
            leads
                .iter()
                .find(|m| &m.target == target)
                .map_or_else(|| target.to_string(), |m| m.label.clone())
        };

        let mut result = StageResult {
            stage,
            per_model_output: Default::default(),
            successful_models: Vec::new(),
            carried_forward: Vec::new(),
            degraded: false,
            duration_ms: 0,
        };

        match outcome {
            Ok(outcome) => {
                for attempt in &outcome.attempts {
                    let target = ModelTarget::new(attempt.provider.as_str(), attempt.model.as_str());
                    result.per_model_output.insert(
                        label_for(&target),
                        ModelOutput::Error {
                            category: attempt.category,
                            message: attempt.message.clone(),
                        },
                    );
                }
                let served_label = label_for(&outcome.served_by);
                result
                    .per_model_output
                    .insert(served_label.clone(), ModelOutput::text(&outcome.response.text));
                result.successful_models.push(served_label.clone());
                result.duration_ms = started.elapsed().as_millis() as u64;

                trace.record_fallbacks(stage, outcome.events);
                self.publish_stage(&result);
                trace.record_stage(result);

                info!(lead = %lead_label, served_by = %served_label, "Pipeline complete");
                Ok(PipelineOutput {
                    final_synthesis: outcome.response.text,
                    lead_model: lead_label,
                    served_by: outcome.served_by,
                    trace,
                })
            }
            Err(err) => {
                match &err {
                    UltraError::AllFallbacksFailed { attempts } => {
                        for attempt in attempts {
                            let target =
                                ModelTarget::new(attempt.provider.as_str(), attempt.model.as_str());
                            result.per_model_output.insert(
                                label_for(&target),
                                ModelOutput::Error {
                                    category: attempt.category,
                                    message: attempt.message.clone(),
                                },
                            );
                        }
                    }
                    other => {
                        result
                            .per_model_output
                            .insert(lead_label.clone(), ModelOutput::from_error(other));
                    }
                }
                result.duration_ms = started.elapsed().as_millis() as u64;
                self.publish_stage(&result);
                trace.record_stage(result);

                warn!(lead = %lead_label, category = %err.category(), "Synthesis failed: {}", err);
                Err(exhausted(stage, trace, Some(err)))
            }
        }
    }

    fn publish_stage(&self, result: &StageResult) {
        info!(
            stage = %result.stage,
            successes = result.successful_models.len(),
            failures = result.failure_count(),
            carried_forward = result.carried_forward.len(),
            degraded = result.degraded,
            duration_ms = result.duration_ms,
            "Stage complete"
        );
        self.failover.metrics().record_stage(StageMetrics {
            stage: result.stage,
            duration_ms: result.duration_ms,
            successes: result.successful_models.len(),
            failures: result.failure_count(),
            degraded: result.degraded,
        });
    }
}

fn exhausted(stage: PipelineStage, trace: PipelineTrace, source: Option<UltraError>) -> UltraError {
    UltraError::PipelineExhausted {
        stage,
        trace: Box::new(trace),
        source: source.map(Box::new),
    }
}

/// Aggregate fan-out results in `order`; fallback events follow the same
/// order so the audit trail is deterministic
fn build_stage(
    stage: PipelineStage,
    order: &[String],
    mut results: FanOutResults,
    started: Instant,
) -> (StageResult, Vec<FallbackEvent>) {
    let mut result = StageResult {
        stage,
        per_model_output: Default::default(),
        successful_models: Vec::new(),
        carried_forward: Vec::new(),
        degraded: false,
        duration_ms: 0,
    };
    let mut events = Vec::new();

    for label in order {
        let Some(outcome) = results.remove(label) else {
            continue;
        };
        match outcome {
            Ok(outcome) => {
                result
                    .per_model_output
                    .insert(label.clone(), ModelOutput::text(outcome.response.text));
                result.successful_models.push(label.clone());
                events.extend(outcome.events);
            }
            Err(err) => {
                warn!(stage = %stage, model = %label, category = %err.category(), "Model failed: {}", err);
                result
                    .per_model_output
                    .insert(label.clone(), ModelOutput::from_error(&err));
            }
        }
    }

    result.duration_ms = started.elapsed().as_millis() as u64;
    (result, events)
}

/// Stage result that reuses every previous answer unchanged
fn carry_forward(
    previous: &StageResult,
    stage: PipelineStage,
    degraded: bool,
    started: Instant,
) -> StageResult {
    let mut result = StageResult {
        stage,
        per_model_output: Default::default(),
        successful_models: Vec::new(),
        carried_forward: Vec::new(),
        degraded,
        duration_ms: 0,
    };
    for label in previous.surviving_models() {
        if let Some(text) = previous.output_for(&label) {
            result
                .per_model_output
                .insert(label.clone(), ModelOutput::text(text));
            result.carried_forward.push(label);
        }
    }
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

fn revision_prompt(original: &str, stage1: &StageResult, label: &str) -> String {
    let own = stage1.output_for(label).unwrap_or_default();
    let peers: Vec<(&str, &str)> = stage1
        .successful_models
        .iter()
        .filter(|other| other.as_str() != label)
        .filter_map(|other| stage1.output_for(other).map(|text| (other.as_str(), text)))
        .collect();
    PromptTemplates::peer_review(original, own, &peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ai::degraded::{OperationMode, Severity};
    use crate::ai::provider::mock::{MockProvider, server_error};
    use crate::ai::provider::{FailoverConfig, ProviderRegistry, SharedProvider};
    use crate::ai::registry::ModelRegistry;
    use crate::ai::retry::RetryPolicy;
    use crate::types::ErrorCategory;

    const A: &str = "openai/gpt-4o";
    const B: &str = "anthropic/claude-3-opus-20240229";
    const C: &str = "google/gemini-1.5-pro";

    fn is_synthesis(prompt: &str) -> bool {
        prompt.contains("synthesizing multiple expert answers")
    }

    fn coordinator(openai: MockProvider, anthropic: MockProvider, google: MockProvider) -> PipelineCoordinator {
        let providers = ProviderRegistry::new()
            .with(Arc::new(openai) as SharedProvider)
            .with(Arc::new(anthropic) as SharedProvider)
            .with(Arc::new(google) as SharedProvider);
        let config = FailoverConfig::default()
            .with_retry(RetryPolicy::none())
            .with_chain("openai", &["anthropic", "google"]);
        let failover = FailoverManager::new(providers, Arc::new(ModelRegistry::builtin()), config);
        PipelineCoordinator::new(Arc::new(failover), PipelineSettings::default(), TimeoutConfig::default())
    }

    fn request() -> Request {
        Request::new("Explain ownership", vec![A.to_string(), B.to_string(), C.to_string()])
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::new("anthropic"),
            MockProvider::new("google"),
        );

        let output = coordinator.run(&request()).await.unwrap();

        assert_eq!(output.trace.stages.len(), 3);
        assert_eq!(output.lead_model, A);
        assert_eq!(output.final_synthesis, "openai:gpt-4o answer");
        assert!(output.trace.fallback_events.is_empty());

        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();
        assert_eq!(review.successful_models.len(), 3);
        assert!(!review.degraded);
    }

    #[tokio::test]
    async fn test_partial_success_reaches_synthesis() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::failing("anthropic", server_error),
            MockProvider::new("google"),
        );

        let output = coordinator.run(&request()).await.unwrap();

        let initial = output.trace.stage(PipelineStage::InitialResponse).unwrap();
        assert_eq!(initial.successful_models, vec![A.to_string(), C.to_string()]);
        assert!(!initial.per_model_output[B].is_ok());

        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();
        assert_eq!(review.successful_models, vec![A.to_string(), C.to_string()]);

        assert!(output.trace.stage(PipelineStage::UltraSynthesis).is_some());
        assert_eq!(output.trace.failure_count(), 1);
        assert!(output.trace.fallback_events.is_empty());
    }

    #[tokio::test]
    async fn test_all_fail_is_exhausted_without_synthesis() {
        let coordinator = coordinator(
            MockProvider::failing("openai", server_error),
            MockProvider::failing("anthropic", server_error),
            MockProvider::failing("google", server_error),
        );

        let err = coordinator.run(&request()).await.unwrap_err();

        let UltraError::PipelineExhausted { stage, trace, .. } = err else {
            panic!("expected PipelineExhausted, got {err:?}");
        };
        assert_eq!(stage, PipelineStage::InitialResponse);
        assert_eq!(trace.stages.len(), 1);
        assert!(trace.stage(PipelineStage::UltraSynthesis).is_none());
    }

    #[tokio::test]
    async fn test_synthesis_lead_falls_over_to_next_survivor() {
        let coordinator = coordinator(
            MockProvider::new("openai").with_rule(|_, prompt| {
                is_synthesis(prompt).then(|| server_error("lead down"))
            }),
            MockProvider::failing("anthropic", server_error),
            MockProvider::new("google"),
        );

        let output = coordinator.run(&request()).await.unwrap();

        let initial = output.trace.stage(PipelineStage::InitialResponse).unwrap();
        assert!(initial.per_model_output[A].is_ok());
        assert!(!initial.per_model_output[B].is_ok());
        assert!(initial.per_model_output[C].is_ok());

        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();
        assert_eq!(review.successful_models, vec![A.to_string(), C.to_string()]);

        assert_eq!(output.trace.fallback_events.len(), 1);
        let event = &output.trace.fallback_events[0];
        assert_eq!(event.original_provider, "openai");
        assert_eq!(event.fallback_provider, "google");
        assert_eq!(event.reason, ErrorCategory::ServerError);
        assert_eq!(event.stage, Some(PipelineStage::UltraSynthesis));

        assert_eq!(output.lead_model, A);
        assert_eq!(output.served_by, ModelTarget::new("google", "gemini-1.5-pro"));
        assert_eq!(output.final_synthesis, "google:gemini-1.5-pro answer");
    }

    #[tokio::test]
    async fn test_synthesis_exhaustion_keeps_trace() {
        let coordinator = coordinator(
            MockProvider::new("openai").with_rule(|_, prompt| {
                is_synthesis(prompt).then(|| server_error("down"))
            }),
            MockProvider::failing("anthropic", server_error),
            MockProvider::new("google").with_rule(|_, prompt| {
                is_synthesis(prompt).then(|| server_error("down"))
            }),
        );

        let err = coordinator.run(&request()).await.unwrap_err();
        let UltraError::PipelineExhausted { stage, trace, source } = err else {
            panic!("expected PipelineExhausted");
        };
        assert_eq!(stage, PipelineStage::UltraSynthesis);
        assert_eq!(trace.stages.len(), 3);
        assert!(matches!(source.as_deref(), Some(UltraError::AllFallbacksFailed { .. })));
    }

    #[tokio::test]
    async fn test_failed_revision_carries_stage_one_answer() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::new("anthropic").with_rule(|_, prompt| {
                prompt.contains("Your Original Answer").then(|| server_error("review down"))
            }),
            MockProvider::new("google"),
        );

        let output = coordinator.run(&request()).await.unwrap();
        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();

        assert_eq!(review.carried_forward, vec![B.to_string()]);
        assert_eq!(
            review.output_for(B),
            Some("anthropic:claude-3-opus-20240229 answer")
        );
        assert!(!review.degraded);
        assert_eq!(coordinator.failover().degraded().mode(), OperationMode::Normal);
    }

    #[tokio::test]
    async fn test_degraded_mode_skips_peer_review_calls() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::new("anthropic"),
            MockProvider::new("google"),
        );
        coordinator
            .failover()
            .degraded()
            .mark_degraded("provider:ollama", Severity::Degraded, "circuit open");

        let output = coordinator.run(&request()).await.unwrap();
        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();

        assert!(review.degraded);
        assert!(review.successful_models.is_empty());
        assert_eq!(review.carried_forward.len(), 3);
    }

    #[tokio::test]
    async fn test_every_revision_failing_degrades_feature() {
        let coordinator = coordinator(
            MockProvider::new("openai").with_rule(|_, prompt| {
                prompt.contains("Your Original Answer").then(|| server_error("x"))
            }),
            MockProvider::new("anthropic").with_rule(|_, prompt| {
                prompt.contains("Your Original Answer").then(|| server_error("x"))
            }),
            MockProvider::new("google").with_rule(|_, prompt| {
                prompt.contains("Your Original Answer").then(|| server_error("x"))
            }),
        );

        let output = coordinator.run(&request()).await.unwrap();
        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();

        assert!(review.degraded);
        assert!(coordinator.failover().degraded().is_degraded("peer_review"));
        assert!(!output.final_synthesis.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_deadline_uses_partial_results() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::new("anthropic").with_latency(Duration::from_secs(600)),
            MockProvider::new("google"),
        );

        let output = coordinator.run(&request()).await.unwrap();
        let initial = output.trace.stage(PipelineStage::InitialResponse).unwrap();

        assert_eq!(initial.successful_models, vec![A.to_string(), C.to_string()]);
        match &initial.per_model_output[B] {
            ModelOutput::Error { category, .. } => assert_eq!(*category, ErrorCategory::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_pipeline() {
        let coordinator = coordinator(
            MockProvider::new("openai").with_latency(Duration::from_secs(30)),
            MockProvider::new("anthropic").with_latency(Duration::from_secs(30)),
            MockProvider::new("google").with_latency(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = coordinator
            .run_with_cancel(&request(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_models_are_stage_one_failures() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::new("anthropic"),
            MockProvider::new("google"),
        );
        let request = Request::new("Q", vec![A.to_string(), "mystery-model".to_string()]);

        let output = coordinator.run(&request).await.unwrap();
        let initial = output.trace.stage(PipelineStage::InitialResponse).unwrap();

        match &initial.per_model_output["mystery-model"] {
            ModelOutput::Error { category, .. } => assert_eq!(*category, ErrorCategory::ModelNotFound),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_quick_pattern_skips_review() {
        let coordinator = coordinator(
            MockProvider::new("openai"),
            MockProvider::new("anthropic"),
            MockProvider::new("google"),
        );
        let request = request().with_pattern("quick");

        let output = coordinator.run(&request).await.unwrap();
        let review = output.trace.stage(PipelineStage::PeerReviewRevision).unwrap();
        assert_eq!(review.carried_forward.len(), 3);
        assert!(!review.degraded);
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!("ULTRA".parse::<PipelinePattern>().unwrap(), PipelinePattern::Ultra);
        assert_eq!("".parse::<PipelinePattern>().unwrap(), PipelinePattern::Ultra);
        assert_eq!("quick".parse::<PipelinePattern>().unwrap(), PipelinePattern::Quick);
        assert!("fanciful".parse::<PipelinePattern>().is_err());
    }
}
