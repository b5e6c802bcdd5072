//! Pipeline data model
//!
//! Records created and consumed by the pipeline coordinator: the incoming
//! [`Request`], one [`StageResult`] per stage, the append-only
//! [`FallbackEvent`] audit trail and the caller-facing [`PipelineResult`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::ai::degraded::OperationMode;
use crate::constants::pipeline as pipeline_constants;
use crate::types::error::{ErrorCategory, UltraError};

// =============================================================================
// Stage
// =============================================================================

/// Linear stage machine: no branching back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    InitialResponse,
    PeerReviewRevision,
    UltraSynthesis,
    Done,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitialResponse => "initial_response",
            Self::PeerReviewRevision => "peer_review_revision",
            Self::UltraSynthesis => "ultra_synthesis",
            Self::Done => "done",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::InitialResponse => Some(Self::PeerReviewRevision),
            Self::PeerReviewRevision => Some(Self::UltraSynthesis),
            Self::UltraSynthesis => Some(Self::Done),
            Self::Done => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Model Target
// =============================================================================

/// A concrete (provider, model) pair a call is issued against
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

// =============================================================================
// Request
// =============================================================================

/// Per-call generation options passed through to adapters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// System instruction, mapped to each provider's native field
    pub system: Option<String>,
    /// Opaque caller options; not interpreted by the engine
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl GenerateOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// One incoming query. Immutable once handed to the coordinator.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub prompt: String,
    /// Model ids, optionally qualified as `provider/model`
    pub requested_models: Vec<String>,
    pub pattern: String,
    pub options: GenerateOptions,
    /// Absolute deadline for the whole pipeline
    pub deadline: Option<Instant>,
}

impl Request {
    pub fn new(prompt: impl Into<String>, requested_models: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            requested_models,
            pattern: pipeline_constants::DEFAULT_PATTERN.to_string(),
            options: GenerateOptions::default(),
            deadline: None,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

// =============================================================================
// Stage Result
// =============================================================================

/// Outcome of one model within a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelOutput {
    Text {
        text: String,
    },
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl ModelOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn from_error(err: &UltraError) -> Self {
        Self::Error {
            category: err.category(),
            message: err.to_string(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Error { .. } => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Text { .. })
    }
}

/// Aggregated result of one stage. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: PipelineStage,
    pub per_model_output: BTreeMap<String, ModelOutput>,
    /// Models whose call in this stage succeeded, in request order
    pub successful_models: Vec<String>,
    /// Models whose previous-stage output was carried forward unchanged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carried_forward: Vec<String>,
    /// Stage ran on its degraded path
    #[serde(default)]
    pub degraded: bool,
    pub duration_ms: u64,
}

impl StageResult {
    /// Number of models that errored in this stage
    pub fn failure_count(&self) -> usize {
        self.per_model_output.values().filter(|o| !o.is_ok()).count()
    }

    /// Usable text for a model: its own output or the carried-forward one
    pub fn output_for(&self, model: &str) -> Option<&str> {
        self.per_model_output.get(model).and_then(ModelOutput::as_text)
    }

    /// Models with usable output (successful first, then carried forward)
    pub fn surviving_models(&self) -> Vec<String> {
        self.successful_models
            .iter()
            .chain(self.carried_forward.iter())
            .cloned()
            .collect()
    }

    pub fn has_survivors(&self) -> bool {
        !self.successful_models.is_empty() || !self.carried_forward.is_empty()
    }
}

// =============================================================================
// Trace
// =============================================================================

/// Append-only record of one fallback attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEvent {
    pub original_provider: String,
    pub original_model: String,
    pub fallback_provider: String,
    pub fallback_model: String,
    /// Category of the error that caused the walk to advance
    pub reason: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
}

impl FallbackEvent {
    pub fn new(original: &ModelTarget, fallback: &ModelTarget, reason: ErrorCategory) -> Self {
        Self {
            original_provider: original.provider.clone(),
            original_model: original.model.clone(),
            fallback_provider: fallback.provider.clone(),
            fallback_model: fallback.model.clone(),
            reason,
            timestamp: Utc::now(),
            stage: None,
        }
    }

    pub fn in_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }
}

/// Everything a request produced so far, in order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineTrace {
    pub stages: Vec<StageResult>,
    pub fallback_events: Vec<FallbackEvent>,
}

impl PipelineTrace {
    pub fn record_stage(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    pub fn record_fallbacks(&mut self, stage: PipelineStage, events: Vec<FallbackEvent>) {
        self.fallback_events
            .extend(events.into_iter().map(|e| e.in_stage(stage)));
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Model failures recorded across all stages
    pub fn failure_count(&self) -> usize {
        self.stages.iter().map(StageResult::failure_count).sum()
    }
}

// =============================================================================
// Results
// =============================================================================

/// Successful coordinator output
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub final_synthesis: String,
    /// Model selected to lead synthesis
    pub lead_model: String,
    /// Target that actually produced the synthesis
    pub served_by: ModelTarget,
    pub trace: PipelineTrace,
}

/// Caller-facing record. Always returned, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub request_id: Uuid,
    pub success: bool,
    pub stages: BTreeMap<String, StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_synthesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<ModelTarget>,
    pub trace: Vec<FallbackEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    pub mode: OperationMode,
    pub duration_ms: u64,
}

fn stage_map(stages: Vec<StageResult>) -> BTreeMap<String, StageResult> {
    stages
        .into_iter()
        .map(|s| (s.stage.as_str().to_string(), s))
        .collect()
}

impl PipelineResult {
    pub fn from_output(
        request_id: Uuid,
        output: PipelineOutput,
        mode: OperationMode,
        duration: Duration,
    ) -> Self {
        Self {
            request_id,
            success: true,
            stages: stage_map(output.trace.stages),
            final_synthesis: Some(output.final_synthesis),
            lead_model: Some(output.lead_model),
            served_by: Some(output.served_by),
            trace: output.trace.fallback_events,
            error: None,
            error_category: None,
            mode,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Failure result keeping whatever stages completed
    pub fn from_error(
        request_id: Uuid,
        err: UltraError,
        mode: OperationMode,
        duration: Duration,
    ) -> Self {
        let category = err.category();
        let error = err.to_string();
        let trace = match err {
            UltraError::PipelineExhausted { trace, .. }
            | UltraError::Cancelled {
                trace: Some(trace), ..
            } => *trace,
            _ => PipelineTrace::default(),
        };

        Self {
            request_id,
            success: false,
            stages: stage_map(trace.stages),
            final_synthesis: None,
            lead_model: None,
            served_by: None,
            trace: trace.fallback_events,
            error: Some(error),
            error_category: Some(category),
            mode,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageResult> {
        self.stages.get(stage.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(stage: PipelineStage, outputs: &[(&str, bool)]) -> StageResult {
        let mut per_model_output = BTreeMap::new();
        let mut successful_models = Vec::new();
        for (model, ok) in outputs {
            if *ok {
                per_model_output.insert(model.to_string(), ModelOutput::text(format!("{model} says hi")));
                successful_models.push(model.to_string());
            } else {
                per_model_output.insert(
                    model.to_string(),
                    ModelOutput::Error {
                        category: ErrorCategory::ServerError,
                        message: "boom".into(),
                    },
                );
            }
        }
        StageResult {
            stage,
            per_model_output,
            successful_models,
            carried_forward: Vec::new(),
            degraded: false,
            duration_ms: 5,
        }
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(
            PipelineStage::InitialResponse.next(),
            Some(PipelineStage::PeerReviewRevision)
        );
        assert_eq!(
            PipelineStage::UltraSynthesis.next(),
            Some(PipelineStage::Done)
        );
        assert_eq!(PipelineStage::Done.next(), None);
        assert!(PipelineStage::InitialResponse < PipelineStage::UltraSynthesis);
    }

    #[test]
    fn test_stage_result_counts() {
        let result = stage(
            PipelineStage::InitialResponse,
            &[("a", true), ("b", false), ("c", true)],
        );
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.successful_models, vec!["a", "c"]);
        assert_eq!(result.output_for("a"), Some("a says hi"));
        assert_eq!(result.output_for("b"), None);
    }

    #[test]
    fn test_result_from_exhausted_error_keeps_trace() {
        let mut trace = PipelineTrace::default();
        trace.record_stage(stage(PipelineStage::InitialResponse, &[("a", false)]));

        let err = UltraError::PipelineExhausted {
            stage: PipelineStage::InitialResponse,
            trace: Box::new(trace),
            source: None,
        };
        let result = PipelineResult::from_error(
            Uuid::new_v4(),
            err,
            OperationMode::Normal,
            Duration::from_millis(12),
        );

        assert!(!result.success);
        assert_eq!(result.error_category, Some(ErrorCategory::PipelineExhausted));
        assert!(result.error.as_deref().unwrap_or_default().contains("initial_response"));
        assert!(result.stage(PipelineStage::InitialResponse).is_some());
        assert!(result.final_synthesis.is_none());
    }

    #[test]
    fn test_result_from_cancel_keeps_completed_stages() {
        let mut trace = PipelineTrace::default();
        trace.record_stage(stage(PipelineStage::InitialResponse, &[("a", true), ("b", true)]));

        let err = UltraError::cancelled("stage peer_review_revision").with_trace(trace);
        let result = PipelineResult::from_error(
            Uuid::new_v4(),
            err,
            OperationMode::Normal,
            Duration::from_millis(5),
        );

        assert_eq!(result.error_category, Some(ErrorCategory::Cancelled));
        let initial = result.stage(PipelineStage::InitialResponse).unwrap();
        assert_eq!(initial.successful_models, vec!["a", "b"]);
    }

    #[test]
    fn test_fallback_events_tagged_with_stage() {
        let mut trace = PipelineTrace::default();
        let event = FallbackEvent::new(
            &ModelTarget::new("openai", "gpt-4o"),
            &ModelTarget::new("anthropic", "claude-3-opus-20240229"),
            ErrorCategory::ServerError,
        );
        trace.record_fallbacks(PipelineStage::UltraSynthesis, vec![event]);

        assert_eq!(trace.fallback_events.len(), 1);
        assert_eq!(
            trace.fallback_events[0].stage,
            Some(PipelineStage::UltraSynthesis)
        );
    }

    #[test]
    fn test_model_output_serialization() {
        let json = serde_json::to_value(ModelOutput::text("hello")).unwrap_or_default();
        assert_eq!(json["status"], "text");
        assert_eq!(json["text"], "hello");
    }
}
