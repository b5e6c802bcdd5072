//! End-to-end pipeline runs over scripted providers

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{Providers, ScriptedProvider, failover_config, manager, models};
use ultra_orchestrator::ai::ProviderKind;
use ultra_orchestrator::{
    ErrorCategory, ModelOutput, OperationMode, Orchestrator, PipelineSettings, PipelineStage,
    Request, TimeoutConfig, UltraError,
};

fn orchestrator(providers: &Providers, threshold: u32, settings: PipelineSettings) -> Orchestrator {
    Orchestrator::with_components(
        manager(providers, failover_config(threshold)),
        settings,
        TimeoutConfig::default(),
    )
}

#[tokio::test]
async fn test_three_models_full_pipeline() {
    let providers = Providers::healthy();
    let orchestrator = orchestrator(&providers, 5, PipelineSettings::default());

    let request = Request::new("What is Raft?", models(&["gpt-4o", "claude-3-opus", "gemini-pro"]));
    let result = orchestrator.run_pipeline(request).await;

    assert!(result.success);
    assert_eq!(result.mode, OperationMode::Normal);
    assert_eq!(result.lead_model.as_deref(), Some("gpt-4o"));
    assert_eq!(result.final_synthesis.as_deref(), Some("openai:gpt-4o answer"));
    assert_eq!(result.stages.len(), 3);

    // initial, revision, synthesis
    assert_eq!(providers.openai.call_count(), 3);
    assert_eq!(providers.anthropic.call_count(), 2);
    assert_eq!(providers.google.call_count(), 2);

    let revision_prompt = &providers.anthropic.prompts()[1];
    assert!(revision_prompt.contains("openai:gpt-4o answer"));
    assert!(revision_prompt.contains("google:gemini-pro answer"));
}

#[tokio::test]
async fn test_fanout_fallback_is_traced() {
    let providers = Providers::with_openai(ScriptedProvider::down("openai", ProviderKind::OpenAi));
    let settings = PipelineSettings {
        fallback_during_fanout: true,
        ..PipelineSettings::default()
    };
    let orchestrator = orchestrator(&providers, 100, settings);

    let request = Request::new("What is Raft?", models(&["gpt-4o", "gemini-pro"]));
    let result = orchestrator.run_pipeline(request).await;

    assert!(result.success, "{:?}", result.error);
    let initial = result.stage(PipelineStage::InitialResponse).unwrap();
    assert_eq!(
        initial.output_for("gpt-4o"),
        Some("anthropic:claude-3-opus answer")
    );

    let first = &result.trace[0];
    assert_eq!(first.original_provider, "openai");
    assert_eq!(first.original_model, "gpt-4o");
    assert_eq!(first.fallback_provider, "anthropic");
    assert_eq!(first.fallback_model, "claude-3-opus");
    assert_eq!(first.reason, ErrorCategory::ServerError);
    assert_eq!(first.stage, Some(PipelineStage::InitialResponse));

    // synthesis lead is gpt-4o; its attempt fails over to the next survivor
    assert_eq!(result.lead_model.as_deref(), Some("gpt-4o"));
    assert_eq!(result.served_by.as_ref().unwrap().provider, "google");
    assert!(
        result
            .trace
            .iter()
            .any(|e| e.stage == Some(PipelineStage::UltraSynthesis))
    );
}

#[tokio::test]
async fn test_open_breaker_degrades_then_recovers() {
    let providers = Providers::with_openai(ScriptedProvider::down("openai", ProviderKind::OpenAi));
    let orchestrator = orchestrator(&providers, 1, PipelineSettings::default());
    let all = models(&["gpt-4o", "claude-3-opus", "gemini-pro"]);

    // First failure opens the breaker and the system degrades mid-run
    let result = orchestrator
        .run_pipeline(Request::new("question", all.clone()))
        .await;
    assert!(result.success);
    assert_eq!(result.mode, OperationMode::Degraded);
    assert_eq!(result.lead_model.as_deref(), Some("claude-3-opus"));
    let review = result.stage(PipelineStage::PeerReviewRevision).unwrap();
    assert!(review.degraded);
    assert_eq!(providers.openai.call_count(), 1);

    // Open breaker short-circuits without touching the provider
    let result = orchestrator
        .run_pipeline(Request::new("question", all.clone()))
        .await;
    assert!(result.success);
    assert_eq!(providers.openai.call_count(), 1);
    let initial = result.stage(PipelineStage::InitialResponse).unwrap();
    match initial.per_model_output.get("gpt-4o") {
        Some(ModelOutput::Error { category, .. }) => {
            assert_eq!(*category, ErrorCategory::CircuitOpen)
        }
        other => panic!("unexpected output: {other:?}"),
    }

    providers.openai.recover();
    let probes = orchestrator.probe_recovery().await;
    assert_eq!(probes.len(), 1);
    assert!(probes[0].healthy);
    assert!(orchestrator.health_report().degraded_components.is_empty());

    let result = orchestrator.run_pipeline(Request::new("question", all)).await;
    assert!(result.success);
    assert_eq!(result.mode, OperationMode::Normal);
    assert!(!result.stage(PipelineStage::PeerReviewRevision).unwrap().degraded);
    assert_eq!(result.lead_model.as_deref(), Some("gpt-4o"));
}

#[tokio::test(start_paused = true)]
async fn test_degraded_review_recovers_on_later_run() {
    let reviews_fail = Arc::new(AtomicBool::new(true));
    let failing = |name: &str, kind: ProviderKind| {
        let reviews_fail = reviews_fail.clone();
        let name_owned = name.to_string();
        ScriptedProvider::new(name, kind).rule(move |_, prompt| {
            (reviews_fail.load(Ordering::SeqCst) && prompt.contains("revised, complete answer"))
                .then(|| UltraError::server(name_owned.as_str(), "review failed"))
        })
    };
    let providers = Providers {
        openai: failing("openai", ProviderKind::OpenAi).into(),
        anthropic: failing("anthropic", ProviderKind::Anthropic).into(),
        google: ScriptedProvider::new("google", ProviderKind::Google).into(),
    };
    let orchestrator = orchestrator(&providers, 5, PipelineSettings::default());
    let all = models(&["gpt-4o", "claude-3-opus"]);

    let result = orchestrator
        .run_pipeline(Request::new("question", all.clone()))
        .await;
    assert!(result.success);
    assert_eq!(result.mode, OperationMode::Degraded);
    assert!(result.stage(PipelineStage::PeerReviewRevision).unwrap().degraded);

    reviews_fail.store(false, Ordering::SeqCst);

    // Still inside the cool-down: no review calls are made
    let result = orchestrator
        .run_pipeline(Request::new("question", all.clone()))
        .await;
    assert!(result.stage(PipelineStage::PeerReviewRevision).unwrap().degraded);
    assert_eq!(providers.anthropic.call_count(), 3);

    tokio::time::advance(Duration::from_secs(61)).await;

    let result = orchestrator.run_pipeline(Request::new("question", all)).await;
    assert!(result.success);
    assert_eq!(result.mode, OperationMode::Normal);
    let review = result.stage(PipelineStage::PeerReviewRevision).unwrap();
    assert!(!review.degraded);
    assert_eq!(review.successful_models.len(), 2);
    assert!(orchestrator.health_report().degraded_components.is_empty());
}

#[tokio::test]
async fn test_everything_down_reports_exhaustion() {
    let providers = Providers {
        openai: ScriptedProvider::down("openai", ProviderKind::OpenAi).into(),
        anthropic: ScriptedProvider::down("anthropic", ProviderKind::Anthropic).into(),
        google: ScriptedProvider::down("google", ProviderKind::Google).into(),
    };
    let orchestrator = orchestrator(&providers, 100, PipelineSettings::default());

    let result = orchestrator
        .run_pipeline(Request::new("question", models(&["gpt-4o", "gemini-pro"])))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::PipelineExhausted));
    assert!(result.final_synthesis.is_none());
    let initial = result.stage(PipelineStage::InitialResponse).unwrap();
    assert_eq!(initial.failure_count(), 2);
    assert!(result.stage(PipelineStage::UltraSynthesis).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_slow_model_dropped_at_stage_deadline() {
    let slow = ScriptedProvider::new("openai", ProviderKind::OpenAi).latency(Duration::from_secs(30));
    let providers = Providers::with_openai(slow);
    let timeouts = TimeoutConfig {
        stage: Duration::from_secs(5),
        ..TimeoutConfig::default()
    };
    let orchestrator = Orchestrator::with_components(
        manager(&providers, failover_config(100)),
        PipelineSettings::default(),
        timeouts,
    );

    let result = orchestrator
        .run_pipeline(Request::new(
            "question",
            models(&["gpt-4o", "claude-3-opus", "gemini-pro"]),
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    let initial = result.stage(PipelineStage::InitialResponse).unwrap();
    match initial.per_model_output.get("gpt-4o") {
        Some(ModelOutput::Error { category, .. }) => assert_eq!(*category, ErrorCategory::Timeout),
        other => panic!("unexpected output: {other:?}"),
    }
    assert_eq!(result.lead_model.as_deref(), Some("claude-3-opus"));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let providers = Providers::healthy();
    let orchestrator = orchestrator(&providers, 5, PipelineSettings::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = orchestrator
        .run_pipeline_with_cancel(Request::new("question", models(&["gpt-4o", "gemini-pro"])), &cancel)
        .await;

    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_review_keeps_initial_stage() {
    let slow_review = ScriptedProvider::new("openai", ProviderKind::OpenAi)
        .latency_when("revised, complete answer", Duration::from_secs(30));
    let providers = Providers::with_openai(slow_review);
    let orchestrator = orchestrator(&providers, 5, PipelineSettings::default());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let result = orchestrator
        .run_pipeline_with_cancel(
            Request::new("question", models(&["gpt-4o", "claude-3-opus"])),
            &cancel,
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::Cancelled));
    assert!(result.final_synthesis.is_none());

    let initial = result.stage(PipelineStage::InitialResponse).unwrap();
    assert_eq!(initial.successful_models.len(), 2);
    assert_eq!(initial.output_for("gpt-4o"), Some("openai:gpt-4o answer"));
    assert!(result.stage(PipelineStage::PeerReviewRevision).is_none());

    // Cancellation is not a feature failure
    assert!(orchestrator.health_report().degraded_components.is_empty());
}

#[tokio::test]
async fn test_quick_pattern_and_metrics() {
    let providers = Providers::healthy();
    let orchestrator = orchestrator(&providers, 5, PipelineSettings::default());

    let request = Request::new("question", models(&["gpt-4o", "claude-3-opus"])).with_pattern("quick");
    let result = orchestrator.run_pipeline(request).await;

    assert!(result.success);
    assert_eq!(providers.anthropic.call_count(), 1);
    let review = result.stage(PipelineStage::PeerReviewRevision).unwrap();
    assert_eq!(review.carried_forward.len(), 2);

    let summary = orchestrator.failover().metrics().summary();
    assert_eq!(summary.pipelines_started, 1);
    assert_eq!(summary.pipelines_succeeded, 1);
}
