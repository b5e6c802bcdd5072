//! Run Command
//!
//! Send one prompt through the full pipeline.
//!
//! Usage:
//!   ultra run "prompt" [-m gpt-4o -m claude-3-opus-20240229] [--pattern quick] [--json]

use std::io::Read;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::types::{GenerateOptions, ModelOutput, PipelineResult, Request, Result, UltraError};

pub struct RunOptions {
    /// Prompt text; `-` reads stdin
    pub prompt: String,
    pub models: Vec<String>,
    pub pattern: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system: Option<String>,
    pub json: bool,
}

/// Returns whether the pipeline succeeded
pub fn run(config: &Config, options: RunOptions) -> Result<bool> {
    let prompt = read_prompt(&options.prompt)?;
    let ctx = CommandContext::load(config)?;

    let models = if options.models.is_empty() {
        default_models(&ctx.orchestrator)
    } else {
        options.models
    };
    if models.is_empty() {
        return Err(UltraError::Config(
            "No models given and no registered model for any configured provider".to_string(),
        ));
    }

    let mut generate = GenerateOptions::default();
    generate.max_tokens = options.max_tokens;
    generate.temperature = options.temperature;
    generate.system = options.system;

    let mut request = Request::new(prompt, models).with_options(generate);
    if let Some(pattern) = options.pattern {
        request = request.with_pattern(pattern);
    }

    let result = ctx.runtime.block_on(async {
        if let Some(secs) = options.timeout_secs {
            request = request.with_timeout(Duration::from_secs(secs));
        }

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight calls");
                on_interrupt.cancel();
            }
        });

        ctx.orchestrator
            .run_pipeline_with_cancel(request, &cancel)
            .await
    });

    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.success)
}

fn read_prompt(arg: &str) -> Result<String> {
    let prompt = if arg == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        arg.to_string()
    };

    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(UltraError::invalid_request("cli", "Prompt is empty"));
    }
    Ok(prompt)
}

/// Highest-priority registry model of every configured provider
fn default_models(orchestrator: &Orchestrator) -> Vec<String> {
    let failover = orchestrator.failover();
    failover
        .providers()
        .ids()
        .filter_map(|provider| {
            failover
                .registry()
                .models_for(provider)
                .min_by_key(|m| m.priority)
                .map(|m| m.qualified_name())
        })
        .collect()
}

fn print_result(result: &PipelineResult) {
    let out = Output::new();

    if let Some(synthesis) = &result.final_synthesis {
        out.header("Ultra Synthesis");
        println!("{}", synthesis.trim());
    }

    out.section("Stages");
    for (name, stage) in &result.stages {
        let marker = if stage.degraded { " (degraded)" } else { "" };
        out.field(
            name,
            format!(
                "{} ok, {} failed, {} carried forward{} in {}ms",
                stage.successful_models.len(),
                stage.failure_count(),
                stage.carried_forward.len(),
                marker,
                stage.duration_ms
            ),
        );
        for (model, output) in &stage.per_model_output {
            if let ModelOutput::Error { category, message } = output {
                println!("      {} [{}] {}", model, category, message);
            }
        }
    }

    if !result.trace.is_empty() {
        out.section("Fallbacks");
        for event in &result.trace {
            println!(
                "  {}/{} -> {}/{} ({})",
                event.original_provider,
                event.original_model,
                event.fallback_provider,
                event.fallback_model,
                event.reason
            );
        }
    }

    println!();
    if let (Some(lead), Some(served_by)) = (&result.lead_model, &result.served_by) {
        out.field("Lead", lead);
        out.field("Served by", served_by);
    }
    out.field("Mode", out.mode(result.mode));
    out.field("Duration", format!("{}ms", result.duration_ms));

    match &result.error {
        None => out.success("Pipeline complete"),
        Some(error) => out.error(error),
    }
}
