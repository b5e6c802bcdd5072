//! Health Command
//!
//! Probe every configured provider and print breaker state and mode.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::config::Config;
use crate::types::Result;

/// Returns whether every probe passed
pub fn run(config: &Config, json: bool) -> Result<bool> {
    let ctx = CommandContext::load(config)?;
    let probes = ctx.runtime.block_on(ctx.orchestrator.probe_all());
    let report = ctx.orchestrator.health_report();
    let all_healthy = probes.iter().all(|p| p.healthy);

    if json {
        let value = serde_json::json!({
            "healthy": all_healthy,
            "probes": probes,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(all_healthy);
    }

    let out = Output::new();
    out.header("Provider Health");
    for probe in &probes {
        match &probe.error {
            None if probe.healthy => out.success(&probe.provider),
            None => out.warning(&format!("{}: unhealthy", probe.provider)),
            Some(err) => out.error(&format!("{}: {}", probe.provider, err)),
        }
    }

    out.section("Circuit Breakers");
    for provider in &report.providers {
        out.field(
            &provider.health.provider,
            format!(
                "{} (failures {}, success rate {:.0}%)",
                out.circuit(provider.health.circuit_state),
                provider.health.consecutive_failures,
                provider.health.success_rate * 100.0
            ),
        );
    }

    println!();
    out.field("Mode", out.mode(report.mode));
    if !report.degraded_components.is_empty() {
        out.field("Degraded", report.degraded_components.join(", "));
    }
    Ok(all_healthy)
}
