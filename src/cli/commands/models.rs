//! Models Command
//!
//! List the model registry and show cross-provider mappings.
//!
//! Usage:
//!   ultra models [--provider openai] [--json]
//!   ultra models --map gpt-4o

use crate::ai::registry::ModelRegistry;
use crate::cli::ui::Output;
use crate::config::Config;
use crate::types::{Result, UltraError};

pub fn run(config: &Config, provider: Option<&str>, map: Option<&str>, json: bool) -> Result<()> {
    let registry = config.model_registry()?;

    match map {
        Some(name) => show_mapping(&registry, name, json),
        None => list(&registry, provider, json),
    }
}

fn list(registry: &ModelRegistry, provider: Option<&str>, json: bool) -> Result<()> {
    let models: Vec<_> = registry
        .models()
        .iter()
        .filter(|m| provider.is_none_or(|p| m.provider == p))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    let out = Output::new();
    out.header(&format!("Model Registry ({} models)", models.len()));
    for model in models {
        let capabilities: Vec<String> = model.capabilities.iter().map(|c| c.to_string()).collect();
        println!(
            "  {:<42} prio {:>3}  ctx {:>8}  ${:<7.4} {}{}",
            model.qualified_name(),
            model.priority,
            model.context_window,
            model.cost_per_1k,
            capabilities.join(","),
            if model.is_thinking_model { " [thinking]" } else { "" }
        );
    }

    if !registry.equivalences().is_empty() {
        out.section("Equivalence groups");
        for group in registry.equivalences() {
            println!("  {}", group.join(" = "));
        }
    }
    Ok(())
}

fn show_mapping(registry: &ModelRegistry, name: &str, json: bool) -> Result<()> {
    let source = registry.resolve(name).ok_or_else(|| UltraError::ModelNotFound {
        provider: "registry".to_string(),
        model: name.to_string(),
    })?;

    let mappings: Vec<(String, Option<String>)> = registry
        .providers()
        .into_iter()
        .map(|target| {
            (
                target.to_string(),
                registry.map_model(&source.provider, &source.model_id, target),
            )
        })
        .collect();

    if json {
        let value: serde_json::Map<String, serde_json::Value> = mappings
            .into_iter()
            .map(|(provider, model)| (provider, model.map_or(serde_json::Value::Null, Into::into)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let out = Output::new();
    out.header(&format!("Mapping for {}", source.qualified_name()));
    for (provider, model) in mappings {
        out.field(&provider, model.as_deref().unwrap_or("(no equivalent)"));
    }
    Ok(())
}
