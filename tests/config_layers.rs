//! Layered configuration and registry files

use std::fs;

use tempfile::TempDir;

use ultra_orchestrator::ai::ProviderKind;
use ultra_orchestrator::{ConfigLoader, ErrorCategory};

const REGISTRY_YAML: &str = r#"
models:
  - provider: ollama
    model_id: llama3
    capabilities: [chat, local]
    priority: 50
  - provider: ollama
    model_id: qwen2
    capabilities: [chat, code, local]
    priority: 60
equivalences:
  - [ollama/llama3, ollama/qwen2]
"#;

#[test]
fn test_project_layer_and_registry_file() {
    let dir = TempDir::new().unwrap();
    let registry_path = dir.path().join("models.yaml");
    fs::write(&registry_path, REGISTRY_YAML).unwrap();

    let global = dir.path().join("global.toml");
    fs::write(
        &global,
        r#"
[retry]
max_attempts = 5

[pipeline]
max_models = 4
"#,
    )
    .unwrap();

    let project = dir.path().join("project.toml");
    fs::write(
        &project,
        format!(
            r#"
registry_path = "{}"

[retry]
max_attempts = 2

[providers.local]
kind = "ollama"
api_base = "http://127.0.0.1:11434"
requests_per_minute = 30
"#,
            registry_path.display()
        ),
    )
    .unwrap();

    let config = ConfigLoader::load_layers(Some(&global), &project).unwrap();
    assert_eq!(config.retry.max_attempts, 2);
    assert_eq!(config.pipeline.max_models, 4);

    let local = &config.providers["local"];
    assert_eq!(local.kind, ProviderKind::Ollama);
    assert_eq!(local.requests_per_minute, Some(30));

    let registry = config.model_registry().unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(
        registry.map_model("ollama", "llama3", "ollama"),
        Some("llama3".to_string())
    );
    assert_eq!(registry.resolve("qwen2").unwrap().priority, 60);
}

#[test]
fn test_invalid_values_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[fallback_chains]
openai = ["nowhere"]
"#,
    )
    .unwrap();

    let err = ConfigLoader::load_from_file(&path).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Config);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::load_from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_written_default_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    assert!(ConfigLoader::write_default(&path, false).unwrap());
    assert!(!ConfigLoader::write_default(&path, false).unwrap());

    let config = ConfigLoader::load_from_file(&path).unwrap();
    assert!(config.providers.contains_key("openai"));
    assert!(config.validate().is_ok());
}
