//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use ultra_orchestrator::ai::{
    Capability, CircuitBreakerConfig, FailoverConfig, FailoverManager, LlmProvider, LlmResponse,
    ModelDefinition, ModelRegistry, ProviderKind, ProviderRegistry, RetryPolicy, TokenUsage,
};
use ultra_orchestrator::{GenerateOptions, Result, UltraError};

type Rule = Box<dyn Fn(&str, &str) -> Option<UltraError> + Send + Sync>;

/// In-process provider answering `"<name>:<model> answer"` unless a rule
/// matches the `(model, prompt)` pair
pub struct ScriptedProvider {
    name: String,
    kind: ProviderKind,
    rules: Vec<Rule>,
    latency: Option<Duration>,
    slow_prompts: Option<(String, Duration)>,
    down: AtomicBool,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, kind: ProviderKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rules: Vec::new(),
            latency: None,
            slow_prompts: None,
            down: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with a 500 until [`ScriptedProvider::recover`]
    pub fn down(name: &str, kind: ProviderKind) -> Self {
        let provider = Self::new(name, kind);
        provider.down.store(true, Ordering::SeqCst);
        provider
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn rule(
        mut self,
        rule: impl Fn(&str, &str) -> Option<UltraError> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay only calls whose prompt contains `needle`
    pub fn latency_when(mut self, needle: &str, latency: Duration) -> Self {
        self.slow_prompts = Some((needle.to_string(), latency));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        _options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), prompt.to_string()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some((needle, latency)) = &self.slow_prompts
            && prompt.contains(needle.as_str())
        {
            tokio::time::sleep(*latency).await;
        }

        if self.down.load(Ordering::SeqCst) {
            return Err(UltraError::server(&self.name, "boom"));
        }
        if let Some(err) = self.rules.iter().find_map(|rule| rule(model, prompt)) {
            return Err(err);
        }

        let mut response =
            LlmResponse::text_only(format!("{}:{} answer", self.name, model), &self.name, model);
        response.usage = TokenUsage::new(10, 20);
        Ok(response)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.down.load(Ordering::SeqCst))
    }
}

/// One model per provider with an explicit equivalence group
pub fn registry() -> ModelRegistry {
    use Capability::*;

    ModelRegistry::new(
        vec![
            ModelDefinition::new("openai", "gpt-4o", [Chat, Reasoning, Code, Vision])
                .with_priority(10),
            ModelDefinition::new("anthropic", "claude-3-opus", [Chat, Reasoning, Code, Vision])
                .with_priority(20),
            ModelDefinition::new("google", "gemini-pro", [Chat, Reasoning, Vision])
                .with_priority(30),
        ],
        vec![vec![
            "openai/gpt-4o".to_string(),
            "anthropic/claude-3-opus".to_string(),
            "google/gemini-pro".to_string(),
        ]],
    )
    .unwrap()
}

pub struct Providers {
    pub openai: Arc<ScriptedProvider>,
    pub anthropic: Arc<ScriptedProvider>,
    pub google: Arc<ScriptedProvider>,
}

impl Providers {
    pub fn healthy() -> Self {
        Self::with_openai(ScriptedProvider::new("openai", ProviderKind::OpenAi))
    }

    /// Healthy anthropic and google around a custom openai
    pub fn with_openai(openai: ScriptedProvider) -> Self {
        Self {
            openai: Arc::new(openai),
            anthropic: Arc::new(ScriptedProvider::new("anthropic", ProviderKind::Anthropic)),
            google: Arc::new(ScriptedProvider::new("google", ProviderKind::Google)),
        }
    }

    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new()
            .with(self.openai.clone())
            .with(self.anthropic.clone())
            .with(self.google.clone())
    }
}

/// No retries, breaker opening after `failure_threshold` failures
pub fn failover_config(failure_threshold: u32) -> FailoverConfig {
    FailoverConfig::default()
        .with_retry(RetryPolicy::none())
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold,
            ..CircuitBreakerConfig::default()
        })
        .with_chain("openai", &["anthropic", "google"])
        .with_chain("anthropic", &["openai", "google"])
        .with_chain("google", &["openai", "anthropic"])
}

pub fn manager(providers: &Providers, config: FailoverConfig) -> FailoverManager {
    FailoverManager::new(providers.registry(), Arc::new(registry()), config)
}

pub fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
