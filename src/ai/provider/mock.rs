//! Scripted in-process provider for unit tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{GenerateOptions, LlmProvider, LlmResponse, ProviderKind, TokenUsage};
use crate::types::{Result, UltraError};

type FailureRule = Box<dyn Fn(&str, &str) -> Option<UltraError> + Send + Sync>;

/// Answers `"<name>:<model> answer"` unless a failure rule matches the
/// `(model, prompt)` pair
pub(crate) struct MockProvider {
    name: String,
    rules: Vec<FailureRule>,
    latency: Option<Duration>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockProvider {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails with the error built by `make`
    pub(crate) fn failing(name: &str, make: fn(&str) -> UltraError) -> Self {
        Self::new(name).with_rule(move |_, _| Some(make("mock failure")))
    }

    /// First `times` calls fail, later ones succeed
    pub(crate) fn flaky(name: &str, times: u32, make: fn(&str) -> UltraError) -> Self {
        let remaining = AtomicU32::new(times);
        Self::new(name).with_rule(move |_, _| {
            remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .ok()
                .map(|_| make("transient mock failure"))
        })
    }

    pub(crate) fn with_rule(
        mut self,
        rule: impl Fn(&str, &str) -> Option<UltraError> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
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

        if let Some(err) = self.rules.iter().find_map(|rule| rule(model, prompt)) {
            return Err(err);
        }

        let mut response =
            LlmResponse::text_only(format!("{}:{} answer", self.name, model), &self.name, model);
        response.usage = TokenUsage::new(10, 5);
        Ok(response)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.rules.iter().all(|rule| rule("", "health").is_none()))
    }
}

pub(crate) fn server_error(message: &str) -> UltraError {
    UltraError::server("mock", message)
}

pub(crate) fn auth_error(message: &str) -> UltraError {
    UltraError::AuthenticationFailed {
        provider: "mock".to_string(),
        message: message.to_string(),
    }
}
