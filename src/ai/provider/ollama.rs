//! Ollama Local LLM Provider
//!
//! LLM provider for locally-running Ollama models. No API key; usage counts
//! come from the response's eval counters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{SharedTransport, validate_endpoint};
use super::{
    GenerateOptions, LlmProvider, LlmResponse, ProviderConfig, ProviderKind, ResponseMetadata,
    ResponseTiming, TokenUsage,
};
use crate::types::{ErrorClassifier, Result, UltraError};

const DEFAULT_API_BASE: &str = "http://localhost:11434";

/// Ollama Local LLM Provider
#[derive(Debug)]
pub struct OllamaProvider {
    id: String,
    api_base: String,
    max_tokens: u32,
    temperature: Option<f32>,
    transport: SharedTransport,
}

impl OllamaProvider {
    pub fn new(id: &str, config: &ProviderConfig, transport: SharedTransport) -> Result<Self> {
        let api_base = validate_endpoint(
            id,
            config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE),
        )?;

        if let Ok(url) = url::Url::parse(&api_base)
            && let Some(host) = url.host_str()
            && !matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
        {
            warn!(
                "Ollama endpoint is not localhost: {}. Ensure this is intentional.",
                host
            );
        }

        Ok(Self {
            id: id.to_string(),
            api_base,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            transport,
        })
    }

    fn build_request(&self, prompt: &str, model: &str, options: &GenerateOptions) -> OllamaRequest {
        OllamaRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            system: options.system.clone(),
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature.or(self.temperature),
                num_predict: options.max_tokens.unwrap_or(self.max_tokens),
            },
        }
    }

    /// Ollama reports errors as a flat `{"error": "..."}` body
    fn parse_error(body: &Value) -> (Option<String>, Option<String>) {
        let message = body.get("error").and_then(Value::as_str).map(String::from);
        let code = message
            .as_deref()
            .filter(|m| m.contains("loading"))
            .map(|_| "model_loading".to_string());
        (code, message)
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        info!(provider = %self.id, model, "Generating with Ollama");

        let start_time = Instant::now();
        let url = format!("{}/api/generate", self.api_base);
        let request = self
            .transport
            .client()
            .post(&url)
            .json(&self.build_request(prompt, model, options));

        debug!("Sending request to Ollama API");

        let response: OllamaResponse = self
            .transport
            .send_json(&self.id, model, request, Self::parse_error)
            .await
            .map_err(|e| match e {
                UltraError::Network { provider, message } => UltraError::Network {
                    provider,
                    message: format!("{message}. Is Ollama running? Start with: ollama serve"),
                },
                other => other,
            })?;

        Ok(LlmResponse {
            text: response.response,
            usage: TokenUsage::new(
                response.prompt_eval_count.unwrap_or(0),
                response.eval_count.unwrap_or(0),
            ),
            timing: ResponseTiming::from_duration(start_time.elapsed()),
            metadata: ResponseMetadata {
                provider: self.id.clone(),
                model: response.model.unwrap_or_else(|| model.to_string()),
            },
        })
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.api_base);

        match self.transport.client().get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let tags = resp
                    .json::<OllamaTagsResponse>()
                    .await
                    .map_err(|e| ErrorClassifier::from_reqwest(&self.id, &e, self.transport.timeout()))?;
                let models: Vec<&str> = tags.models.iter().map(|m| m.name.as_str()).collect();
                info!(provider = %self.id, ?models, "Ollama is available");
                Ok(true)
            }
            Ok(resp) => {
                warn!(provider = %self.id, "Ollama API check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!(provider = %self.id, "Ollama not available: {}. Start with: ollama serve", e);
                Ok(false)
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: Option<String>,
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}
