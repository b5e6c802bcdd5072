//! OpenAI API Provider
//!
//! LLM provider using OpenAI's Chat Completions API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{SharedTransport, error_field, validate_endpoint};
use super::{
    GenerateOptions, LlmProvider, LlmResponse, ProviderConfig, ProviderKind, ResponseMetadata,
    ResponseTiming, TokenUsage,
};
use crate::types::{Result, UltraError};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI API Provider with secure API key handling
pub struct OpenAiProvider {
    id: String,
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    max_tokens: u32,
    temperature: Option<f32>,
    transport: SharedTransport,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("id", &self.id)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(id: &str, config: &ProviderConfig, transport: SharedTransport) -> Result<Self> {
        let api_key = config.require_api_key(id)?;
        let api_base = validate_endpoint(
            id,
            config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE),
        )?;

        Ok(Self {
            id: id.to_string(),
            api_key,
            api_base,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            transport,
        })
    }

    fn build_request(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerateOptions,
    ) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: options.temperature.or(self.temperature),
            max_tokens: Some(options.max_tokens.unwrap_or(self.max_tokens)),
        }
    }

    fn parse_error(body: &Value) -> (Option<String>, Option<String>) {
        (
            error_field(body, "code").or_else(|| error_field(body, "type")),
            error_field(body, "message"),
        )
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        info!(provider = %self.id, model, "Generating with OpenAI");

        let start_time = Instant::now();
        let body = self.build_request(prompt, model, options);
        let url = format!("{}/chat/completions", self.api_base);

        debug!("Sending request to OpenAI API");

        let request = self
            .transport
            .client()
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&body);

        let response: ChatCompletionResponse = self
            .transport
            .send_json(&self.id, model, request, Self::parse_error)
            .await?;

        let elapsed = start_time.elapsed();

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| UltraError::server(&self.id, "No content in OpenAI response"))?;

        Ok(LlmResponse {
            text,
            usage,
            timing: ResponseTiming::from_duration(elapsed),
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
        ProviderKind::OpenAi
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.api_base);

        let response = self
            .transport
            .client()
            .get(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(provider = %self.id, "OpenAI API is available");
                Ok(true)
            }
            Ok(resp) => {
                warn!(provider = %self.id, "OpenAI API check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!(provider = %self.id, "OpenAI API check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}
