//! Anthropic Messages API Provider

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

const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const HEALTH_CHECK_MODEL: &str = "claude-3-haiku-20240307";

pub struct AnthropicProvider {
    id: String,
    api_key: SecretString,
    api_base: String,
    max_tokens: u32,
    temperature: Option<f32>,
    transport: SharedTransport,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("id", &self.id)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl AnthropicProvider {
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

    fn build_request(&self, prompt: &str, model: &str, options: &GenerateOptions) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            // max_tokens is mandatory on this API
            max_tokens: options.max_tokens.unwrap_or(self.max_tokens),
            system: options.system.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: options.temperature.or(self.temperature),
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        self.transport
            .client()
            .post(url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
    }

    fn parse_error(body: &Value) -> (Option<String>, Option<String>) {
        (error_field(body, "type"), error_field(body, "message"))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        info!(provider = %self.id, model, "Generating with Anthropic");

        let start_time = Instant::now();
        let url = format!("{}/v1/messages", self.api_base);
        let request = self
            .request(&url)
            .json(&self.build_request(prompt, model, options));

        debug!("Sending request to Anthropic API");

        let response: MessagesResponse = self
            .transport
            .send_json(&self.id, model, request, Self::parse_error)
            .await?;

        let text = response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(UltraError::server(&self.id, "No text content in Anthropic response"));
        }

        Ok(LlmResponse {
            text,
            usage: TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens),
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
        ProviderKind::Anthropic
    }

    /// Anthropic has no free listing endpoint; probe with a one-token message
    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1/messages", self.api_base);
        let probe = MessagesRequest {
            model: HEALTH_CHECK_MODEL.to_string(),
            max_tokens: 1,
            system: None,
            messages: vec![Message {
                role: "user".to_string(),
                content: "ping".to_string(),
            }],
            temperature: None,
        };

        match self.request(&url).json(&probe).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(provider = %self.id, "Anthropic API is available");
                Ok(true)
            }
            Ok(resp) => {
                warn!(provider = %self.id, "Anthropic API check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!(provider = %self.id, "Anthropic API check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}
