//! Google Gemini API Provider
//!
//! Uses the `generateContent` endpoint of the Generative Language API.

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

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    id: String,
    api_key: SecretString,
    api_base: String,
    max_tokens: u32,
    temperature: Option<f32>,
    transport: SharedTransport,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("id", &self.id)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl GeminiProvider {
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

    fn build_request(&self, prompt: &str, options: &GenerateOptions) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(prompt.to_string()),
                }],
            }],
            system_instruction: options.system.as_ref().map(|system| Content {
                role: None,
                parts: vec![Part {
                    text: Some(system.clone()),
                }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: options.max_tokens.unwrap_or(self.max_tokens),
                temperature: options.temperature.or(self.temperature),
            },
        }
    }

    fn parse_error(body: &Value) -> (Option<String>, Option<String>) {
        (error_field(body, "status"), error_field(body, "message"))
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        info!(provider = %self.id, model, "Generating with Gemini");

        let start_time = Instant::now();
        let url = format!("{}/v1beta/models/{}:generateContent", self.api_base, model);
        let request = self
            .transport
            .client()
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&self.build_request(prompt, options));

        debug!("Sending request to Gemini API");

        let response: GenerateContentResponse = self
            .transport
            .send_json(&self.id, model, request, Self::parse_error)
            .await?;

        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            let reason = response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates".to_string());
            UltraError::invalid_request(&self.id, format!("Gemini returned no output: {reason}"))
        })?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(UltraError::server(&self.id, "No text content in Gemini response"));
        }

        let usage = response
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(LlmResponse {
            text,
            usage,
            timing: ResponseTiming::from_duration(start_time.elapsed()),
            metadata: ResponseMetadata {
                provider: self.id.clone(),
                model: model.to_string(),
            },
        })
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1beta/models", self.api_base);

        let response = self
            .transport
            .client()
            .get(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(provider = %self.id, "Gemini API is available");
                Ok(true)
            }
            Ok(resp) => {
                warn!(provider = %self.id, "Gemini API check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!(provider = %self.id, "Gemini API check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
