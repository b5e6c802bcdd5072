//! LLM Provider Abstraction
//!
//! Defines the LlmProvider trait implemented once per backend. Every adapter
//! normalizes its wire protocol and error bodies, so callers only see
//! `LlmResponse` or an `UltraError` from the closed taxonomy.
//!
//! ## Modules
//!
//! - `transport`: Shared connection-pooled HTTP client injected into adapters
//! - `rate_limiter`: Per-provider token bucket gate
//! - `circuit_breaker`: Circuit breaker pattern for provider resilience
//! - `failover`: Primary + fallback chain execution with capability mapping

mod anthropic;
mod circuit_breaker;
mod failover;
mod gemini;
#[cfg(test)]
pub(crate) mod mock;
mod ollama;
mod openai;
mod rate_limiter;
mod transport;

pub use anthropic::AnthropicProvider;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitTransition, ProviderHealth,
};
pub use failover::{FailoverConfig, FailoverManager, FailoverOutcome, provider_component};
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use rate_limiter::{RateLimiter, RateLimiterRegistry};
pub use transport::{ErrorBodyParser, SharedTransport};

// Re-export error types from centralized location
pub use crate::types::{ErrorCategory, ErrorClassifier, GenerateOptions};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::constants::network;
use crate::types::{Result, UltraError};

// =============================================================================
// LLM Response with Usage Metrics
// =============================================================================

/// Normalized completion returned by every adapter
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub timing: ResponseTiming,
    pub metadata: ResponseMetadata,
}

impl LlmResponse {
    /// Create response with text only (usage unknown)
    pub fn text_only(text: impl Into<String>, provider: &str, model: &str) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
            timing: ResponseTiming::default(),
            metadata: ResponseMetadata {
                provider: provider.to_string(),
                model: model.to_string(),
            },
        }
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Response timing metrics
#[derive(Debug, Clone, Default)]
pub struct ResponseTiming {
    /// Wall clock time of the HTTP exchange
    pub total_ms: u64,
}

impl ResponseTiming {
    pub fn from_duration(duration: std::time::Duration) -> Self {
        Self {
            total_ms: duration.as_millis() as u64,
        }
    }
}

/// Response metadata
#[derive(Debug, Clone, Default)]
pub struct ResponseMetadata {
    pub provider: String,
    pub model: String,
}

// =============================================================================
// Provider Kind & Configuration
// =============================================================================

/// Wire protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Ollama => "ollama",
        }
    }

    /// Environment variable consulted when no key is configured
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Google => Some("GOOGLE_API_KEY"),
            Self::Ollama => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.default_api_key_env().is_some()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one provider entry
///
/// Note: API keys are handled securely - they are never serialized to output
/// and are redacted in debug output. Adapters hold them as SecretString.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Never serialized to output for security
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the key (overrides the kind default)
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Local rate limit; unlimited when unset
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    network::DEFAULT_MAX_TOKENS
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("api_base", &self.api_base)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("burst", &self.burst)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            enabled: true,
            api_key: None,
            api_key_env: None,
            api_base: None,
            requests_per_minute: None,
            burst: None,
            max_tokens: network::DEFAULT_MAX_TOKENS,
            temperature: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = Some(base.into());
        self
    }

    pub fn with_rate_limit(mut self, requests_per_minute: u32, burst: u32) -> Self {
        self.requests_per_minute = Some(requests_per_minute);
        self.burst = Some(burst);
        self
    }

    /// Configured key, falling back to the environment
    pub fn resolve_api_key(&self) -> Option<SecretString> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(SecretString::from(key.clone()));
        }

        let env_name = self
            .api_key_env
            .as_deref()
            .or_else(|| self.kind.default_api_key_env())?;

        std::env::var(env_name)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from)
    }

    pub(crate) fn require_api_key(&self, id: &str) -> Result<SecretString> {
        self.resolve_api_key().ok_or_else(|| {
            let env_name = self
                .api_key_env
                .as_deref()
                .or_else(|| self.kind.default_api_key_env())
                .unwrap_or("api_key");
            UltraError::Config(format!(
                "API key for provider '{}' not found. Set {} or provide api_key in config",
                id, env_name
            ))
        })
    }
}

// =============================================================================
// LLM Provider Trait
// =============================================================================

/// Uniform call surface implemented by every backend adapter
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion for `prompt` on `model`.
    ///
    /// Errors are already normalized into the closed taxonomy.
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse>;

    /// Provider id used for registry lookups and logging
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Check if the provider is reachable and the key is accepted
    async fn health_check(&self) -> Result<bool>;
}

/// Shared LLM provider type for concurrent access across pipeline stages.
pub type SharedProvider = Arc<dyn LlmProvider>;

/// Create a shared provider from configuration, injecting the shared transport
pub fn create_provider(
    id: &str,
    config: &ProviderConfig,
    transport: &SharedTransport,
) -> Result<SharedProvider> {
    let provider: SharedProvider = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(id, config, transport.clone())?),
        ProviderKind::Anthropic => {
            Arc::new(AnthropicProvider::new(id, config, transport.clone())?)
        }
        ProviderKind::Google => Arc::new(GeminiProvider::new(id, config, transport.clone())?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(id, config, transport.clone())?),
    };
    Ok(provider)
}

// =============================================================================
// Provider Registry
// =============================================================================

/// Providers keyed by id
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, SharedProvider>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the provider's own name
    pub fn register(&mut self, provider: SharedProvider) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn with(mut self, provider: SharedProvider) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, id: &str) -> Option<&SharedProvider> {
        self.providers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SharedProvider)> {
        self.providers.iter().map(|(id, p)| (id.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
