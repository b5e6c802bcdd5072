//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global and project (.ultra/) level configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::ai::provider::{CircuitBreakerConfig, FailoverConfig, ProviderConfig, ProviderKind};
use crate::ai::registry::{ModelDefinition, ModelRegistry};
use crate::ai::retry::RetryPolicy;
use crate::ai::timeout::TimeoutConfig;
use crate::constants::{circuit_breaker as cb_constants, network, rate_limit};
use crate::pipeline::PipelineSettings;
use crate::types::{Result, UltraError};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Shared HTTP pool settings
    pub transport: TransportSettings,

    /// Provider entries keyed by provider id
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Registry entries; the built-in catalogue is used when empty and no
    /// `registry_path` is set
    pub models: Vec<ModelDefinition>,

    /// Direct equivalence groups (`provider/model` names)
    pub equivalences: Vec<Vec<String>>,

    /// Standalone registry file (YAML or TOML), replaces `models`
    pub registry_path: Option<PathBuf>,

    /// Ordered fallback providers per primary provider
    pub fallback_chains: BTreeMap<String, Vec<String>>,

    pub circuit_breaker: CircuitBreakerSettings,

    pub retry: RetryPolicy,

    pub timeouts: TimeoutConfig,

    pub pipeline: PipelineSettings,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert("openai".to_string(), ProviderConfig::new(ProviderKind::OpenAi));
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig::new(ProviderKind::Anthropic),
        );
        providers.insert("google".to_string(), ProviderConfig::new(ProviderKind::Google));
        providers.insert("ollama".to_string(), ProviderConfig::new(ProviderKind::Ollama));

        let chain = |ids: &[&str]| ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();
        let mut fallback_chains = BTreeMap::new();
        fallback_chains.insert("openai".to_string(), chain(&["anthropic", "google", "ollama"]));
        fallback_chains.insert("anthropic".to_string(), chain(&["openai", "google", "ollama"]));
        fallback_chains.insert("google".to_string(), chain(&["openai", "anthropic", "ollama"]));
        fallback_chains.insert("ollama".to_string(), Vec::new());

        Self {
            version: "1.0".to_string(),
            transport: TransportSettings::default(),
            providers,
            models: Vec::new(),
            equivalences: Vec::new(),
            registry_path: None,
            fallback_chains,
            circuit_breaker: CircuitBreakerSettings::default(),
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `UltraError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.transport.is_zero() {
            return Err(UltraError::Config(
                "timeouts.transport must be greater than 0".to_string(),
            ));
        }

        for (id, provider) in &self.providers {
            if let Some(temperature) = provider.temperature
                && !(0.0..=2.0).contains(&temperature)
            {
                return Err(UltraError::Config(format!(
                    "providers.{}.temperature must be between 0.0 and 2.0, got {}",
                    id, temperature
                )));
            }
            if provider.requests_per_minute == Some(0) {
                return Err(UltraError::Config(format!(
                    "providers.{}.requests_per_minute must be greater than 0",
                    id
                )));
            }
        }

        for (primary, chain) in &self.fallback_chains {
            for fallback in chain {
                if !self.providers.contains_key(fallback) {
                    return Err(UltraError::Config(format!(
                        "fallback_chains.{} references unknown provider '{}'",
                        primary, fallback
                    )));
                }
                if fallback == primary {
                    return Err(UltraError::Config(format!(
                        "fallback_chains.{} lists itself as a fallback",
                        primary
                    )));
                }
            }
        }

        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(UltraError::Config(
                "circuit_breaker thresholds must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker.success_threshold > self.circuit_breaker.half_open_max_requests {
            return Err(UltraError::Config(format!(
                "circuit_breaker.success_threshold ({}) must not exceed half_open_max_requests ({})",
                self.circuit_breaker.success_threshold, self.circuit_breaker.half_open_max_requests
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(UltraError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.timeouts.stage.is_zero() || self.timeouts.pipeline < self.timeouts.stage {
            return Err(UltraError::Config(
                "timeouts.stage must be non-zero and not exceed timeouts.pipeline".to_string(),
            ));
        }

        if self.pipeline.max_models == 0 {
            return Err(UltraError::Config(
                "pipeline.max_models must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the model registry: `registry_path`, then inline `models`,
    /// then the built-in catalogue
    pub fn model_registry(&self) -> Result<ModelRegistry> {
        if let Some(path) = &self.registry_path {
            return ModelRegistry::from_path(path);
        }
        if self.models.is_empty() {
            return Ok(ModelRegistry::builtin());
        }
        ModelRegistry::new(self.models.clone(), self.equivalences.clone())
    }

    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            retry: self.retry.clone(),
            fallback_chains: self.fallback_chains.clone(),
            circuit_breaker: self.circuit_breaker.to_breaker_config(),
            max_rate_limit_wait: self.circuit_breaker.max_rate_limit_wait(),
        }
    }

    /// Enabled providers, in id order
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&str, &ProviderConfig)> {
        self.providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, p)| (id.as_str(), p))
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: network::CONNECTION_TIMEOUT_SECS,
            pool_max_idle_per_host: network::POOL_MAX_IDLE_PER_HOST,
            pool_idle_timeout_secs: network::POOL_IDLE_TIMEOUT_SECS,
        }
    }
}

// =============================================================================
// Circuit Breaker Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_requests: u32,
    pub window_size: usize,
    /// Longest local rate-limit wait before the call fails over
    pub max_rate_limit_wait_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            success_threshold: cb_constants::SUCCESS_THRESHOLD,
            recovery_timeout_secs: cb_constants::RECOVERY_TIMEOUT_SECS,
            half_open_max_requests: cb_constants::HALF_OPEN_MAX_REQUESTS,
            window_size: cb_constants::HEALTH_WINDOW,
            max_rate_limit_wait_secs: rate_limit::MAX_QUEUE_WAIT_SECS,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_timeout: Duration::from_secs(self.recovery_timeout_secs),
            half_open_max_requests: self.half_open_max_requests.max(1),
            window_size: self.window_size.max(1),
        }
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.max_rate_limit_wait_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.providers.len(), 4);
        assert_eq!(
            config.fallback_chains["openai"],
            vec!["anthropic", "google", "ollama"]
        );
        assert_eq!(config.timeouts.transport, Duration::from_secs(45));
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_fallback_provider_rejected() {
        let mut config = Config::default();
        config
            .fallback_chains
            .insert("openai".to_string(), vec!["mistral".to_string()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mistral"));
    }

    #[test]
    fn test_self_fallback_rejected() {
        let mut config = Config::default();
        config
            .fallback_chains
            .insert("openai".to_string(), vec!["openai".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_timeout_bounded_by_pipeline() {
        let mut config = Config::default();
        config.timeouts.stage = Duration::from_secs(900);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unreachable_success_threshold_rejected() {
        let mut config = Config::default();
        config.circuit_breaker.success_threshold = 4;
        config.circuit_breaker.half_open_max_requests = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("success_threshold"));

        config.circuit_breaker.success_threshold = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_falls_back_to_builtin() {
        let registry = Config::default().model_registry().unwrap();
        assert!(registry.resolve("gpt-4o").is_some());
    }

    #[test]
    fn test_inline_models_replace_builtin() {
        let config: Config = toml::from_str(
            r#"
            [[models]]
            provider = "ollama"
            model_id = "llama3:latest"
            capabilities = ["chat"]
            "#,
        )
        .unwrap();

        let registry = config.model_registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("gpt-4o").is_none());
    }

    #[test]
    fn test_breaker_settings_convert() {
        let settings = CircuitBreakerSettings {
            recovery_timeout_secs: 5,
            ..Default::default()
        };
        let breaker = settings.to_breaker_config();
        assert_eq!(breaker.open_timeout, Duration::from_secs(5));
        assert_eq!(breaker.failure_threshold, 5);
    }

    #[test]
    fn test_failover_config_carries_chains() {
        let failover = Config::default().failover_config();
        assert_eq!(failover.fallback_chains["google"][0], "openai");
        assert_eq!(failover.retry.max_attempts, 2);
    }
}
