//! Unified Error Type System
//!
//! Centralized error types for the orchestration engine.
//! Every provider adapter normalizes its wire errors into the closed
//! taxonomy below before returning, so upstream components route on
//! [`ErrorCategory`] and never parse provider bodies.
//!
//! ## Routing
//!
//! - **Fallback**: Timeout, network, server, rate limit, circuit open
//!   (plus quota and model-loading) move the failover walk to the next provider
//! - **Fail fast**: Authentication, invalid key, invalid request and unknown
//!   model are configuration problems and propagate immediately
//! - **Terminal**: `AllFallbacksFailed` and `PipelineExhausted` end the current
//!   request and are returned as structured results

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::failover as failover_constants;
use crate::types::pipeline::{PipelineStage, PipelineTrace};

// =============================================================================
// Error Categories
// =============================================================================

/// Closed error taxonomy used for routing and audit records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AuthenticationFailed,
    InvalidApiKey,
    RateLimitExceeded,
    QuotaExceeded,
    ModelNotFound,
    ModelLoading,
    InvalidRequest,
    Timeout,
    NetworkError,
    ServerError,
    CircuitOpen,
    AllFallbacksFailed,
    PipelineExhausted,
    FeatureUnavailable,
    Cancelled,
    Config,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::ModelLoading => "MODEL_LOADING",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::AllFallbacksFailed => "ALL_FALLBACKS_FAILED",
            Self::PipelineExhausted => "PIPELINE_EXHAUSTED",
            Self::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::Config => "CONFIG",
            Self::Internal => "INTERNAL",
        };
        f.write_str(label)
    }
}

impl ErrorCategory {
    /// Check if this category should move the failover walk to the next provider
    pub fn should_fallback(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::NetworkError
                | Self::ServerError
                | Self::RateLimitExceeded
                | Self::CircuitOpen
                | Self::QuotaExceeded
                | Self::ModelLoading
        )
    }

    /// Check if this category is retryable on the same provider
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NetworkError | Self::ServerError | Self::ModelLoading
        )
    }

    /// Check if this error reflects provider health (feeds the circuit breaker)
    pub fn counts_against_provider(&self) -> bool {
        self.should_fallback() && *self != Self::CircuitOpen
    }
}

// =============================================================================
// Attempt Record
// =============================================================================

/// One failed provider attempt inside a failover walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub provider: String,
    pub model: String,
    pub category: ErrorCategory,
    pub message: String,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} [{}] {}",
            self.provider, self.model, self.category, self.message
        )
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum UltraError {
    // -------------------------------------------------------------------------
    // Provider Errors (normalized by adapters)
    // -------------------------------------------------------------------------
    #[error("[{provider}] authentication failed: {message}")]
    AuthenticationFailed { provider: String, message: String },

    #[error("[{provider}] invalid API key: {message}")]
    InvalidApiKey { provider: String, message: String },

    #[error("[{provider}] rate limit exceeded{}", fmt_retry_after(.retry_after))]
    RateLimitExceeded {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("[{provider}] quota exceeded: {message}")]
    QuotaExceeded { provider: String, message: String },

    #[error("[{provider}] model not found: {model}")]
    ModelNotFound { provider: String, model: String },

    #[error("[{provider}] model {model} is loading{}", fmt_retry_after(.retry_after))]
    ModelLoading {
        provider: String,
        model: String,
        retry_after: Option<Duration>,
    },

    #[error("[{provider}] invalid request: {message}")]
    InvalidRequest { provider: String, message: String },

    /// Operation timeout with context
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("[{provider}] network error: {message}")]
    Network { provider: String, message: String },

    #[error("[{provider}] server error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Server {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("[{provider}] circuit open, request short-circuited")]
    CircuitOpen { provider: String },

    // -------------------------------------------------------------------------
    // Orchestration Errors
    // -------------------------------------------------------------------------
    #[error("All fallbacks failed after {} attempt(s): {}", .attempts.len(), fmt_attempts(.attempts))]
    AllFallbacksFailed { attempts: Vec<AttemptFailure> },

    /// Pipeline could not advance; carries everything completed so far
    #[error("Pipeline exhausted at {stage}{}", .source.as_ref().map(|e| format!(": {e}")).unwrap_or_default())]
    PipelineExhausted {
        stage: PipelineStage,
        trace: Box<PipelineTrace>,
        source: Option<Box<UltraError>>,
    },

    #[error("Feature '{feature}' unavailable: {reason}")]
    FeatureUnavailable { feature: String, reason: String },

    /// Request cancelled; carries the stages completed before the cancel
    #[error("Cancelled: {operation}")]
    Cancelled {
        operation: String,
        trace: Option<Box<PipelineTrace>>,
    },

    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {:.1}s)", d.as_secs_f64()))
        .unwrap_or_default()
}

fn fmt_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, UltraError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl UltraError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a cancellation error with no completed stages
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            trace: None,
        }
    }

    /// Attach the pipeline trace built so far to a cancellation
    pub fn with_trace(self, trace: PipelineTrace) -> Self {
        match self {
            Self::Cancelled {
                operation,
                trace: None,
            } => Self::Cancelled {
                operation,
                trace: Some(Box::new(trace)),
            },
            other => other,
        }
    }

    /// Create a server error without an HTTP status
    pub fn server(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Category used for routing decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthenticationFailed { .. } => ErrorCategory::AuthenticationFailed,
            Self::InvalidApiKey { .. } => ErrorCategory::InvalidApiKey,
            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimitExceeded,
            Self::QuotaExceeded { .. } => ErrorCategory::QuotaExceeded,
            Self::ModelNotFound { .. } => ErrorCategory::ModelNotFound,
            Self::ModelLoading { .. } => ErrorCategory::ModelLoading,
            Self::InvalidRequest { .. } => ErrorCategory::InvalidRequest,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Network { .. } => ErrorCategory::NetworkError,
            Self::Server { .. } => ErrorCategory::ServerError,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::AllFallbacksFailed { .. } => ErrorCategory::AllFallbacksFailed,
            Self::PipelineExhausted { .. } => ErrorCategory::PipelineExhausted,
            Self::FeatureUnavailable { .. } => ErrorCategory::FeatureUnavailable,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Config(_) => ErrorCategory::Config,
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error should trigger fallback to another provider
    pub fn should_fallback(&self) -> bool {
        self.category().should_fallback()
    }

    /// Check if this error is retryable on the same provider
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Provider-supplied wait hint, capped
    pub fn retry_after(&self) -> Option<Duration> {
        let hint = match self {
            Self::RateLimitExceeded { retry_after, .. } | Self::ModelLoading { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        };
        hint.map(|d| d.min(Duration::from_secs(failover_constants::MAX_RETRY_AFTER_SECS)))
    }

    /// Provider that produced the error, when known
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::AuthenticationFailed { provider, .. }
            | Self::InvalidApiKey { provider, .. }
            | Self::RateLimitExceeded { provider, .. }
            | Self::QuotaExceeded { provider, .. }
            | Self::ModelNotFound { provider, .. }
            | Self::ModelLoading { provider, .. }
            | Self::InvalidRequest { provider, .. }
            | Self::Network { provider, .. }
            | Self::Server { provider, .. }
            | Self::CircuitOpen { provider } => Some(provider),
            _ => None,
        }
    }

    /// Partial trace carried by a pipeline failure
    pub fn trace(&self) -> Option<&PipelineTrace> {
        match self {
            Self::PipelineExhausted { trace, .. } => Some(trace),
            Self::Cancelled { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Normalizes provider wire errors into [`UltraError`]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an HTTP error response.
    ///
    /// `code` is the provider's machine-readable error code or type
    /// (OpenAI `error.code`, Anthropic `error.type`, Gemini `error.status`).
    pub fn classify_http_status(
        provider: &str,
        model: &str,
        status: u16,
        code: Option<&str>,
        message: &str,
        retry_after: Option<Duration>,
    ) -> UltraError {
        let code = code.unwrap_or_default().to_lowercase();
        let lower = message.to_lowercase();
        let provider_owned = provider.to_string();

        let mentions_key = code.contains("api_key")
            || code.contains("invalid_key")
            || lower.contains("api key")
            || lower.contains("api_key")
            || lower.contains("x-api-key");

        match status {
            401 | 403 if mentions_key => UltraError::InvalidApiKey {
                provider: provider_owned,
                message: message.to_string(),
            },
            401 | 403 => UltraError::AuthenticationFailed {
                provider: provider_owned,
                message: message.to_string(),
            },
            // Gemini reports a bad key as 400 INVALID_ARGUMENT
            400 if mentions_key => UltraError::InvalidApiKey {
                provider: provider_owned,
                message: message.to_string(),
            },
            429 if code.contains("quota")
                || lower.contains("quota")
                || lower.contains("billing")
                || lower.contains("credit balance") =>
            {
                UltraError::QuotaExceeded {
                    provider: provider_owned,
                    message: message.to_string(),
                }
            }
            429 => UltraError::RateLimitExceeded {
                provider: provider_owned,
                retry_after: retry_after.or_else(|| parse_retry_delay(message)),
            },
            404 => UltraError::ModelNotFound {
                provider: provider_owned,
                model: model.to_string(),
            },
            400 | 413 | 422 if lower.contains("model") && lower.contains("not found") => {
                UltraError::ModelNotFound {
                    provider: provider_owned,
                    model: model.to_string(),
                }
            }
            400 | 413 | 422 => UltraError::InvalidRequest {
                provider: provider_owned,
                message: message.to_string(),
            },
            408 | 504 => UltraError::Timeout {
                operation: format!("{provider} request ({status})"),
                duration: Duration::ZERO,
            },
            503 if code.contains("loading") || lower.contains("loading") => {
                UltraError::ModelLoading {
                    provider: provider_owned,
                    model: model.to_string(),
                    retry_after: retry_after.or_else(|| parse_retry_delay(message)),
                }
            }
            _ => UltraError::Server {
                provider: provider_owned,
                status: Some(status),
                message: message.to_string(),
            },
        }
    }

    /// Classify a transport-level failure from the shared HTTP client
    pub fn from_reqwest(provider: &str, err: &reqwest::Error, timeout: Duration) -> UltraError {
        if err.is_timeout() {
            UltraError::timeout(format!("{provider} request"), timeout)
        } else if err.is_decode() {
            UltraError::server(provider, format!("Malformed response body: {err}"))
        } else {
            UltraError::network(provider, err.to_string())
        }
    }
}

/// Read a `Retry-After` (seconds) or `retry-after-ms` header.
///
/// Values that are negative, not finite or too large for a `Duration` are
/// dropped; the rest are capped at `MAX_RETRY_AFTER_SECS`.
pub fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let header_secs = |name: &str, scale: f64| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|v| bounded_secs(v / scale))
    };

    header_secs("retry-after-ms", 1000.0)
        .or_else(|| header_secs(reqwest::header::RETRY_AFTER.as_str(), 1.0))
}

fn bounded_secs(secs: f64) -> Option<Duration> {
    if secs < 0.0 {
        return None;
    }
    let cap = Duration::from_secs(failover_constants::MAX_RETRY_AFTER_SECS);
    Duration::try_from_secs_f64(secs).ok().map(|d| d.min(cap))
}

/// Parse a retry delay from an error message.
///
/// Understands "retry after N seconds", "wait N seconds", "retry in Ns" and
/// Gemini-style `"retryDelay": "30s"` fragments. The number must carry a
/// seconds unit, so "error in request 42" is not a delay.
pub fn parse_retry_delay(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let cap = failover_constants::MAX_RETRY_AFTER_SECS;

    for pattern in ["retrydelay", "retry after", "retry-after", "wait ", "in "] {
        let mut rest = lower.as_str();
        while let Some(idx) = rest.find(pattern) {
            rest = &rest[idx + pattern.len()..];
            if let Some(secs) = leading_seconds(rest) {
                return Some(Duration::from_secs(secs.min(cap)));
            }
        }
    }

    None
}

/// `"30s"`, `30 sec`, `30 seconds` at the start of `text`
fn leading_seconds(text: &str) -> Option<u64> {
    let text = text.trim_start_matches(|c: char| c.is_whitespace() || c == '"' || c == ':');
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let secs = text[..end].parse::<u64>().ok()?;

    let unit: String = text[end..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    matches!(unit.as_str(), "s" | "sec" | "secs" | "second" | "seconds").then_some(secs)
}

// =============================================================================
// Tests
// =============================================================================
