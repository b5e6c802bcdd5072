//! Shared Transport Pool
//!
//! One connection-pooled HTTP client for every provider adapter. The pool is
//! built once at process start and injected into adapters at construction;
//! adapters never build their own client.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::ai::timeout::TimeoutConfig;
use crate::config::TransportSettings;
use crate::types::{ErrorClassifier, Result, UltraError, parse_retry_after_header};

/// Provider-specific extraction of `(code, message)` from an error body
pub type ErrorBodyParser = fn(&Value) -> (Option<String>, Option<String>);

/// Cloneable handle to the single process-wide HTTP pool
#[derive(Clone)]
pub struct SharedTransport {
    client: Arc<reqwest::Client>,
    timeout: Duration,
}

impl std::fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTransport")
            .field("timeout", &self.timeout)
            .field("handles", &Arc::strong_count(&self.client))
            .finish()
    }
}

impl SharedTransport {
    /// Build the pool. `timeout` bounds one HTTP exchange (`timeouts.transport`).
    pub fn new(settings: &TransportSettings, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
            .user_agent(concat!("ultra-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UltraError::Config(format!("Failed to create HTTP client: {}", e)))?;

        debug!(
            timeout_secs = timeout.as_secs(),
            pool_max_idle_per_host = settings.pool_max_idle_per_host,
            "Shared transport pool created"
        );

        Ok(Self {
            client: Arc::new(client),
            timeout,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(&TransportSettings::default(), TimeoutConfig::default().transport)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when both handles refer to the same underlying pool
    pub fn same_pool(&self, other: &SharedTransport) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }

    /// Send a request and decode a JSON body, normalizing every failure
    /// into the error taxonomy.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        provider: &str,
        model: &str,
        request: reqwest::RequestBuilder,
        parse_error: ErrorBodyParser,
    ) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| ErrorClassifier::from_reqwest(provider, &e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            let (code, message) = serde_json::from_str::<Value>(&body)
                .map(|v| parse_error(&v))
                .unwrap_or((None, None));
            let message = message.unwrap_or_else(|| truncate_body(&body));

            return Err(ErrorClassifier::classify_http_status(
                provider,
                model,
                status.as_u16(),
                code.as_deref(),
                &message,
                retry_after,
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ErrorClassifier::from_reqwest(provider, &e, self.timeout))
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Read `error.<field>` as a string from a provider error body
pub(crate) fn error_field(body: &Value, field: &str) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get(field))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Validate an endpoint URL (http/https only) and strip the trailing slash
pub(crate) fn validate_endpoint(provider: &str, endpoint: &str) -> Result<String> {
    let url = url::Url::parse(endpoint).map_err(|e| {
        UltraError::Config(format!(
            "Invalid {} endpoint URL '{}': {}",
            provider, endpoint, e
        ))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UltraError::Config(format!(
            "{} endpoint must use http or https scheme, got: {}",
            provider,
            url.scheme()
        )));
    }

    let mut result = url.to_string();
    if result.ends_with('/') {
        result.pop();
    }
    Ok(result)
}
