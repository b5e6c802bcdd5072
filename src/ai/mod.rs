//! AI Integration Layer
//!
//! Provider adapters, the failover machinery around them, and the shared
//! resilience state (degraded mode, metrics, timeouts) the pipeline runs on.

pub mod degraded;
pub mod metrics;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod timeout;

pub use degraded::{
    DegradedModeController, OperationMode, OperationState, Severity, SharedDegradedController,
};
pub use metrics::{
    HealthReport, MetricsCollector, MetricsSummary, ProviderMetrics, SharedMetrics, StageMetrics,
    create_shared_metrics,
};
pub use prompt::{PromptBuilder, PromptSection, PromptTemplates};
pub use provider::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorCategory, ErrorClassifier,
    FailoverConfig, FailoverManager, FailoverOutcome, LlmProvider, LlmResponse, ProviderConfig,
    ProviderHealth, ProviderKind, ProviderRegistry, ResponseMetadata, ResponseTiming,
    SharedProvider, SharedTransport, TokenUsage,
};
pub use registry::{Capability, ModelDefinition, ModelRegistry};
pub use retry::{RetryPolicy, retry_with_policy};
pub use timeout::{TimeoutConfig, with_timeout, with_timeout_map};
