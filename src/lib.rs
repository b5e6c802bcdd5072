//! Ultra Orchestrator - Multi-Provider LLM Orchestration Engine
//!
//! Sends one prompt to several LLMs, has them review each other's answers,
//! and synthesizes a final response, while surviving individual provider
//! failures.
//!
//! ## Core Features
//!
//! - **Three-Stage Pipeline**: initial responses, peer-review revision,
//!   ultra synthesis
//! - **Failover**: ordered fallback chains with capability-based model mapping
//! - **Circuit Breakers**: per-provider, feeding degraded-mode operation
//! - **Rate Limiting & Retry**: token buckets and bounded backoff per provider
//! - **Shared Transport**: one connection pool for every adapter
//!
//! ## Quick Start
//!
//! ```ignore
//! use ultra_orchestrator::{ConfigLoader, Orchestrator, Request};
//!
//! let config = ConfigLoader::load()?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let request = Request::new("Explain borrow checking", vec![
//!     "gpt-4o".into(),
//!     "claude-3-opus-20240229".into(),
//! ]);
//! let result = orchestrator.run_pipeline(request).await;
//! println!("{}", result.final_synthesis.unwrap_or_default());
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: provider adapters, failover, circuit breakers, degraded mode
//! - [`pipeline`]: the stage machine
//! - [`orchestrator`]: upstream entry point
//! - [`config`]: layered configuration

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod orchestrator;
pub mod pipeline;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{ErrorCategory, Result, UltraError};

// Pipeline
pub use orchestrator::{Orchestrator, ProbeResult};
pub use pipeline::{PipelineCoordinator, PipelinePattern, PipelineSettings};
pub use types::{
    FallbackEvent, GenerateOptions, ModelOutput, ModelTarget, PipelineResult, PipelineStage,
    Request, StageResult,
};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{
    // Resilience
    DegradedModeController,
    FailoverManager,
    HealthReport,
    // Providers
    LlmProvider,
    LlmResponse,
    // Metrics
    MetricsCollector,
    ModelRegistry,
    OperationMode,
    ProviderRegistry,
    SharedMetrics,
    // Timeout
    TimeoutConfig,
    with_timeout,
};
