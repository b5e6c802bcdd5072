//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Failover and retry constants
pub mod failover {
    /// Default attempts per provider (first call included)
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

    /// Base delay for exponential backoff (milliseconds)
    pub const BASE_DELAY_MS: u64 = 500;

    /// Maximum delay between retries (milliseconds)
    pub const MAX_DELAY_MS: u64 = 30_000;

    /// Backoff multiplier
    pub const BACKOFF_FACTOR: f32 = 2.0;

    /// Upper bound for a provider-supplied retry-after hint (seconds)
    pub const MAX_RETRY_AFTER_SECS: u64 = 300;
}

/// Circuit breaker constants
pub mod circuit_breaker {
    /// Number of consecutive failures before opening circuit
    pub const FAILURE_THRESHOLD: u32 = 5;

    /// Cool-down before an open circuit admits probes (seconds)
    pub const RECOVERY_TIMEOUT_SECS: u64 = 60;

    /// Maximum probe requests allowed in half-open state
    pub const HALF_OPEN_MAX_REQUESTS: u32 = 3;

    /// Probe successes required to close circuit from half-open
    pub const SUCCESS_THRESHOLD: u32 = 2;

    /// Number of recent outcomes used for the success rate
    pub const HEALTH_WINDOW: usize = 20;
}

/// Rate limiter constants
pub mod rate_limit {
    /// Default bucket capacity
    pub const DEFAULT_BURST: u32 = 10;

    /// Longest a call waits for a local token before failing over (seconds)
    pub const MAX_QUEUE_WAIT_SECS: u64 = 10;
}

/// Pipeline constants
pub mod pipeline {
    /// Default per-stage deadline (seconds)
    pub const STAGE_TIMEOUT_SECS: u64 = 120;

    /// Default whole-pipeline budget (seconds)
    pub const PIPELINE_TIMEOUT_SECS: u64 = 600;

    /// Maximum models fanned out per stage
    pub const MAX_MODELS: usize = 8;

    /// Pattern used when a request does not name one
    pub const DEFAULT_PATTERN: &str = "ultra";

    /// Feature name gating the peer-review stage
    pub const PEER_REVIEW_FEATURE: &str = "peer_review";

    /// Stage results kept by the metrics collector
    pub const MAX_STAGE_HISTORY: usize = 256;
}

/// HTTP/Network constants
pub mod network {
    /// Shared transport request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 45;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;

    /// Idle connections kept per host
    pub const POOL_MAX_IDLE_PER_HOST: usize = 32;

    /// Idle connection lifetime (seconds)
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

    /// Default completion budget sent to providers
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;
}
