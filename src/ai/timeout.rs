//! Unified Timeout Configuration
//!
//! Three nested budgets bound every request:
//! - transport: one HTTP exchange, enforced by the shared client and
//!   bounding health probes
//! - stage: one fan-out join barrier
//! - pipeline: the whole request when the caller sets no deadline
//!
//! ## Usage
//!
//! ```ignore
//! use crate::ai::timeout::{TimeoutConfig, with_timeout};
//!
//! let config = TimeoutConfig::default();
//! let result = with_timeout(
//!     config.stage,
//!     async { /* stage fan-out */ },
//!     "initial_response"
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::constants::{network as net_constants, pipeline as pipeline_constants};
use crate::types::{Result, UltraError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// One provider HTTP exchange (default: 45 seconds)
    #[serde(with = "secs")]
    pub transport: Duration,
    /// One pipeline stage (default: 2 minutes)
    #[serde(with = "secs")]
    pub stage: Duration,
    /// A whole pipeline run (default: 10 minutes)
    #[serde(with = "secs")]
    pub pipeline: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transport: Duration::from_secs(net_constants::DEFAULT_TIMEOUT_SECS),
            stage: Duration::from_secs(pipeline_constants::STAGE_TIMEOUT_SECS),
            pipeline: Duration::from_secs(pipeline_constants::PIPELINE_TIMEOUT_SECS),
        }
    }
}

impl TimeoutConfig {
    /// Deadline for a stage starting now: the stage budget, clipped to the
    /// request deadline if that comes first
    pub fn stage_deadline(&self, request_deadline: Option<Instant>) -> Instant {
        let stage_end = Instant::now() + self.stage;
        request_deadline.map_or(stage_end, |deadline| deadline.min(stage_end))
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Execute an async operation with a timeout
///
/// Returns a timeout error if the operation doesn't complete within the specified duration.
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(UltraError::timeout(operation_name, timeout)),
    }
}

/// Execute an async operation with a timeout, mapping the inner result
///
/// This variant accepts futures that return non-Result types and wraps them.
pub async fn with_timeout_map<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => Ok(result),
        Err(_) => Err(UltraError::timeout(operation_name, timeout)),
    }
}
