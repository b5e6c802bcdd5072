//! Stage fan-out with a join barrier
//!
//! One future per model, polled concurrently on the calling task. The
//! barrier returns when every model finished, the stage deadline fires, or
//! the request is cancelled. Futures still in flight at that point are
//! dropped, which abandons their provider calls.

use std::collections::BTreeMap;

use futures::StreamExt;
use futures::stream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ai::provider::{FailoverManager, FailoverOutcome};
use crate::types::{GenerateOptions, ModelTarget, PipelineStage, Result, UltraError};

/// One model call within a stage
#[derive(Debug, Clone)]
pub(crate) struct FanOutTask {
    pub label: String,
    pub target: ModelTarget,
    pub prompt: String,
}

/// Results keyed by task label. Every task has an entry: models that missed
/// the deadline get a `Timeout` error.
pub(crate) type FanOutResults = BTreeMap<String, Result<FailoverOutcome>>;

pub(crate) struct FanOut<'a> {
    pub failover: &'a FailoverManager,
    pub stage: PipelineStage,
    pub options: &'a GenerateOptions,
    /// Walk the configured fallback chain per call instead of calling the
    /// requested provider alone
    pub use_fallback: bool,
    pub deadline: Instant,
}

impl FanOut<'_> {
    pub(crate) async fn run(
        &self,
        tasks: Vec<FanOutTask>,
        cancel: &CancellationToken,
    ) -> Result<FanOutResults> {
        let started = Instant::now();
        let labels: Vec<String> = tasks.iter().map(|t| t.label.clone()).collect();
        let concurrency = tasks.len().max(1);

        let mut stream = stream::iter(tasks)
            .map(|task| async move {
                let result = if self.use_fallback {
                    self.failover
                        .execute_with_fallback(&task.target, &task.prompt, self.options)
                        .await
                } else {
                    self.failover
                        .execute_with_chain(&task.target, &[], &task.prompt, self.options)
                        .await
                };
                (task.label, result)
            })
            .buffer_unordered(concurrency);

        let mut results = FanOutResults::new();
        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(stage = %self.stage, completed = results.len(), "Stage cancelled");
                    return Err(UltraError::cancelled(format!("stage {}", self.stage)));
                }
                next = stream.next() => match next {
                    Some((label, result)) => {
                        debug!(stage = %self.stage, model = %label, ok = result.is_ok(), "Model finished");
                        results.insert(label, result);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        stage = %self.stage,
                        completed = results.len(),
                        pending = labels.len() - results.len(),
                        "Stage deadline reached, continuing with partial results"
                    );
                    break;
                }
            }
        }
        drop(stream);

        let budget = self.deadline.saturating_duration_since(started);
        for label in labels {
            if !results.contains_key(&label) {
                let err = UltraError::timeout(format!("{} for {}", self.stage, label), budget);
                results.insert(label, Err(err));
            }
        }
        Ok(results)
    }
}
