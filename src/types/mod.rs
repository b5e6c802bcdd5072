pub mod error;
pub mod pipeline;

pub use error::{
    AttemptFailure, ErrorCategory, ErrorClassifier, Result, UltraError, parse_retry_after_header,
    parse_retry_delay,
};
pub use pipeline::{
    FallbackEvent, GenerateOptions, ModelOutput, ModelTarget, PipelineOutput, PipelineResult,
    PipelineStage, PipelineTrace, Request, StageResult,
};
