//! Error types for pipeline runs.
//!
//! Errors carry context that chains through layers:
//! Pipeline → Step → store/domain error.

use thiserror::Error;

use crate::error::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A step returned an error; later steps did not run.
    #[error("pipeline '{pipeline}' failed at step '{step}': {source}")]
    StepFailed {
        pipeline: String,
        step: String,
        #[source]
        source: Error,
    },

    /// The finalizer itself failed (or replaced the terminal error).
    #[error("pipeline '{pipeline}' finalizer failed: {source}")]
    FinalizeFailed {
        pipeline: String,
        #[source]
        source: Error,
    },
}

impl PipelineError {
    pub fn step_failed(
        pipeline: impl Into<String>,
        step: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::StepFailed {
            pipeline: pipeline.into(),
            step: step.into(),
            source,
        }
    }

    pub fn finalize_failed(pipeline: impl Into<String>, source: Error) -> Self {
        Self::FinalizeFailed {
            pipeline: pipeline.into(),
            source,
        }
    }

    /// Name of the failing step, if a step failed.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            Self::FinalizeFailed { .. } => None,
        }
    }

    /// The underlying error, for classification.
    pub fn cause(&self) -> &Error {
        match self {
            Self::StepFailed { source, .. } | Self::FinalizeFailed { source, .. } => source,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.cause().is_conflict()
    }

    pub fn is_transient(&self) -> bool {
        self.cause().is_transient()
    }
}
