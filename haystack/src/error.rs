//! Engine error types
//!
//! Batch-fatal conditions surface as [`EngineError`] before any model call is
//! made. Per-assignment failures never become an `EngineError`; they are
//! recorded on the `TestResult` instead.

use std::path::PathBuf;

use thiserror::Error;

use crate::gate::CheckResult;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that abort a run (or a stream read) as a whole
#[derive(Error, Debug)]
pub enum EngineError {
    /// The question gate refused the batch
    #[error("Batch rejected: {reason}")]
    BatchRejected {
        reason: String,
        /// Offending questions (or every checked question when nothing survived)
        diagnostics: Vec<CheckResult>,
    },

    /// Requested context lengths cannot be served by the source or the questions
    #[error("Infeasible context configuration: {message}")]
    InfeasibleContext { message: String },

    /// Scheduler or plan configuration is malformed
    #[error("Invalid schedule configuration: {message}")]
    InvalidSchedule { message: String },

    /// A question record violates the data model
    #[error("Invalid question at index {index}: {message}")]
    InvalidQuestion { index: usize, message: String },

    /// A prompt template is missing a field or a required placeholder
    #[error("Invalid prompt template: {message}")]
    InvalidTemplate { message: String },

    /// A JSONL stream contains a record that cannot be decoded
    #[error("Malformed stream {path} at line {line}: {message}")]
    MalformedStream {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a batch rejection with diagnostics
    pub fn batch_rejected(reason: impl Into<String>, diagnostics: Vec<CheckResult>) -> Self {
        Self::BatchRejected {
            reason: reason.into(),
            diagnostics,
        }
    }

    /// Create an infeasible-context error
    pub fn infeasible(message: impl Into<String>) -> Self {
        Self::InfeasibleContext {
            message: message.into(),
        }
    }

    /// Create a schedule configuration error
    pub fn invalid_schedule(message: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            message: message.into(),
        }
    }

    /// Create a malformed stream error
    pub fn malformed_stream(
        path: impl Into<PathBuf>,
        line: usize,
        message: impl Into<String>,
    ) -> Self {
        Self::MalformedStream {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    /// Whether this error was raised before any model traffic, by validation of
    /// the run's inputs (as opposed to an IO failure).
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::BatchRejected { .. }
                | Self::InfeasibleContext { .. }
                | Self::InvalidSchedule { .. }
                | Self::InvalidQuestion { .. }
                | Self::InvalidTemplate { .. }
        )
    }
}
