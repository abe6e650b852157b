//! Top-level error types for the Kiln workflow domain.
//!
//! [`StageError`] is what a stage executor or judge raises. It is deliberately
//! stringly-typed: the error classifier in [`crate::recovery`] inspects the
//! failure's type name and message, exactly as the failure was reported by the
//! collaborator, so no structure is imposed on external implementations.
//!
//! [`PipelineError`] covers conditions that the engine reports to its callers:
//! invalid configuration (fail fast at construction time) and checkpoint/resume
//! problems. Ordinary operational failures never surface as a `PipelineError`;
//! they are recorded on the returned [`crate::WorkflowState`] instead.

use thiserror::Error;

use crate::ThreadId;

// ---------------------------------------------------------------------------
// Stage failures
// ---------------------------------------------------------------------------

/// A failure raised by a stage executor, judge, or other external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StageError {
    /// Type name of the underlying failure (e.g. `"RateLimitError"`).
    pub kind: String,
    /// Human-readable failure message.
    pub message: String,
}

impl StageError {
    /// Creates a [`StageError`] from an explicit kind and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wraps any error value, recording the last path segment of its Rust type
    /// name as the failure kind.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error,
    {
        let full = std::any::type_name::<E>();
        let short = full.rsplit("::").next().unwrap_or(full);
        Self::new(short, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Engine-level errors
// ---------------------------------------------------------------------------

/// Errors the engine reports to its callers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The engine or council configuration is invalid.
    ///
    /// Produced at construction time; the engine never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// No checkpoint exists for the requested thread.
    #[error("No checkpoint found for thread {thread_id}")]
    CheckpointNotFound {
        /// The thread that was looked up.
        thread_id: ThreadId,
    },

    /// The checkpoint store failed to read or write state.
    #[error("Checkpoint store error: {message}")]
    Checkpoint {
        /// Description reported by the store.
        message: String,
    },

    /// A resume request cannot be honoured in the checkpoint's current state.
    #[error("Invalid resume request: {message}")]
    InvalidResume {
        /// Why the request was refused.
        message: String,
    },

    /// Workflow state could not be converted to or from its checkpoint form.
    #[error("State serialisation error: {message}")]
    StateSerialization {
        /// Underlying serialisation message.
        message: String,
    },
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::ConfigurationError`].
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::ConfigurationError {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::StateSerialization {
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Port errors
// ---------------------------------------------------------------------------

/// Failure reported by a [`crate::ports::CheckpointStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("No checkpoint for thread {thread_id}")]
    NotFound { thread_id: ThreadId },

    #[error("Checkpoint store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Checkpoint for thread {thread_id} is corrupt: {message}")]
    Corrupt { thread_id: ThreadId, message: String },
}

impl From<CheckpointError> for PipelineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::NotFound { thread_id } => PipelineError::CheckpointNotFound { thread_id },
            other => PipelineError::Checkpoint {
                message: other.to_string(),
            },
        }
    }
}

/// Failure reported by a [`crate::ports::TrackingSink`].
///
/// Never aborts a workflow; callers log it and carry on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Tracking sink error: {message}")]
pub struct TrackingError {
    pub message: String,
}

impl TrackingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
