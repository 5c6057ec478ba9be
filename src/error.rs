//! Error types for the orchestration engine

use crate::types::{DefinitionId, RunId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestration engine
#[derive(Debug, Error)]
pub enum Error {
    /// The definition violates a structural invariant; no run was created
    #[error("Validation error: {0}")]
    Validation(String),

    /// A single agent call failed or timed out
    #[error("Invocation error: {0}")]
    Invocation(#[from] InvocationError),

    /// Consensus could not be judged with fewer than two successful results
    #[error("Insufficient data: {successful} successful result(s), at least {required} required")]
    InsufficientData {
        /// Successful results available
        successful: usize,
        /// Results needed
        required: usize,
    },

    /// The run exceeded its run-level time budget
    #[error("Run timed out after {}ms", .0.as_millis())]
    RunTimeout(Duration),

    /// The run was cancelled by its caller
    #[error("Run cancelled")]
    Cancelled,

    /// Integration defect, e.g. a conflicting write to a terminal record
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Run not found
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Definition not found
    #[error("Definition not found: {0}")]
    DefinitionNotFound(DefinitionId),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error signals a defect rather than an ordinary runtime failure
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Run-level classification of this error
    pub fn run_error_kind(&self) -> RunErrorKind {
        match self {
            Self::Invocation(_) => RunErrorKind::Execution,
            Self::InsufficientData { .. } => RunErrorKind::InsufficientData,
            Self::RunTimeout(_) => RunErrorKind::Timeout,
            Self::Cancelled => RunErrorKind::Cancelled,
            _ => RunErrorKind::Internal,
        }
    }
}

/// Machine-readable reason a run ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// One or more agent executions failed
    Execution,
    /// Consensus mode had fewer than two successful results
    InsufficientData,
    /// Run-level timeout expired
    Timeout,
    /// Caller cancelled the run
    Cancelled,
    /// Storage or integration failure
    Internal,
}

/// Classification of a failed agent invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    /// The invoker reported a failure
    Failed,
    /// Per-call or run-level timeout expired
    Timeout,
    /// The run was cancelled while the call was outstanding
    Cancelled,
    /// The agent answered with an error payload
    Agent,
    /// The step input could not be produced from the previous result
    InvalidInput,
}

impl fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Agent => "agent error",
            Self::InvalidInput => "invalid input",
        };
        f.write_str(label)
    }
}

/// Failure of one agent invocation, local to a single execution
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    /// Failure classification
    pub kind: InvocationErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl InvocationError {
    /// Create an invocation error of the given kind
    pub fn new(kind: InvocationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Invoker-side failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::Failed, message)
    }

    /// Timeout expiry
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::Timeout, message)
    }

    /// Cancellation observed
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::Cancelled, message)
    }

    /// Error payload returned by the agent itself
    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::Agent, message)
    }

    /// Input transform failure
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(InvocationErrorKind::InvalidInput, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        assert!(Error::invariant("double completion").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::validation("bad").is_fatal());
        assert!(!Error::Invocation(InvocationError::timeout("slow")).is_fatal());
    }

    #[test]
    fn test_run_error_kinds() {
        assert_eq!(Error::Cancelled.run_error_kind(), RunErrorKind::Cancelled);
        assert_eq!(
            Error::RunTimeout(Duration::from_secs(1)).run_error_kind(),
            RunErrorKind::Timeout
        );
        assert_eq!(
            Error::InsufficientData { successful: 1, required: 2 }.run_error_kind(),
            RunErrorKind::InsufficientData
        );
        assert_eq!(Error::storage("disk").run_error_kind(), RunErrorKind::Internal);
    }

    #[test]
    fn test_invocation_error_display() {
        let err = InvocationError::timeout("agent 'a' exceeded 50ms");
        assert_eq!(err.to_string(), "timeout: agent 'a' exceeded 50ms");
        assert_eq!(
            Error::RunTimeout(Duration::from_millis(250)).to_string(),
            "Run timed out after 250ms"
        );
    }
}
