//! Error Types
//!
//! Engine-level errors surfaced to callers, and task-level errors that are
//! recorded on a task's status entry instead of being returned.

use std::time::Duration;

use thiserror::Error;

use crate::workflow::state::ExecutionStatus;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the scheduler and its collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown workflow or execution. Never retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed workflow definition; the execution is not started.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Attempted an execution status change the state machine forbids.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// A write would move a finished execution to a different terminal status.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl EngineError {
    /// Returns true for errors that mean "no such workflow or execution".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Failure of a single task. Its display string is stored on the task entry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The task's own logic failed.
    #[error("{0}")]
    Execution(String),

    /// A queued job did not report completion within the bounded wait.
    #[error("timed out after {waited:?} waiting for job completion")]
    Timeout { waited: Duration },

    /// The runtime running the task faulted (panic, cancellation).
    #[error("runtime fault: {0}")]
    RuntimeFault(String),
}
