//! Error types for submission and task outcomes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::serde::TaskId;

/// Errors returned synchronously by engine operations. A call that fails
/// with one of these has not mutated engine state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Accepting the submission would close a dependency cycle.
    #[error("cyclic dependency involving task {0}")]
    CyclicDependency(TaskId),
    /// A dependency id is neither known nor part of the same batch.
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// Task being submitted.
        task: TaskId,
        /// Unresolved dependency.
        dependency: TaskId,
    },
    /// Submission rejected by load shedding; resubmit later.
    #[error("backpressure: {0}")]
    Backpressure(String),
    /// A caller-chosen id is already in use.
    #[error("task id {0} already submitted")]
    DuplicateTaskId(TaskId),
    /// A caller-chosen id was not handed out by `Engine::reserve_id`.
    #[error("task id {0} was not reserved")]
    UnreservedTaskId(TaskId),
    /// The engine no longer accepts work.
    #[error("engine is shutting down")]
    ShuttingDown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal failure such as a worker thread that could not be spawned.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Terminal failure kinds delivered through task handles.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TaskError {
    /// The payload returned an error on its final attempt.
    #[error("execution failed: {0}")]
    Execution(String),
    /// The final attempt exceeded its timeout.
    #[error("task timed out")]
    Timeout,
    /// The circuit for this key is open; the body did not run.
    #[error("circuit open for `{0}`")]
    CircuitOpen(String),
    /// Cancelled by the caller or by a failed dependency.
    #[error("task cancelled: {0}")]
    Cancelled(String),
    /// The task's deadline passed before it could start.
    #[error("deadline expired")]
    DeadlineExpired,
}

impl TaskError {
    /// Whether the retry policy applies to this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
