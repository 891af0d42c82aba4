//! Task descriptions and lifecycle states.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{TaskError, TaskPayload};
use crate::util::serde::{Priority, TaskId, TenantId};

/// Task type used when a spec does not name one.
pub const DEFAULT_TASK_TYPE: &str = "default";

/// Tenant used when a spec does not name one.
pub const DEFAULT_TENANT: &str = "default";

/// Final value of a task as observed through its handle.
pub type TaskResult = Result<Value, TaskError>;

/// Lifecycle of a task. Owned exclusively by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on dependencies (or deferred admission).
    Pending,
    /// Queued for a worker.
    Ready,
    /// Assigned to a worker.
    Running,
    /// Finished with a value.
    Succeeded,
    /// Attempt failed; terminal once retries are exhausted.
    Failed,
    /// Removed before completion, or interrupted while running.
    Cancelled,
    /// Attempt exceeded its timeout; terminal once retries are exhausted.
    TimedOut,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Caller-facing description of work to submit.
#[derive(Clone)]
pub struct TaskSpec {
    /// Id from `Engine::reserve_id`, so batches can reference each other.
    /// Assigned by the engine when absent.
    pub id: Option<TaskId>,
    /// Routing class (for example `"compute"` or `"io"`).
    pub task_type: String,
    /// Ordering priority within the tenant's queue.
    pub priority: Priority,
    /// Tenant for fair scheduling.
    pub tenant: TenantId,
    /// The callable.
    pub payload: Arc<dyn TaskPayload>,
    /// Arguments passed to the payload on each attempt.
    pub args: Value,
    /// Tasks that must succeed before this one becomes ready.
    pub dependencies: Vec<TaskId>,
    /// Per-attempt (or overall) timeout; engine default when absent.
    pub timeout: Option<Duration>,
    /// Retries after the first attempt; engine default when absent.
    pub max_retries: Option<u32>,
    /// Latest start time relative to submission.
    pub deadline: Option<Duration>,
    /// Deduplicates submissions while the first task is live.
    pub idempotency_key: Option<String>,
    /// Circuit breaker key; defaults to the task type.
    pub circuit_key: Option<String>,
}

impl TaskSpec {
    /// Describe a task running `payload` with defaults for everything else.
    pub fn new(payload: Arc<dyn TaskPayload>) -> Self {
        Self {
            id: None,
            task_type: DEFAULT_TASK_TYPE.to_string(),
            priority: Priority::Normal,
            tenant: DEFAULT_TENANT.to_string(),
            payload,
            args: Value::Null,
            dependencies: Vec::new(),
            timeout: None,
            max_retries: None,
            deadline: None,
            idempotency_key: None,
            circuit_key: None,
        }
    }

    /// Use an id from `Engine::reserve_id`. Any other id is rejected at
    /// submission.
    #[must_use]
    pub const fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the routing class.
    #[must_use]
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Set payload arguments.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set a start deadline relative to submission.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Override the circuit breaker key.
    #[must_use]
    pub fn with_circuit_key(mut self, key: impl Into<String>) -> Self {
        self.circuit_key = Some(key.into());
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("tenant", &self.tenant)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// A submitted task. Immutable; execution state lives in the engine registry.
pub struct Task {
    /// Engine-unique id.
    pub id: TaskId,
    /// Routing class.
    pub task_type: String,
    /// Partition the type routes to.
    pub partition: String,
    /// Priority at submission.
    pub priority: Priority,
    /// Owning tenant.
    pub tenant: TenantId,
    /// The callable.
    pub payload: Arc<dyn TaskPayload>,
    /// Payload arguments.
    pub args: Value,
    /// Dependency ids.
    pub dependencies: Vec<TaskId>,
    /// Resolved timeout.
    pub timeout: Duration,
    /// Resolved retry budget.
    pub max_retries: u32,
    /// Absolute start deadline, milliseconds since epoch.
    pub deadline_ms: Option<u128>,
    /// Circuit breaker key.
    pub circuit_key: String,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Submission time, milliseconds since epoch.
    pub created_at_ms: u128,
    /// Submission order, used as the FIFO tie-breaker.
    pub seq: u64,
}

impl Task {
    /// Total attempts allowed, first attempt included.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("partition", &self.partition)
            .field("priority", &self.priority)
            .field("tenant", &self.tenant)
            .field("dependencies", &self.dependencies)
            .field("max_retries", &self.max_retries)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::payload_fn;

    #[test]
    fn test_spec_defaults() {
        let spec = TaskSpec::new(payload_fn(|args, _ctx| async move { Ok(args) }));
        assert_eq!(spec.task_type, DEFAULT_TASK_TYPE);
        assert_eq!(spec.tenant, DEFAULT_TENANT);
        assert_eq!(spec.priority, Priority::Normal);
        assert!(spec.dependencies.is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TaskState::TimedOut.to_string(), "timed_out");
        assert_eq!(TaskState::Ready.to_string(), "ready");
    }
}
