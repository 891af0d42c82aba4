//! API-facing response models built from a running engine.
//!
//! These are plain serializable views; wiring them to an HTTP framework is
//! left to the embedding application.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{DegradationLevel, Engine, TaskError, TaskState};
use crate::util::serde::TaskId;

/// Task status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Task identifier.
    pub task_id: TaskId,
    /// Current state.
    pub state: TaskState,
    /// Whether the state is final.
    pub terminal: bool,
    /// Attempts started so far.
    pub attempts: u32,
    /// Optional reason for failure or cancellation.
    pub reason: Option<String>,
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Accepting work and not shedding at the critical level.
    pub ok: bool,
    /// Current load level.
    pub degradation_level: DegradationLevel,
    /// Workers not retiring.
    pub active_workers: usize,
    /// Entries waiting in shared and local queues.
    pub queued: usize,
    /// Tasks not yet terminal.
    pub live_tasks: usize,
    /// Per-partition shared queue depth.
    pub queue_depths: BTreeMap<String, usize>,
}

/// Build the health view of `engine`.
#[must_use]
pub fn health(engine: &Engine) -> Health {
    let stats = engine.stats();
    Health {
        ok: engine.is_accepting() && stats.degradation_level < DegradationLevel::Critical,
        degradation_level: stats.degradation_level,
        active_workers: stats.active_workers,
        queued: stats.total_queued(),
        live_tasks: stats.live_tasks,
        queue_depths: stats.queue_depths,
    }
}

/// Look up one task. `None` for unknown ids.
#[must_use]
pub fn task_status(engine: &Engine, task_id: TaskId) -> Option<TaskStatusResponse> {
    engine.status(task_id).map(|info| TaskStatusResponse {
        task_id,
        state: info.state,
        terminal: info.terminal,
        attempts: info.attempts,
        reason: info.last_error.as_ref().map(TaskError::to_string),
    })
}
