//! Task table and dependency graph, guarded together by one mutex.
//!
//! Everything here runs with the registry lock held and, where the ready
//! queue is touched, with the queue lock taken after it. Side effects that
//! may call user code (events, completions) are collected into [`Effects`]
//! and applied by the caller after both locks are released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::core::dag::DependencyGraph;
use crate::core::events::{build_task_event, TaskEvent};
use crate::core::handle::CompletionSlot;
use crate::core::worker_pool::DegradationLevel;
use crate::core::{EngineError, Task, TaskError, TaskResult, TaskState};
use crate::infra::queue::{ReadyEntry, ReadyQueue};
use crate::runtime::timer::{Timer, TimerKey};
use crate::util::serde::TaskId;

/// Engine-owned execution state of one task.
pub(crate) struct TaskRecord {
    pub(crate) task: Arc<Task>,
    pub(crate) state: TaskState,
    pub(crate) terminal: bool,
    pub(crate) attempts: u32,
    pub(crate) slot: Arc<CompletionSlot>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) cancel_requested: bool,
    pub(crate) retry_key: Option<TimerKey>,
    pub(crate) first_started: Option<Instant>,
    pub(crate) ready_at_ms: u128,
    pub(crate) last_error: Option<TaskError>,
}

impl TaskRecord {
    pub(crate) const fn new(task: Arc<Task>, slot: Arc<CompletionSlot>) -> Self {
        Self {
            task,
            state: TaskState::Pending,
            terminal: false,
            attempts: 0,
            slot,
            cancel: None,
            cancel_requested: false,
            retry_key: None,
            first_started: None,
            ready_at_ms: 0,
            last_error: None,
        }
    }

    pub(crate) fn event(&self, detail: Option<String>) -> TaskEvent {
        build_task_event(
            self.task.id,
            self.task.tenant.clone(),
            self.task.task_type.clone(),
            self.state,
            self.attempts,
            self.terminal,
            detail,
        )
    }
}

/// Deferred side effects of a registry transaction.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) events: Vec<TaskEvent>,
    pub(crate) completions: Vec<(Arc<CompletionSlot>, TaskResult)>,
    pub(crate) settled: Vec<(TaskState, Option<TaskError>)>,
    pub(crate) enqueued: usize,
    pub(crate) slots_released: usize,
}

/// Borrowed collaborators for one locked transaction.
pub(crate) struct Txn<'a> {
    pub(crate) ready: &'a mut ReadyQueue,
    pub(crate) timer: &'a Timer,
    pub(crate) level: DegradationLevel,
    pub(crate) now_ms: u128,
    pub(crate) fx: Effects,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) records: HashMap<TaskId, TaskRecord>,
    pub(crate) graph: DependencyGraph,
    pub(crate) idempotency: HashMap<String, TaskId>,
    pub(crate) deferred: VecDeque<TaskId>,
    /// Ids from `reserve_id` not yet submitted.
    pub(crate) reserved: HashSet<TaskId>,
    /// Terminal ids, oldest first, for eviction.
    pub(crate) finished: VecDeque<TaskId>,
    pub(crate) live: usize,
}

impl Registry {
    /// A caller-chosen id must come from `reserve_id` and not be in use.
    pub(crate) fn check_reserved(&self, id: TaskId) -> Result<(), EngineError> {
        if self.reserved.contains(&id) {
            Ok(())
        } else if self.records.contains_key(&id) || self.graph.contains(id) {
            Err(EngineError::DuplicateTaskId(id))
        } else {
            Err(EngineError::UnreservedTaskId(id))
        }
    }

    /// Move a task into the shared ready queue.
    pub(crate) fn enqueue(&mut self, id: TaskId, txn: &mut Txn<'_>) {
        let Some(rec) = self.records.get_mut(&id) else {
            return;
        };
        rec.state = TaskState::Ready;
        rec.ready_at_ms = txn.now_ms;
        txn.ready.push(ReadyEntry::new(Arc::clone(&rec.task), txn.now_ms));
        txn.fx.enqueued += 1;
        txn.fx.events.push(rec.event(None));
    }

    /// Put a task into a terminal state without touching the graph.
    /// Returns false if it was already terminal.
    pub(crate) fn settle(&mut self, id: TaskId, state: TaskState, result: TaskResult, txn: &mut Txn<'_>) -> bool {
        let Some(rec) = self.records.get_mut(&id) else {
            return false;
        };
        if rec.terminal {
            return false;
        }
        if rec.state == TaskState::Ready {
            txn.ready.remove(&rec.task);
        }
        if let Some(key) = rec.retry_key.take() {
            txn.timer.cancel(key);
        }
        if let Some(token) = rec.cancel.take() {
            token.cancel();
        }
        rec.state = state;
        rec.terminal = true;
        rec.last_error = result.as_ref().err().cloned();
        let detail = rec.last_error.as_ref().map(ToString::to_string);
        txn.fx.events.push(rec.event(detail));
        txn.fx.settled.push((state, rec.last_error.clone()));
        txn.fx.completions.push((Arc::clone(&rec.slot), result));
        let key = rec.task.idempotency_key.clone();

        if let Some(key) = key {
            if self.idempotency.get(&key) == Some(&id) {
                self.idempotency.remove(&key);
            }
        }
        self.finished.push_back(id);
        self.live = self.live.saturating_sub(1);
        true
    }

    /// Forget the oldest finished tasks beyond `retain`. Returns how many
    /// records were dropped.
    pub(crate) fn evict_terminal(&mut self, retain: usize) -> usize {
        let mut evicted = 0;
        while self.finished.len() > retain {
            let Some(id) = self.finished.pop_front() else {
                break;
            };
            self.graph.remove(id);
            if self.records.remove(&id).is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Terminal transition plus dependency propagation: success releases
    /// dependents whose last dependency this was, anything else cancels all
    /// transitive dependents.
    pub(crate) fn finish(&mut self, id: TaskId, state: TaskState, result: TaskResult, txn: &mut Txn<'_>) {
        if !self.settle(id, state, result, txn) {
            return;
        }
        if state == TaskState::Succeeded {
            for released in self.graph.mark_succeeded(id) {
                if txn.level.defers_released() {
                    self.deferred.push_back(released);
                } else {
                    self.enqueue(released, txn);
                }
            }
        } else {
            for dependent in self.graph.mark_failed(id) {
                let reason = TaskError::Cancelled(format!("dependency {id} did not succeed"));
                self.settle(dependent, TaskState::Cancelled, Err(reason), txn);
            }
        }
    }

    /// Enqueue released tasks that were held back under critical load.
    pub(crate) fn admit_deferred(&mut self, txn: &mut Txn<'_>) -> usize {
        let mut admitted = 0;
        while let Some(id) = self.deferred.pop_front() {
            let waiting = self
                .records
                .get(&id)
                .is_some_and(|r| !r.terminal && r.state == TaskState::Pending);
            if waiting {
                self.enqueue(id, txn);
                admitted += 1;
            }
        }
        admitted
    }
}
