//! Engine facade.
//!
//! [`Engine`] is the public entry point: it combines submission, routing, DAG
//! admission and backpressure, and owns the pool manager. Clones share one
//! engine; the workers stop once the last clone is dropped or
//! [`Engine::shutdown`] is called.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_task_engine::config::EngineConfig;
//! use prometheus_task_engine::core::{payload_fn, Engine, TaskSpec};
//! use serde_json::json;
//!
//! let engine = Engine::new(EngineConfig::default().with_workers(2, 8))?;
//! let double = payload_fn(|args, _ctx| async move { Ok(json!(args.as_i64().unwrap_or(0) * 2)) });
//!
//! let a = engine.reserve_id();
//! let handles = engine.submit_batch(vec![
//!     TaskSpec::new(double.clone()).with_id(a).with_args(json!(21)),
//!     TaskSpec::new(double).depends_on(a).with_args(json!(1)),
//! ])?;
//! assert_eq!(handles[0].wait()?, json!(42));
//! engine.shutdown();
//! ```

mod registry;
mod shared;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

pub(crate) use shared::{Attempt, AttemptOutcome, EngineCore};

use crate::config::EngineConfig;
use crate::core::events::EventSink;
use crate::core::resilience::CircuitState;
use crate::core::worker_pool::{DegradationLevel, ManagerHandle, PoolManager, WorkerSnapshot, WorkerStatus};
use crate::core::{EngineError, TaskError, TaskHandle, TaskSpec, TaskState};
use crate::runtime::timer::Timer;
use crate::util::clock::{Clock, SystemClock};
use crate::util::serde::{IdGenerator, Priority, SequentialIds, TaskId};

/// Monotonic engine counters (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub deduplicated: AtomicU64,
    pub attempts: AtomicU64,
    pub retries: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub cancelled: AtomicU64,
    pub deadline_expired: AtomicU64,
    pub circuit_rejected: AtomicU64,
    pub stolen: AtomicU64,
    pub boosted: AtomicU64,
    pub workers_spawned: AtomicU64,
    pub workers_retired: AtomicU64,
    pub samples: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn record_terminal(&self, state: TaskState, error: Option<&TaskError>) {
        let counter = match state {
            TaskState::Succeeded => &self.succeeded,
            TaskState::Failed => &self.failed,
            TaskState::TimedOut => &self.timed_out,
            TaskState::Cancelled => &self.cancelled,
            TaskState::Pending | TaskState::Ready | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        match error {
            Some(TaskError::DeadlineExpired) => {
                self.deadline_expired.fetch_add(1, Ordering::Relaxed);
            }
            Some(TaskError::CircuitOpen(_)) => {
                self.circuit_rejected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Get a snapshot of current counters.
    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            submitted: load(&self.submitted),
            rejected: load(&self.rejected),
            deduplicated: load(&self.deduplicated),
            attempts: load(&self.attempts),
            retries: load(&self.retries),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            timed_out: load(&self.timed_out),
            cancelled: load(&self.cancelled),
            deadline_expired: load(&self.deadline_expired),
            circuit_rejected: load(&self.circuit_rejected),
            stolen: load(&self.stolen),
            boosted: load(&self.boosted),
            workers_spawned: load(&self.workers_spawned),
            workers_retired: load(&self.workers_retired),
            samples: load(&self.samples),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Tasks accepted (deduplicated submissions excluded).
    pub submitted: u64,
    /// Submissions rejected with backpressure.
    pub rejected: u64,
    /// Submissions answered with an existing task's handle.
    pub deduplicated: u64,
    /// Attempts executed.
    pub attempts: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Tasks that ended `Succeeded`.
    pub succeeded: u64,
    /// Tasks that ended `Failed`.
    pub failed: u64,
    /// Tasks that ended `TimedOut`.
    pub timed_out: u64,
    /// Tasks that ended `Cancelled`.
    pub cancelled: u64,
    /// Cancellations caused by a missed start deadline.
    pub deadline_expired: u64,
    /// Failures caused by an open circuit.
    pub circuit_rejected: u64,
    /// Entries taken from a peer's deque.
    pub stolen: u64,
    /// Priority boosts applied by aging.
    pub boosted: u64,
    /// Workers started, initial ones included.
    pub workers_spawned: u64,
    /// Workers retired by scale-down.
    pub workers_retired: u64,
    /// Pool manager samples taken.
    pub samples: u64,
}

/// Engine-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Entries in the shared queue per partition.
    pub queue_depths: BTreeMap<String, usize>,
    /// Entries in each worker's deque, by worker id.
    pub local_depths: BTreeMap<usize, usize>,
    /// Workers not retiring.
    pub active_workers: usize,
    /// Workers currently running a task.
    pub busy_workers: usize,
    /// Per-worker detail.
    pub workers: Vec<WorkerSnapshot>,
    /// Circuit state per key.
    pub circuit_states: BTreeMap<String, CircuitState>,
    /// Current load level.
    pub degradation_level: DegradationLevel,
    /// Smoothed wait between ready and running, in milliseconds.
    pub queue_latency_ms: u64,
    /// Tasks not yet terminal.
    pub live_tasks: usize,
    /// Released dependents held back under critical load.
    pub deferred_tasks: usize,
    /// Finished tasks still queryable through `status()`.
    pub retained_tasks: usize,
    /// Monotonic counters.
    pub counters: CounterSnapshot,
}

impl EngineStats {
    /// Total entries waiting in shared and local queues.
    #[must_use]
    pub fn total_queued(&self) -> usize {
        self.queue_depths.values().sum::<usize>() + self.local_depths.values().sum::<usize>()
    }
}

/// Snapshot of one task's execution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task id.
    pub id: TaskId,
    /// Current state.
    pub state: TaskState,
    /// Whether the state is final.
    pub terminal: bool,
    /// Attempts started.
    pub attempts: u32,
    /// Owning tenant.
    pub tenant: String,
    /// Task type.
    pub task_type: String,
    /// Partition the type routed to.
    pub partition: String,
    /// Submitted priority.
    pub priority: Priority,
    /// Most recent failure, if any.
    pub last_error: Option<TaskError>,
}

struct EngineInner {
    core: Arc<EngineCore>,
    manager: Mutex<Option<ManagerHandle>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        // Signal only; joining here could block an arbitrary caller.
        self.core.begin_shutdown();
        self.core.stop_workers();
        if let Some(manager) = self.manager.lock().as_ref() {
            manager.signal_shutdown();
        }
        self.core.timer.shutdown();
    }
}

/// The task execution engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start an engine with the system clock and sequential ids.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for invalid settings, `Internal` if threads cannot be
    /// spawned.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(SequentialIds::default()), Vec::new())
    }

    /// Start an engine with explicit collaborators.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::new`].
    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let core = EngineCore::new(config, clock, ids)?;
        for sink in sinks {
            core.subscribe(sink);
        }
        let manager = PoolManager::start(Arc::clone(&core))?;
        info!(
            min_workers = core.config.pool.min_workers,
            max_workers = core.config.pool.max_workers,
            partitions = core.config.partitions.len(),
            "engine started"
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                core,
                manager: Mutex::new(Some(manager)),
            }),
        })
    }

    fn core(&self) -> &EngineCore {
        &self.inner.core
    }

    /// Submit one task. Never blocks on execution.
    ///
    /// # Errors
    ///
    /// `CyclicDependency`, `UnknownDependency`, `DuplicateTaskId`,
    /// `UnreservedTaskId`, `Backpressure` or `ShuttingDown`. No state changes on error.
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskHandle, EngineError> {
        self.submit_batch(vec![spec])?
            .pop()
            .ok_or_else(|| EngineError::Internal("submission produced no handle".into()))
    }

    /// Submit tasks atomically; members may depend on each other through
    /// ids obtained from [`Engine::reserve_id`]. Handles come back in input
    /// order.
    ///
    /// # Errors
    ///
    /// As [`Engine::submit`]; one invalid member rejects the whole batch.
    pub fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskHandle>, EngineError> {
        self.core().submit_batch(specs)
    }

    /// Allocate an id for a task to be submitted later with
    /// [`TaskSpec::with_id`]. Only reserved ids are accepted there, each once.
    #[must_use]
    pub fn reserve_id(&self) -> TaskId {
        self.core().reserve_id()
    }

    /// Cancel a task. Returns true if it was removed before running (and its
    /// dependents cancelled); false if it is already terminal or running, in
    /// which case a running attempt is sent a best-effort interrupt.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        self.cancel_task(handle.id())
    }

    /// [`Engine::cancel`] by id.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.core().cancel(id)
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.core().subscribe(sink);
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let core = self.core();
        let queue_depths = core.ready.lock().depths();
        let workers: Vec<WorkerSnapshot> = core.workers.read().iter().map(|w| WorkerSnapshot::of(w)).collect();
        let (live_tasks, deferred_tasks, retained_tasks) = core.task_counts();
        EngineStats {
            queue_depths,
            local_depths: workers.iter().map(|w| (w.worker_id, w.local_depth)).collect(),
            active_workers: workers.iter().filter(|w| w.status != WorkerStatus::ShuttingDown).count(),
            busy_workers: workers.iter().filter(|w| w.status == WorkerStatus::Busy).count(),
            workers,
            circuit_states: core.circuits.states(),
            degradation_level: core.level(),
            queue_latency_ms: core.queue_latency_ms(),
            live_tasks,
            deferred_tasks,
            retained_tasks,
            counters: core.counters.snapshot(),
        }
    }

    /// Execution state of a task, if the id is known.
    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<TaskInfo> {
        self.core().status(id)
    }

    /// Current load level.
    #[must_use]
    pub fn degradation_level(&self) -> DegradationLevel {
        self.core().level()
    }

    /// Whether submissions are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.core().is_accepting()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.core().config
    }

    /// Wait until every submitted task is terminal. Returns false on timeout.
    #[must_use]
    pub fn drain(&self, timeout: Duration) -> bool {
        self.core().drain(timeout)
    }

    /// Stop accepting work, cancel live tasks, and stop all threads.
    /// Idempotent.
    pub fn shutdown(&self) {
        let core = self.core();
        core.begin_shutdown();
        core.stop_workers();
        let manager = self.inner.manager.lock().take();
        if let Some(mut manager) = manager {
            manager.shutdown();
            info!("engine shut down");
        }
        core.timer.shutdown();
    }

    pub(crate) fn timer(&self) -> &Timer {
        &self.core().timer
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("accepting", &self.is_accepting())
            .field("degradation_level", &self.degradation_level())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = EngineCounters::default();
        counters.submitted.fetch_add(10, Ordering::Relaxed);
        counters.record_terminal(TaskState::Succeeded, None);
        counters.record_terminal(TaskState::Cancelled, Some(&TaskError::DeadlineExpired));
        counters.record_terminal(TaskState::Failed, Some(&TaskError::CircuitOpen("k".into())));
        counters.record_terminal(TaskState::Running, None);

        let snap = counters.snapshot();
        assert_eq!(snap.submitted, 10);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.deadline_expired, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.circuit_rejected, 1);
    }
}
