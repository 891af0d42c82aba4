//! Worker pool with work-stealing and a scaling manager.
//!
//! Workers are dedicated OS threads, each driving payload futures on its own
//! current-thread tokio runtime so CPU-heavy work never blocks the caller's
//! runtime. A worker looks for work in this order:
//!
//! 1. its own deque (head),
//! 2. a small batch from the shared ready queue (first runs, rest go to the
//!    tail of its deque),
//! 3. the tails of its peers' deques, round-robin from the next worker id.
//!
//! Only when all three come up empty does it park on the [`WakeSignal`].
//!
//! The pool manager is the only writer of the worker set. It samples queue
//! depth every `sample_interval`, spawns or retires workers, recomputes the
//! degradation level and runs queue upkeep.

pub mod scaling;
pub mod shedding;
mod worker;

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::engine::EngineCore;
use crate::core::EngineError;
use crate::infra::queue::WorkerDeque;
use crate::util::serde::TaskId;

pub use scaling::{ScalingController, ScalingDecision};
pub use shedding::DegradationLevel;

/// How long shutdown waits for each worker thread before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Looking for work or parked.
    Idle,
    /// Running a task.
    Busy,
    /// Retiring: drains its own deque, then exits.
    ShuttingDown,
}

/// Per-worker state shared between the worker thread, its peers and the
/// manager. A worker mutates only its own current task and deque.
pub(crate) struct WorkerRecord {
    pub(crate) worker_id: usize,
    status: Mutex<WorkerStatus>,
    pub(crate) local: WorkerDeque,
    current_task: Mutex<Option<TaskId>>,
}

impl WorkerRecord {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            status: Mutex::new(WorkerStatus::Idle),
            local: WorkerDeque::new(),
            current_task: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    /// Owner-side update; never overrides a retirement.
    fn mark(&self, status: WorkerStatus) {
        let mut current = self.status.lock();
        if *current != WorkerStatus::ShuttingDown {
            *current = status;
        }
    }

    fn retire_if_idle(&self) -> bool {
        let mut current = self.status.lock();
        if *current == WorkerStatus::Idle {
            *current = WorkerStatus::ShuttingDown;
            true
        } else {
            false
        }
    }

    fn force_retire(&self) {
        *self.status.lock() = WorkerStatus::ShuttingDown;
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        *self.current_task.lock()
    }

    fn set_current_task(&self, task: Option<TaskId>) {
        *self.current_task.lock() = task;
    }
}

/// Observable view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Worker id, unique for the engine's lifetime.
    pub worker_id: usize,
    /// Current status.
    pub status: WorkerStatus,
    /// Entries in the worker's deque.
    pub local_depth: usize,
    /// Task being executed, if any.
    pub current_task: Option<TaskId>,
}

impl WorkerSnapshot {
    pub(crate) fn of(record: &WorkerRecord) -> Self {
        Self {
            worker_id: record.worker_id,
            status: record.status(),
            local_depth: record.local.len(),
            current_task: record.current_task(),
        }
    }
}

/// Wake-up signal for parked workers.
///
/// The generation counter closes the gap between "found nothing" and
/// "parked": a worker reads the generation before scanning and only parks if
/// it is unchanged.
#[derive(Default)]
pub(crate) struct WakeSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl WakeSignal {
    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn notify(&self) {
        *self.generation.lock() += 1;
        self.condvar.notify_all();
    }

    pub(crate) fn park(&self, seen: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation == seen {
            let _ = self.condvar.wait_for(&mut generation, timeout);
        }
    }
}

/// Commands accepted by the manager thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolCommand {
    Shutdown,
}

/// Owner side of the manager thread.
pub(crate) struct ManagerHandle {
    commands: Sender<PoolCommand>,
    thread: Option<JoinHandle<()>>,
}

impl ManagerHandle {
    /// Ask the manager to stop its workers and exit.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.commands.send(PoolCommand::Shutdown);
    }

    /// Signal and wait for the manager (and through it, the workers).
    pub(crate) fn shutdown(&mut self) {
        self.signal_shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("pool manager thread panicked");
            }
        }
    }
}

struct WorkerThread {
    record: Arc<WorkerRecord>,
    handle: JoinHandle<()>,
}

/// Single writer of the worker set.
pub(crate) struct PoolManager {
    core: Arc<EngineCore>,
    commands: Receiver<PoolCommand>,
    scaling: ScalingController,
    threads: Vec<WorkerThread>,
    next_worker_id: usize,
}

impl PoolManager {
    /// Spawn `min_workers` and the manager thread.
    pub(crate) fn start(core: Arc<EngineCore>) -> Result<ManagerHandle, EngineError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut manager = Self {
            scaling: ScalingController::new(&core.config.pool),
            core,
            commands: rx,
            threads: Vec::new(),
            next_worker_id: 0,
        };
        for _ in 0..manager.core.config.pool.min_workers {
            if let Err(err) = manager.spawn_one() {
                manager.stop_workers();
                return Err(err);
            }
        }
        let worker_count = manager.threads.len();
        let thread = thread::Builder::new()
            .name("te-pool-manager".into())
            .spawn(move || manager.run())
            .map_err(|e| EngineError::Internal(format!("failed to spawn pool manager: {e}")))?;
        info!(worker_count, "worker pool started");
        Ok(ManagerHandle {
            commands: tx,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let interval = self.core.config.pool.sample_interval();
        loop {
            match self.commands.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => self.sample(),
                Ok(PoolCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.stop_workers();
    }

    fn active_count(&self) -> usize {
        self.threads
            .iter()
            .filter(|w| w.record.status() != WorkerStatus::ShuttingDown)
            .count()
    }

    fn sample(&mut self) {
        self.reap();
        let min_workers = self.core.config.pool.min_workers;
        while self.active_count() < min_workers && !self.core.is_stopping() {
            if let Err(err) = self.spawn_one() {
                warn!(error = %err, "could not restore minimum worker count");
                break;
            }
        }

        let depth = self.core.queued_depth();
        let active = self.active_count();
        let level = self.core.update_level(depth);
        match self.scaling.observe(depth, active) {
            ScalingDecision::SpawnOne => match self.spawn_one() {
                Ok(worker_id) => info!(worker_id, depth, active = active + 1, "scaled up"),
                Err(err) => warn!(error = %err, "scale-up failed"),
            },
            ScalingDecision::RetireOne => {
                if let Some(worker_id) = self.retire_one() {
                    self.scaling.retired();
                    info!(worker_id, depth, active = active - 1, "scaling down");
                }
            }
            ScalingDecision::Hold => {}
        }
        self.core.maintain(level);
        self.core.counters.samples.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn spawn_one(&mut self) -> Result<usize, EngineError> {
        let worker_id = self.next_worker_id;
        let record = Arc::new(WorkerRecord::new(worker_id));
        self.core.workers.write().push(Arc::clone(&record));
        match worker::spawn_worker(Arc::clone(&self.core), Arc::clone(&record)) {
            Ok(handle) => {
                self.next_worker_id += 1;
                self.threads.push(WorkerThread { record, handle });
                self.core
                    .counters
                    .workers_spawned
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(worker_id)
            }
            Err(err) => {
                self.core.workers.write().retain(|w| w.worker_id != worker_id);
                Err(err)
            }
        }
    }

    /// Mark the highest-numbered idle worker as retiring.
    fn retire_one(&mut self) -> Option<usize> {
        let worker_id = self
            .threads
            .iter()
            .rev()
            .find(|w| w.record.retire_if_idle())
            .map(|w| w.record.worker_id)?;
        self.core.wake.notify();
        self.core
            .counters
            .workers_retired
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Some(worker_id)
    }

    /// Join exited workers and drop them from the worker set.
    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.threads)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.threads = running;
        for worker in finished {
            let worker_id = worker.record.worker_id;
            self.core.workers.write().retain(|w| w.worker_id != worker_id);
            if worker.handle.join().is_err() {
                warn!(worker_id, "worker thread panicked");
            }
            if worker.record.status() != WorkerStatus::ShuttingDown {
                warn!(worker_id, "worker exited unexpectedly");
            }
            self.core.requeue_orphans(worker.record.local.drain());
            debug!(worker_id, "worker reaped");
        }
    }

    fn stop_workers(&mut self) {
        self.core.stop_workers();
        let worker_count = self.threads.len();
        for worker in self.threads.drain(..) {
            worker.record.force_retire();
            let worker_id = worker.record.worker_id;
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !worker.handle.is_finished() && Instant::now() < deadline {
                self.core.wake.notify();
                thread::sleep(Duration::from_millis(5));
            }
            if worker.handle.is_finished() {
                if worker.handle.join().is_err() {
                    warn!(worker_id, "worker thread panicked");
                }
            } else {
                warn!(worker_id, "worker did not exit within timeout - detaching");
            }
        }
        self.core.workers.write().clear();
        info!(worker_count, "worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_only_idle_workers() {
        let record = WorkerRecord::new(0);
        record.mark(WorkerStatus::Busy);
        assert!(!record.retire_if_idle());
        record.mark(WorkerStatus::Idle);
        assert!(record.retire_if_idle());
        record.mark(WorkerStatus::Busy);
        assert_eq!(record.status(), WorkerStatus::ShuttingDown);
    }

    #[test]
    fn test_park_skips_when_generation_moved() {
        let signal = WakeSignal::default();
        let seen = signal.generation();
        signal.notify();
        let start = Instant::now();
        signal.park(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_park_times_out() {
        let signal = WakeSignal::default();
        let seen = signal.generation();
        let start = Instant::now();
        signal.park(seen, Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_snapshot_reflects_record() {
        let record = WorkerRecord::new(3);
        record.set_current_task(Some(42));
        let snap = WorkerSnapshot::of(&record);
        assert_eq!(snap.worker_id, 3);
        assert_eq!(snap.current_task, Some(42));
        assert_eq!(snap.local_depth, 0);
    }
}
