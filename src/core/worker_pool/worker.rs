//! Worker thread loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::FutureExt;
use tracing::{debug, error, trace};

use super::{WorkerRecord, WorkerStatus};
use crate::core::engine::{Attempt, AttemptOutcome, EngineCore};
use crate::core::EngineError;
use crate::infra::queue::ReadyEntry;

pub(super) fn spawn_worker(core: Arc<EngineCore>, record: Arc<WorkerRecord>) -> Result<JoinHandle<()>, EngineError> {
    let worker_id = record.worker_id;
    thread::Builder::new()
        .name(format!("te-worker-{worker_id}"))
        .stack_size(core.config.pool.thread_stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");
            let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                    record.force_retire();
                    return;
                }
            };
            run(&core, &record, &rt);
            debug!(worker_id, "worker thread exiting");
        })
        .map_err(|e| EngineError::Internal(format!("failed to spawn worker {worker_id}: {e}")))
}

fn run(core: &EngineCore, record: &WorkerRecord, rt: &tokio::runtime::Runtime) {
    let park_timeout = core.config.pool.park_timeout();
    loop {
        if core.is_stopping() {
            break;
        }
        let seen = core.wake.generation();
        let retiring = record.status() == WorkerStatus::ShuttingDown;
        let next = record
            .local
            .pop_front()
            .or_else(|| if retiring { None } else { refill(core, record) })
            .or_else(|| if retiring { None } else { steal(core, record) });

        match next {
            Some(entry) => {
                record.set_current_task(Some(entry.id()));
                record.mark(WorkerStatus::Busy);
                rt.block_on(run_entry(core, record.worker_id, &entry));
                record.set_current_task(None);
                record.mark(WorkerStatus::Idle);
            }
            None if retiring => break,
            None => core.wake.park(seen, park_timeout),
        }
    }
}

/// Claim a batch from the shared queue: run the first, keep the rest local.
fn refill(core: &EngineCore, record: &WorkerRecord) -> Option<ReadyEntry> {
    let batch = core.ready.lock().pop_batch(core.config.pool.refill_batch);
    let mut batch = batch.into_iter();
    let first = batch.next()?;
    let rest: Vec<_> = batch.collect();
    if !rest.is_empty() {
        record.local.push_back_many(rest);
        // Idle peers can steal the surplus.
        core.wake.notify();
    }
    Some(first)
}

/// Take from the tail of a peer's deque, starting after our own id.
fn steal(core: &EngineCore, record: &WorkerRecord) -> Option<ReadyEntry> {
    let peers = core.workers.read().clone();
    let count = peers.len();
    let start = peers
        .iter()
        .position(|w| w.worker_id == record.worker_id)
        .map_or(0, |p| p + 1);
    for offset in 0..count {
        let peer = &peers[(start + offset) % count];
        if peer.worker_id == record.worker_id {
            continue;
        }
        if let Some(entry) = peer.local.steal_back() {
            core.counters.stolen.fetch_add(1, Ordering::Relaxed);
            trace!(worker_id = record.worker_id, victim = peer.worker_id, task_id = entry.id(), "stole task");
            return Some(entry);
        }
    }
    None
}

async fn run_entry(core: &EngineCore, worker_id: usize, entry: &ReadyEntry) {
    let Some(attempt) = core.claim(entry) else {
        return;
    };
    debug!(worker_id, task_id = attempt.task.id, attempt = attempt.number, "executing task");
    let outcome = execute(&attempt).await;
    debug!(worker_id, task_id = attempt.task.id, outcome = ?outcome_kind(&outcome), "attempt finished");
    core.complete_attempt(attempt, outcome);
}

/// Run one attempt under its timeout and cancellation token. Panics inside
/// the payload are caught and reported as failures.
pub(crate) async fn execute(attempt: &Attempt) -> AttemptOutcome {
    let payload = attempt.task.payload.execute(attempt.task.args.clone(), attempt.context());
    let guarded = AssertUnwindSafe(payload).catch_unwind();
    let outcome = tokio::select! {
        biased;
        () = attempt.token.cancelled() => AttemptOutcome::Interrupted,
        result = tokio::time::timeout(attempt.timeout, guarded) => match result {
            Err(_) => AttemptOutcome::TimedOut,
            Ok(Err(panic)) => AttemptOutcome::Failed(format!("payload panicked: {}", panic_message(panic.as_ref()))),
            Ok(Ok(Ok(value))) => AttemptOutcome::Succeeded(value),
            Ok(Ok(Err(err))) => AttemptOutcome::Failed(err.to_string()),
        },
    };
    if matches!(outcome, AttemptOutcome::TimedOut) {
        attempt.token.cancel();
    }
    outcome
}

fn outcome_kind(outcome: &AttemptOutcome) -> &'static str {
    match outcome {
        AttemptOutcome::Succeeded(_) => "succeeded",
        AttemptOutcome::Failed(_) => "failed",
        AttemptOutcome::TimedOut => "timed_out",
        AttemptOutcome::Interrupted => "interrupted",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
