//! State shared by the facade, the workers and the pool manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{Effects, Registry, TaskRecord, Txn};
use super::{EngineCounters, TaskInfo};
use crate::config::{EngineConfig, TimeoutPolicy};
use crate::core::dag::{Admission, NewNode};
use crate::core::events::{EventBus, EventSink};
use crate::core::handle::CompletionSlot;
use crate::core::resilience::{CircuitPermit, CircuitRegistry, RetryPolicy};
use crate::core::worker_pool::{shedding, DegradationLevel, WakeSignal, WorkerRecord};
use crate::core::{EngineError, ExecutionContext, Task, TaskError, TaskHandle, TaskSpec, TaskState};
use crate::infra::queue::{ReadyEntry, ReadyQueue};
use crate::runtime::timer::Timer;
use crate::util::clock::Clock;
use crate::util::serde::{IdGenerator, TaskId};

/// A claimed attempt, handed from the registry to a worker.
pub(crate) struct Attempt {
    pub(crate) task: Arc<Task>,
    pub(crate) number: u32,
    pub(crate) timeout: Duration,
    pub(crate) token: CancellationToken,
    pub(crate) permit: CircuitPermit,
    pub(crate) degraded: bool,
}

impl Attempt {
    pub(crate) fn context(&self) -> ExecutionContext {
        ExecutionContext::new(
            self.task.id,
            self.number,
            self.task.tenant.clone(),
            self.task.task_type.clone(),
            self.degraded,
            self.token.clone(),
        )
    }
}

/// How an attempt ended, as seen by the worker.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
    TimedOut,
    Interrupted,
}

enum ClaimDecision {
    Stale,
    Expired,
    Rejected(TaskError),
    Run(Attempt),
}

pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    registry: Mutex<Registry>,
    drained: Condvar,
    pub(crate) ready: Mutex<ReadyQueue>,
    pub(crate) wake: WakeSignal,
    pub(crate) workers: RwLock<Vec<Arc<WorkerRecord>>>,
    pub(crate) circuits: CircuitRegistry,
    retry: RetryPolicy,
    events: EventBus,
    pub(crate) counters: EngineCounters,
    pub(crate) timer: Timer,
    pub(crate) clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    level: AtomicU8,
    queue_latency_ms: AtomicU64,
    accepting: AtomicBool,
    stopping: AtomicBool,
    seq: AtomicU64,
    weak_self: Weak<Self>,
}

impl EngineCore {
    pub(crate) fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Arc<Self>, EngineError> {
        let timer = Timer::start("te-timer")?;
        let ready = ReadyQueue::new(&config);
        let circuits = CircuitRegistry::new(config.circuit_breaker.clone());
        let retry = RetryPolicy::from_config(&config.retry);
        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            registry: Mutex::new(Registry::default()),
            drained: Condvar::new(),
            ready: Mutex::new(ready),
            wake: WakeSignal::default(),
            workers: RwLock::new(Vec::new()),
            circuits,
            retry,
            events: EventBus::default(),
            counters: EngineCounters::default(),
            timer,
            clock,
            ids,
            level: AtomicU8::new(DegradationLevel::Normal.as_u8()),
            queue_latency_ms: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        }))
    }

    pub(crate) fn level(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Hand out an id for a later `TaskSpec::with_id`.
    pub(crate) fn reserve_id(&self) -> TaskId {
        let id = self.ids.next_id();
        self.registry.lock().reserved.insert(id);
        id
    }

    pub(crate) fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.events.subscribe(sink);
    }

    /// Entries waiting in the shared queue and in every worker's deque.
    pub(crate) fn queued_depth(&self) -> usize {
        let shared = self.ready.lock().len();
        let local: usize = self.workers.read().iter().map(|w| w.local.len()).sum();
        shared + local
    }

    pub(crate) fn queue_latency_ms(&self) -> u64 {
        self.queue_latency_ms.load(Ordering::Relaxed)
    }

    fn observe_latency(&self, wait_ms: u64) {
        let old = self.queue_latency_ms.load(Ordering::Relaxed);
        let smoothed = if old == 0 { wait_ms } else { (old * 7 + wait_ms) / 8 };
        self.queue_latency_ms.store(smoothed, Ordering::Relaxed);
    }

    fn txn<'a>(&'a self, ready: &'a mut ReadyQueue) -> Txn<'a> {
        Txn {
            ready,
            timer: &self.timer,
            level: self.level(),
            now_ms: self.clock.now_ms(),
            fx: Effects::default(),
        }
    }

    /// Publish events, wake workers and resolve handles. Never called with an
    /// engine lock held.
    fn apply(&self, fx: Effects) {
        if fx.enqueued > 0 || fx.slots_released > 0 {
            self.wake.notify();
        }
        for (state, error) in &fx.settled {
            self.counters.record_terminal(*state, error.as_ref());
        }
        if !fx.settled.is_empty() {
            self.drained.notify_all();
        }
        self.events.publish(&fx.events);
        for (slot, result) in fx.completions {
            slot.complete(result);
        }
    }

    // ---- submission ----

    pub(crate) fn submit_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskHandle>, EngineError> {
        if !self.is_accepting() {
            return Err(EngineError::ShuttingDown);
        }
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let partitions: Vec<String> = {
            let ready = self.ready.lock();
            specs.iter().map(|s| ready.route(&s.task_type).to_string()).collect()
        };
        let level = self.level();
        let depth = self.queued_depth();
        for spec in &specs {
            if let Err(err) = shedding::admit(spec.priority, level, depth, specs.len(), &self.config.shedding) {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(level = %level, depth, error = %err, "submission rejected");
                return Err(err);
            }
        }

        let now_ms = self.clock.now_ms();
        let mut reg = self.registry.lock();

        // Resolve idempotency keys first so batch members can depend on an
        // existing task through the key's original id.
        let mut handles: Vec<Option<TaskHandle>> = vec![None; specs.len()];
        let mut aliases: HashMap<TaskId, TaskId> = HashMap::new();
        let mut batch_keys: HashMap<&str, TaskId> = HashMap::new();
        let mut duplicates: Vec<(usize, TaskId)> = Vec::new();
        let mut fresh: Vec<(usize, TaskId)> = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if let Some(own) = spec.id {
                reg.check_reserved(own)?;
            }
            if let Some(key) = spec.idempotency_key.as_deref() {
                let live = reg
                    .idempotency
                    .get(key)
                    .and_then(|id| reg.records.get(id))
                    .filter(|r| !r.terminal)
                    .map(|r| TaskHandle::new(r.task.id, Arc::clone(&r.slot)));
                if let Some(handle) = live {
                    if let Some(own) = spec.id {
                        aliases.insert(own, handle.id());
                    }
                    handles[i] = Some(handle);
                    continue;
                }
                if let Some(&existing) = batch_keys.get(key) {
                    if let Some(own) = spec.id {
                        aliases.insert(own, existing);
                    }
                    duplicates.push((i, existing));
                    continue;
                }
            }
            let id = spec.id.unwrap_or_else(|| self.ids.next_id());
            if let Some(key) = spec.idempotency_key.as_deref() {
                batch_keys.insert(key, id);
            }
            fresh.push((i, id));
        }

        let nodes: Vec<NewNode> = fresh
            .iter()
            .map(|&(i, id)| NewNode {
                id,
                dependencies: specs[i]
                    .dependencies
                    .iter()
                    .map(|d| aliases.get(d).copied().unwrap_or(*d))
                    .collect(),
            })
            .collect();
        let order = reg.graph.validate(&nodes)?;
        for own in specs.iter().filter_map(|s| s.id) {
            reg.reserved.remove(&own);
        }

        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);
        for k in order {
            let (i, id) = fresh[k];
            let spec = &specs[i];
            let task = Arc::new(Task {
                id,
                task_type: spec.task_type.clone(),
                partition: partitions[i].clone(),
                priority: spec.priority,
                tenant: spec.tenant.clone(),
                payload: Arc::clone(&spec.payload),
                args: spec.args.clone(),
                dependencies: nodes[k].dependencies.clone(),
                timeout: spec.timeout.unwrap_or_else(|| self.config.default_timeout()),
                max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
                deadline_ms: spec.deadline.map(|d| now_ms + d.as_millis()),
                circuit_key: spec.circuit_key.clone().unwrap_or_else(|| spec.task_type.clone()),
                idempotency_key: spec.idempotency_key.clone(),
                created_at_ms: now_ms,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            });
            let slot = Arc::new(CompletionSlot::default());
            handles[i] = Some(TaskHandle::new(id, Arc::clone(&slot)));
            if let Some(key) = &spec.idempotency_key {
                reg.idempotency.insert(key.clone(), id);
            }
            reg.records.insert(id, TaskRecord::new(task, slot));
            reg.live += 1;

            match reg.graph.insert(&nodes[k]) {
                Admission::Ready => reg.enqueue(id, &mut txn),
                Admission::Pending(unmet) => {
                    if let Some(rec) = reg.records.get(&id) {
                        txn.fx.events.push(rec.event(Some(format!("waiting on {unmet} dependencies"))));
                    }
                }
                Admission::Doomed => {
                    let reason = TaskError::Cancelled("dependency did not succeed".into());
                    reg.settle(id, TaskState::Cancelled, Err(reason), &mut txn);
                }
            }
        }
        for (i, id) in duplicates {
            handles[i] = reg
                .records
                .get(&id)
                .map(|r| TaskHandle::new(id, Arc::clone(&r.slot)));
        }
        let fx = txn.fx;
        drop(ready);
        drop(reg);

        self.counters.submitted.fetch_add(fresh.len() as u64, Ordering::Relaxed);
        let deduplicated = specs.len() - fresh.len();
        if deduplicated > 0 {
            self.counters.deduplicated.fetch_add(deduplicated as u64, Ordering::Relaxed);
        }
        debug!(submitted = fresh.len(), deduplicated, "batch admitted");
        self.apply(fx);
        Ok(handles.into_iter().flatten().collect())
    }

    // ---- execution ----

    /// Ready → Running under the registry lock. Returns `None` when the
    /// entry is stale or the task ended at claim time; the partition slot is
    /// released in that case.
    pub(crate) fn claim(&self, entry: &ReadyEntry) -> Option<Attempt> {
        let id = entry.id();
        let now = self.clock.now();
        let mut reg = self.registry.lock();
        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);

        let decision = match reg.records.get_mut(&id) {
            None => ClaimDecision::Stale,
            Some(rec) if rec.terminal || rec.state != TaskState::Ready => ClaimDecision::Stale,
            Some(rec) if rec.task.deadline_ms.is_some_and(|d| d <= txn.now_ms) => ClaimDecision::Expired,
            Some(rec) => match self.circuits.try_acquire(&rec.task.circuit_key, now) {
                Err(err) => ClaimDecision::Rejected(err),
                Ok(permit) => {
                    let first = *rec.first_started.get_or_insert(now);
                    let timeout = match self.config.timeout_policy {
                        TimeoutPolicy::PerAttempt => rec.task.timeout,
                        TimeoutPolicy::Overall => rec.task.timeout.saturating_sub(now.saturating_duration_since(first)),
                    };
                    let token = CancellationToken::new();
                    rec.state = TaskState::Running;
                    rec.attempts += 1;
                    rec.cancel = Some(token.clone());
                    let waited = txn.now_ms.saturating_sub(rec.ready_at_ms);
                    self.observe_latency(u64::try_from(waited).unwrap_or(u64::MAX));
                    txn.fx.events.push(rec.event(None));
                    ClaimDecision::Run(Attempt {
                        task: Arc::clone(&rec.task),
                        number: rec.attempts,
                        timeout,
                        token,
                        permit,
                        degraded: txn.level.is_degraded(),
                    })
                }
            },
        };

        let attempt = match decision {
            ClaimDecision::Run(attempt) => Some(attempt),
            ClaimDecision::Stale => None,
            ClaimDecision::Expired => {
                reg.finish(id, TaskState::Cancelled, Err(TaskError::DeadlineExpired), &mut txn);
                None
            }
            ClaimDecision::Rejected(err) => {
                reg.finish(id, TaskState::Failed, Err(err), &mut txn);
                None
            }
        };
        if attempt.is_none() {
            txn.ready.release(&entry.task.partition);
            txn.fx.slots_released += 1;
        }
        let fx = txn.fx;
        drop(ready);
        drop(reg);
        self.apply(fx);
        attempt
    }

    /// Record an attempt's outcome: finish, schedule a retry, or cancel.
    pub(crate) fn complete_attempt(&self, attempt: Attempt, outcome: AttemptOutcome) {
        let now = self.clock.now();
        match outcome {
            AttemptOutcome::Succeeded(_) => self.circuits.record(&attempt.permit, true, now),
            AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut => {
                self.circuits.record(&attempt.permit, false, now);
            }
            AttemptOutcome::Interrupted => self.circuits.release(&attempt.permit),
        }
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let id = attempt.task.id;
        let mut reg = self.registry.lock();
        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);
        txn.ready.release(&attempt.task.partition);
        txn.fx.slots_released += 1;

        let settled_elsewhere = reg.records.get_mut(&id).is_none_or(|rec| {
            rec.cancel = None;
            rec.terminal
        });
        if settled_elsewhere {
            // Unknown or settled while running (engine shutdown).
            let fx = txn.fx;
            drop(ready);
            drop(reg);
            self.apply(fx);
            return;
        }
        let Some(rec) = reg.records.get(&id) else {
            return;
        };
        let cancel_requested = rec.cancel_requested;
        let attempts = rec.attempts;
        let first_started = rec.first_started.unwrap_or(now);

        match outcome {
            AttemptOutcome::Succeeded(value) => {
                reg.finish(id, TaskState::Succeeded, Ok(value), &mut txn);
            }
            AttemptOutcome::Interrupted => {
                let reason = TaskError::Cancelled("interrupted while running".into());
                reg.finish(id, TaskState::Cancelled, Err(reason), &mut txn);
            }
            AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut if cancel_requested => {
                let reason = TaskError::Cancelled("cancelled while running".into());
                reg.finish(id, TaskState::Cancelled, Err(reason), &mut txn);
            }
            AttemptOutcome::Failed(message) => {
                self.fail_attempt(&mut reg, &mut txn, &attempt, TaskState::Failed, TaskError::Execution(message), attempts, first_started, now);
            }
            AttemptOutcome::TimedOut => {
                self.fail_attempt(&mut reg, &mut txn, &attempt, TaskState::TimedOut, TaskError::Timeout, attempts, first_started, now);
            }
        }
        let fx = txn.fx;
        drop(ready);
        drop(reg);
        self.apply(fx);
    }

    #[allow(clippy::too_many_arguments)]
    fn fail_attempt(
        &self,
        reg: &mut Registry,
        txn: &mut Txn<'_>,
        attempt: &Attempt,
        state: TaskState,
        error: TaskError,
        attempts: u32,
        first_started: Instant,
        now: Instant,
    ) {
        let task = &attempt.task;
        let delay = self.retry.delay(attempts);
        let within_budget = match self.config.timeout_policy {
            TimeoutPolicy::PerAttempt => true,
            TimeoutPolicy::Overall => now.saturating_duration_since(first_started) + delay < task.timeout,
        };
        if !RetryPolicy::should_retry(attempts, task.max_attempts()) || !within_budget || self.is_stopping() {
            reg.finish(task.id, state, Err(error), txn);
            return;
        }

        let Some(rec) = reg.records.get_mut(&task.id) else {
            return;
        };
        rec.state = state;
        rec.last_error = Some(error.clone());
        txn.fx.events.push(rec.event(Some(format!("{error}; retrying in {delay:?}"))));

        let weak = self.weak_self.clone();
        let id = task.id;
        rec.retry_key = self.timer.schedule(delay, move || {
            if let Some(core) = weak.upgrade() {
                core.retry_due(id);
            }
        });
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = id, attempt = attempts, delay_ms = delay.as_millis(), "retry scheduled");
    }

    /// Backoff elapsed: put the task back in the ready queue.
    fn retry_due(&self, id: TaskId) {
        let mut reg = self.registry.lock();
        let due = reg.records.get_mut(&id).is_some_and(|rec| {
            let waiting = !rec.terminal && matches!(rec.state, TaskState::Failed | TaskState::TimedOut);
            waiting && rec.retry_key.take().is_some()
        });
        if !due || self.is_stopping() {
            return;
        }
        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);
        reg.enqueue(id, &mut txn);
        let fx = txn.fx;
        drop(ready);
        drop(reg);
        self.apply(fx);
    }

    /// Push entries from a dead worker's deque back to the shared queue.
    pub(crate) fn requeue_orphans(&self, entries: Vec<ReadyEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut ready = self.ready.lock();
        let count = entries.len();
        for entry in entries {
            ready.release(&entry.task.partition);
            ready.push(entry);
        }
        drop(ready);
        warn!(count, "re-queued tasks from an exited worker");
        self.wake.notify();
    }

    // ---- control ----

    pub(crate) fn cancel(&self, id: TaskId) -> bool {
        let mut reg = self.registry.lock();
        let running = match reg.records.get_mut(&id) {
            None => return false,
            Some(rec) if rec.terminal => return false,
            Some(rec) if rec.state == TaskState::Running => {
                rec.cancel_requested = true;
                if let Some(token) = &rec.cancel {
                    token.cancel();
                }
                true
            }
            Some(_) => false,
        };
        if running {
            debug!(task_id = id, "interrupt sent to running task");
            return false;
        }
        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);
        reg.finish(id, TaskState::Cancelled, Err(TaskError::Cancelled("cancelled by caller".into())), &mut txn);
        let fx = txn.fx;
        drop(ready);
        drop(reg);
        self.apply(fx);
        true
    }

    pub(crate) fn status(&self, id: TaskId) -> Option<TaskInfo> {
        let reg = self.registry.lock();
        let rec = reg.records.get(&id)?;
        Some(TaskInfo {
            id,
            state: rec.state,
            terminal: rec.terminal,
            attempts: rec.attempts,
            tenant: rec.task.tenant.clone(),
            task_type: rec.task.task_type.clone(),
            partition: rec.task.partition.clone(),
            priority: rec.task.priority,
            last_error: rec.last_error.clone(),
        })
    }

    /// Live, deferred and retained finished task counts.
    pub(crate) fn task_counts(&self) -> (usize, usize, usize) {
        let reg = self.registry.lock();
        (reg.live, reg.deferred.len(), reg.finished.len())
    }

    /// Block until no task is live or `timeout` passes.
    pub(crate) fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut reg = self.registry.lock();
        while reg.live > 0 {
            if self.drained.wait_until(&mut reg, deadline).timed_out() {
                return reg.live == 0;
            }
        }
        true
    }

    /// Stop admission and cancel every live task. Running attempts are
    /// interrupted through their tokens.
    pub(crate) fn begin_shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut reg = self.registry.lock();
        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);
        let live: Vec<TaskId> = reg
            .records
            .iter()
            .filter(|(_, r)| !r.terminal)
            .map(|(id, _)| *id)
            .collect();
        for id in &live {
            let reason = TaskError::Cancelled("engine shut down".into());
            reg.settle(*id, TaskState::Cancelled, Err(reason), &mut txn);
        }
        reg.deferred.clear();
        let fx = txn.fx;
        drop(ready);
        drop(reg);
        info!(cancelled = live.len(), "engine no longer accepting work");
        self.apply(fx);
    }

    /// Tell workers to exit at their next loop turn.
    pub(crate) fn stop_workers(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.notify();
    }

    // ---- pool manager hooks ----

    /// Recompute the degradation level from a depth sample.
    pub(crate) fn update_level(&self, depth: usize) -> DegradationLevel {
        if depth == 0 {
            self.queue_latency_ms.store(0, Ordering::Relaxed);
        }
        let latency = Some(self.queue_latency_ms()).filter(|ms| *ms > 0);
        let level = DegradationLevel::evaluate(depth, latency, &self.config.shedding);
        let previous = DegradationLevel::from_u8(self.level.swap(level.as_u8(), Ordering::AcqRel));
        if previous != level {
            info!(from = %previous, to = %level, depth, "degradation level changed");
        }
        level
    }

    /// Periodic upkeep: expire deadlines, age priorities, admit deferred
    /// dependents once the level allows it and evict old finished tasks.
    pub(crate) fn maintain(&self, level: DegradationLevel) {
        let mut reg = self.registry.lock();
        let mut ready = self.ready.lock();
        let mut txn = self.txn(&mut ready);

        let expired = txn.ready.prune_expired(txn.now_ms);
        for entry in &expired {
            reg.finish(entry.id(), TaskState::Cancelled, Err(TaskError::DeadlineExpired), &mut txn);
        }
        if let Some(threshold) = self.config.aging_threshold_ms {
            let boosted = txn.ready.age(txn.now_ms, u128::from(threshold));
            if boosted > 0 {
                self.counters.boosted.fetch_add(boosted as u64, Ordering::Relaxed);
            }
        }
        if !level.defers_released() && !reg.deferred.is_empty() {
            let admitted = reg.admit_deferred(&mut txn);
            debug!(admitted, "deferred dependents admitted");
        }
        let evicted = reg.evict_terminal(self.config.retain_terminal);
        if evicted > 0 {
            debug!(evicted, retained = reg.finished.len(), "finished tasks evicted");
        }
        let fx = txn.fx;
        drop(ready);
        drop(reg);
        self.apply(fx);
    }
}
