//! Completion handles.
//!
//! Each task owns one [`CompletionSlot`]. Blocking waiters park on a
//! `parking_lot::Condvar`; async waiters use a `tokio::sync::Notify`, so a
//! handle can be awaited from any runtime or from plain threads.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::core::TaskResult;
use crate::util::serde::TaskId;

type Callback = Box<dyn FnOnce(&TaskResult) + Send>;

#[derive(Default)]
struct SlotState {
    result: Option<TaskResult>,
    callbacks: Vec<Callback>,
}

/// Write-once cell holding a task's terminal result.
#[derive(Default)]
pub(crate) struct CompletionSlot {
    state: Mutex<SlotState>,
    condvar: Condvar,
    notify: Notify,
}

impl CompletionSlot {
    /// Store the result and wake every waiter. Only the first call wins.
    pub(crate) fn complete(&self, result: TaskResult) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.condvar.notify_all();
        self.notify.notify_waiters();
        for callback in callbacks {
            run_callback(callback, &result);
        }
        true
    }

    pub(crate) fn peek(&self) -> Option<TaskResult> {
        self.state.lock().result.clone()
    }

    fn wait(&self) -> TaskResult {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.result.as_ref() {
                return result.clone();
            }
            self.condvar.wait(&mut state);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        let mut state = self.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(result) = state.result.as_ref() {
                return Some(result.clone());
            }
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return state.result.clone();
            }
        }
    }

    async fn wait_async(&self) -> TaskResult {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed.
            notified.as_mut().enable();
            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }

    /// Run `callback` once the result is known (immediately if it already is).
    pub(crate) fn on_complete(&self, callback: Callback) {
        let ready = {
            let mut state = self.state.lock();
            match state.result.clone() {
                Some(result) => Some((result, callback)),
                None => {
                    state.callbacks.push(callback);
                    None
                }
            }
        };
        if let Some((result, callback)) = ready {
            run_callback(callback, &result);
        }
    }
}

/// Run a callback on the completing thread. A panic is logged, not propagated.
fn run_callback(callback: Callback, result: &TaskResult) {
    if catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
        tracing::error!("completion callback panicked");
    }
}

/// Caller's reference to a submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    slot: Arc<CompletionSlot>,
}

impl TaskHandle {
    pub(crate) const fn new(id: TaskId, slot: Arc<CompletionSlot>) -> Self {
        Self { id, slot }
    }

    /// Task id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Block the current thread until the task is terminal.
    #[must_use]
    pub fn wait(&self) -> TaskResult {
        self.slot.wait()
    }

    /// Block for at most `timeout`; `None` if the task is still live.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        self.slot.wait_timeout(timeout)
    }

    /// Suspend until the task is terminal.
    pub async fn wait_async(&self) -> TaskResult {
        self.slot.wait_async().await
    }

    /// The result if the task is already terminal.
    #[must_use]
    pub fn try_result(&self) -> Option<TaskResult> {
        self.slot.peek()
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.slot.peek().is_some()
    }

    /// Register a callback for the terminal result. Runs on the thread that
    /// completes the task, so it must not block.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&TaskResult) + Send + 'static,
    {
        self.slot.on_complete(Box::new(callback));
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
