//! Delayed job scheduler on a dedicated thread.
//!
//! Retry backoff and batch flush deadlines are scheduled here instead of
//! sleeping on a worker. The thread sleeps on a condvar until the earliest
//! due time or until a new job is scheduled.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::EngineError;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerState {
    due: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// Handle to a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

/// Single-thread timer wheel backed by a binary heap.
pub struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Spawn the timer thread.
    ///
    /// # Errors
    ///
    /// `EngineError::Internal` if the thread cannot be spawned.
    pub fn start(name: &str) -> Result<Self, EngineError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState::default()),
            condvar: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&thread_shared))
            .map_err(|e| EngineError::Internal(format!("failed to spawn timer thread: {e}")))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `job` on the timer thread once `at` is reached.
    /// Jobs scheduled after shutdown are dropped unrun.
    pub fn schedule_at<F>(&self, at: Instant, job: F) -> Option<TimerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return None;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.due.push(Reverse((at, seq)));
        state.jobs.insert(seq, Box::new(job));
        drop(state);
        self.shared.condvar.notify_one();
        Some(TimerKey(seq))
    }

    /// Run `job` after `delay`.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> Option<TimerKey>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, job)
    }

    /// Drop a job that has not run yet. Returns whether it was still pending.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.shared.state.lock().jobs.remove(&key.0).is_some()
    }

    /// Jobs waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Stop the thread. Pending jobs are dropped without running.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.jobs.clear();
            state.due.clear();
        }
        self.shared.condvar.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.condvar.notify_all();
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            tracing::debug!("timer thread shutting down");
            return;
        }
        let now = Instant::now();
        match state.due.peek().copied() {
            Some(Reverse((at, seq))) if at <= now => {
                state.due.pop();
                if let Some(job) = state.jobs.remove(&seq) {
                    drop(state);
                    job();
                    state = shared.state.lock();
                }
            }
            Some(Reverse((at, _))) => {
                let _ = shared.condvar.wait_until(&mut state, at);
            }
            None => shared.condvar.wait(&mut state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_due_order() {
        let timer = Timer::start("test-timer").unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for (label, ms) in [(3, 60), (1, 10), (2, 30)] {
            let tx = tx.clone();
            timer.schedule(Duration::from_millis(ms), move || {
                let _ = tx.send(label);
            });
        }
        let got: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        timer.shutdown();
    }

    #[test]
    fn test_cancelled_job_does_not_run() {
        let timer = Timer::start("test-timer").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let key = timer
            .schedule(Duration::from_millis(30), move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timer.cancel(key));
        thread::sleep(Duration::from_millis(80));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        timer.shutdown();
        assert!(timer.schedule(Duration::ZERO, || {}).is_none());
    }
}
