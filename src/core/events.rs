//! State-transition events and sinks.
//!
//! Every transition a task makes is published to the subscribed sinks after
//! the engine's registry lock has been released, so sinks may call back into
//! the engine (for example to read `stats()`).

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::TaskState;
use crate::util::clock::now_ms;
use crate::util::serde::TaskId;

/// A task state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event identifier.
    pub event_id: String,
    /// Task that transitioned.
    pub task_id: TaskId,
    /// Owning tenant.
    pub tenant: String,
    /// Task type.
    pub task_type: String,
    /// State entered.
    pub state: TaskState,
    /// Attempt number at the time of the transition (0 before the first run).
    pub attempt: u32,
    /// Whether the task will not transition again.
    pub terminal: bool,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context, such as an error message.
    pub detail: Option<String>,
}

/// Helper to build an event from context.
pub fn build_task_event(
    task_id: TaskId,
    tenant: impl Into<String>,
    task_type: impl Into<String>,
    state: TaskState,
    attempt: u32,
    terminal: bool,
    detail: Option<String>,
) -> TaskEvent {
    TaskEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        task_id,
        tenant: tenant.into(),
        task_type: task_type.into(),
        state,
        attempt,
        terminal,
        created_at_ms: now_ms(),
        detail,
    }
}

/// Receiver of task events. Called from worker and caller threads; must not
/// block for long. A panic inside `on_event` is caught and logged.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &TaskEvent);
}

/// In-memory sink with a bounded buffer, for testing and dashboards.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<TaskEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a sink keeping at most `max_events`, dropping the oldest.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of stored events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// States a task passed through, in order.
    #[must_use]
    pub fn states_of(&self, task_id: TaskId) -> Vec<TaskState> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.state)
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn on_event(&self, event: &TaskEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Forwards events into a crossbeam channel. Events are dropped once the
/// receiver is gone.
pub struct ChannelEventSink {
    tx: Sender<TaskEvent>,
}

impl ChannelEventSink {
    /// Wrap a sender.
    #[must_use]
    pub const fn new(tx: Sender<TaskEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn on_event(&self, event: &TaskEvent) {
        let _ = self.tx.try_send(event.clone());
    }
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &TaskEvent) {
        tracing::info!(
            task_id = event.task_id,
            tenant = %event.tenant,
            task_type = %event.task_type,
            state = %event.state,
            attempt = event.attempt,
            terminal = event.terminal,
            detail = event.detail.as_deref().unwrap_or(""),
            "task transition"
        );
    }
}

/// Fan-out to all subscribed sinks.
#[derive(Default)]
pub(crate) struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    pub(crate) fn publish(&self, events: &[TaskEvent]) {
        if events.is_empty() {
            return;
        }
        let sinks = self.sinks.read().clone();
        for event in events {
            for sink in &sinks {
                if catch_unwind(AssertUnwindSafe(|| sink.on_event(event))).is_err() {
                    tracing::error!(task_id = event.task_id, state = %event.state, "event sink panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryEventSink::new(2);
        for id in 0..3 {
            sink.on_event(&build_task_event(id, "t", "x", TaskState::Ready, 0, false, None));
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].task_id, 1);
    }

    #[test]
    fn test_bus_fans_out() {
        let bus = EventBus::default();
        let a = Arc::new(InMemoryEventSink::new(10));
        let (tx, rx) = crossbeam_channel::unbounded();
        bus.subscribe(a.clone());
        bus.subscribe(Arc::new(ChannelEventSink::new(tx)));
        bus.publish(&[build_task_event(5, "t", "x", TaskState::Succeeded, 1, true, None)]);
        assert_eq!(a.states_of(5), vec![TaskState::Succeeded]);
        assert_eq!(rx.try_recv().unwrap().task_id, 5);
    }

    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn on_event(&self, _event: &TaskEvent) {
            panic!("sink failure");
        }
    }

    #[test]
    fn test_panicking_sink_does_not_stop_fan_out() {
        let bus = EventBus::default();
        let after = Arc::new(InMemoryEventSink::new(10));
        bus.subscribe(Arc::new(PanickingSink));
        bus.subscribe(after.clone());
        bus.publish(&[
            build_task_event(1, "t", "x", TaskState::Running, 1, false, None),
            build_task_event(1, "t", "x", TaskState::Succeeded, 1, true, None),
        ]);
        assert_eq!(after.states_of(1), vec![TaskState::Running, TaskState::Succeeded]);
    }
}
