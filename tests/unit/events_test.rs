//! Tests for event sinks

use prometheus_task_engine::core::{
    build_task_event, ChannelEventSink, EventSink, InMemoryEventSink, TaskState,
};

#[test]
fn test_build_task_event() {
    let event = build_task_event(7, "acme", "fetch", TaskState::Failed, 2, false, Some("boom".into()));
    assert_eq!(event.task_id, 7);
    assert_eq!(event.tenant, "acme");
    assert_eq!(event.attempt, 2);
    assert!(!event.terminal);
    assert!(!event.event_id.is_empty());
}

#[test]
fn test_in_memory_sink_filters_by_task() {
    let sink = InMemoryEventSink::new(10);
    sink.on_event(&build_task_event(1, "t", "x", TaskState::Ready, 0, false, None));
    sink.on_event(&build_task_event(2, "t", "x", TaskState::Ready, 0, false, None));
    sink.on_event(&build_task_event(1, "t", "x", TaskState::Running, 1, false, None));
    assert_eq!(sink.states_of(1), vec![TaskState::Ready, TaskState::Running]);
    assert_eq!(sink.events().len(), 3);
}

#[test]
fn test_channel_sink_forwards() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let sink = ChannelEventSink::new(tx);
    sink.on_event(&build_task_event(3, "t", "x", TaskState::Succeeded, 1, true, None));
    let event = rx.try_recv().unwrap();
    assert_eq!(event.task_id, 3);
    assert!(event.terminal);
}
