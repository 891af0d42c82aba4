//! Tests for builder modules

use prometheus_task_engine::builders::EngineBuilder;
use prometheus_task_engine::config::{EngineConfig, PartitionConfig};
use prometheus_task_engine::core::{payload_fn, EngineError, InMemoryEventSink, TaskSpec, TaskState};
use prometheus_task_engine::util::SequentialIds;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_builder_defaults() {
    let builder = EngineBuilder::default();
    assert_eq!(builder.config().pool.min_workers, 1);
    assert!(builder.config().partitions.is_empty());
}

#[test]
fn test_builder_rejects_invalid_config() {
    let result = EngineBuilder::new(EngineConfig::default().with_workers(3, 1)).build();
    assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_builder_wires_ids_and_sinks() {
    let sink = Arc::new(InMemoryEventSink::new(64));
    let engine = EngineBuilder::new(EngineConfig::default().with_workers(1, 1))
        .partition(PartitionConfig::new("io", &["fetch"]))
        .ids(Arc::new(SequentialIds::starting_at(500)))
        .sink(sink.clone())
        .build()
        .unwrap();

    let handle = engine
        .submit(TaskSpec::new(payload_fn(|args, _ctx| async move { Ok(args) })).with_type("fetch").with_args(json!(1)))
        .unwrap();
    assert_eq!(handle.id(), 500);
    assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(Ok(json!(1))));
    assert_eq!(engine.status(500).unwrap().partition, "io");
    assert_eq!(
        sink.states_of(500),
        vec![TaskState::Ready, TaskState::Running, TaskState::Succeeded]
    );
    engine.shutdown();
}
