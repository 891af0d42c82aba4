//! Tests for error types

use prometheus_task_engine::core::{EngineError, PayloadError, TaskError};

#[test]
fn test_engine_error_display() {
    assert_eq!(EngineError::CyclicDependency(4).to_string(), "cyclic dependency involving task 4");
    let unknown = EngineError::UnknownDependency { task: 2, dependency: 9 };
    assert_eq!(unknown.to_string(), "task 2 depends on unknown task 9");
    assert!(EngineError::Backpressure("queue full".into()).to_string().contains("queue full"));
    assert_eq!(EngineError::ShuttingDown.to_string(), "engine is shutting down");
}

#[test]
fn test_task_error_retryable() {
    assert!(TaskError::Execution("x".into()).is_retryable());
    assert!(TaskError::Timeout.is_retryable());
    assert!(!TaskError::CircuitOpen("db".into()).is_retryable());
    assert!(!TaskError::Cancelled("x".into()).is_retryable());
    assert!(!TaskError::DeadlineExpired.is_retryable());
}

#[test]
fn test_task_error_serializes_tagged() {
    let json = serde_json::to_value(TaskError::CircuitOpen("db".into())).unwrap();
    assert_eq!(json, serde_json::json!({ "kind": "circuit_open", "detail": "db" }));
    let back: TaskError = serde_json::from_value(json).unwrap();
    assert_eq!(back, TaskError::CircuitOpen("db".into()));
}

#[test]
fn test_payload_error_conversions() {
    let from_str: PayloadError = "bad input".into();
    assert_eq!(from_str.message(), "bad input");
    let from_anyhow: PayloadError = anyhow::anyhow!("io failed").into();
    assert!(from_anyhow.to_string().contains("io failed"));
}
