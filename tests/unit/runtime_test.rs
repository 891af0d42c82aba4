//! Tests for the runtime timer and API views

use prometheus_task_engine::config::EngineConfig;
use prometheus_task_engine::core::{payload_fn, DegradationLevel, Engine, PayloadError, TaskSpec, TaskState};
use prometheus_task_engine::runtime::{health, task_status, Timer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_timer_runs_scheduled_job() {
    let timer = Timer::start("runtime-test-timer").unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    timer.schedule(Duration::from_millis(10), move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(timer.pending(), 0);
    timer.shutdown();
}

#[test]
fn test_health_and_task_status() {
    let engine = Engine::new(EngineConfig::default().with_workers(1, 1)).unwrap();
    let h = health(&engine);
    assert!(h.ok);
    assert_eq!(h.degradation_level, DegradationLevel::Normal);

    let handle = engine
        .submit(TaskSpec::new(payload_fn(|_args, _ctx| async move { Err(PayloadError::new("nope")) })))
        .unwrap();
    assert!(handle.wait_timeout(Duration::from_secs(5)).is_some());

    let status = task_status(&engine, handle.id()).unwrap();
    assert_eq!(status.state, TaskState::Failed);
    assert!(status.terminal);
    assert_eq!(status.attempts, 1);
    assert!(status.reason.unwrap().contains("nope"));
    assert!(task_status(&engine, 999_999).is_none());

    engine.shutdown();
    assert!(!health(&engine).ok);
}
