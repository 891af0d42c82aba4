//! Integration tests for the worker pool
//!
//! These tests validate:
//! - Exactly-once execution while workers refill and steal
//! - Scale-up under sustained depth, bounded by `max_workers`
//! - Scale-down back to `min_workers` once idle
//! - Partition concurrency caps
//! - Worker statistics

use parking_lot::Mutex;
use prometheus_task_engine::config::{EngineConfig, PartitionConfig};
use prometheus_task_engine::core::{payload_fn, Engine, TaskPayload, TaskSpec, WorkerStatus};
use prometheus_task_engine::util::TaskId;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(15);

fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn gated(flag: &Arc<AtomicBool>) -> Arc<dyn TaskPayload> {
    let flag = Arc::clone(flag);
    payload_fn(move |_args, _ctx| {
        let flag = Arc::clone(&flag);
        async move {
            while !flag.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(json!(null))
        }
    })
}

#[test]
fn test_every_task_runs_exactly_once_with_stealing() {
    let engine = Engine::new(
        EngineConfig::default()
            .with_workers(4, 4)
            .with_refill_batch(8)
            .with_sample_interval(Duration::from_millis(20)),
    )
    .unwrap();
    let runs: Arc<Mutex<HashMap<TaskId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let payload = {
        let runs = Arc::clone(&runs);
        payload_fn(move |_args, ctx| {
            *runs.lock().entry(ctx.task_id).or_insert(0) += 1;
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(json!(null))
            }
        })
    };

    let specs: Vec<_> = (0..200).map(|_| TaskSpec::new(payload.clone())).collect();
    let handles = engine.submit_batch(specs).unwrap();
    assert!(engine.drain(WAIT));

    let runs = runs.lock();
    assert_eq!(runs.len(), 200);
    for handle in &handles {
        assert_eq!(runs.get(&handle.id()), Some(&1), "task {} ran more than once", handle.id());
        assert!(handle.try_result().unwrap().is_ok());
    }
    let stats = engine.stats();
    assert_eq!(stats.counters.attempts, 200);
    assert_eq!(stats.counters.succeeded, 200);
    engine.shutdown();
}

#[test]
fn test_pool_scales_up_to_max_and_back_down() {
    let engine = Engine::new(
        EngineConfig::default()
            .with_workers(1, 3)
            .with_water_marks(1, 4)
            .with_refill_batch(1)
            .with_sample_interval(Duration::from_millis(30)),
    )
    .unwrap();
    assert_eq!(engine.stats().active_workers, 1);

    let open = Arc::new(AtomicBool::new(false));
    let specs: Vec<_> = (0..20).map(|_| TaskSpec::new(gated(&open))).collect();
    engine.submit_batch(specs).unwrap();

    assert!(eventually(WAIT, || engine.stats().active_workers == 3));
    thread::sleep(Duration::from_millis(200));
    let stats = engine.stats();
    assert_eq!(stats.active_workers, 3);
    assert_eq!(stats.busy_workers, 3);
    assert_eq!(stats.counters.workers_spawned, 3);

    open.store(true, Ordering::SeqCst);
    assert!(engine.drain(WAIT));
    assert!(eventually(WAIT, || engine.stats().active_workers == 1));
    assert!(eventually(WAIT, || engine.stats().workers.len() == 1));
    assert_eq!(engine.stats().counters.workers_retired, 2);
    engine.shutdown();
}

#[test]
fn test_partition_cap_limits_concurrency() {
    let engine = Engine::new(
        EngineConfig::default()
            .with_workers(4, 4)
            .with_refill_batch(1)
            .with_partition(PartitionConfig::new("gpu", &["embed"]).with_max_concurrency(1)),
    )
    .unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let payload = {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        payload_fn(move |_args, _ctx| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        })
    };

    let specs: Vec<_> = (0..8)
        .map(|_| TaskSpec::new(payload.clone()).with_type("embed"))
        .collect();
    let handles = engine.submit_batch(specs).unwrap();
    assert!(engine.drain(WAIT));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(handles.iter().all(|h| engine.status(h.id()).unwrap().partition == "gpu"));
    engine.shutdown();
}

#[test]
fn test_worker_snapshots() {
    let engine = Engine::new(EngineConfig::default().with_workers(2, 2)).unwrap();
    let open = Arc::new(AtomicBool::new(false));
    let handle = engine.submit(TaskSpec::new(gated(&open))).unwrap();

    assert!(eventually(WAIT, || engine
        .stats()
        .workers
        .iter()
        .any(|w| w.current_task == Some(handle.id()) && w.status == WorkerStatus::Busy)));
    let stats = engine.stats();
    assert_eq!(stats.workers.len(), 2);
    assert_eq!(stats.local_depths.len(), 2);
    assert_eq!(stats.busy_workers, 1);

    open.store(true, Ordering::SeqCst);
    assert!(handle.wait_timeout(WAIT).unwrap().is_ok());
    engine.shutdown();
    assert!(engine.stats().workers.is_empty());
}
