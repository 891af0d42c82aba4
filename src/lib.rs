//! # Prometheus Task Engine
//!
//! A concurrent task execution engine for background work with dependencies,
//! priorities and many tenants.
//!
//! Callers submit tasks and get a [`core::TaskHandle`] back immediately. The
//! engine resolves dependencies between tasks, schedules ready work fairly
//! across tenants and by priority, and runs it on a pool of worker threads
//! that steal from each other when idle. Failures are handled where they
//! happen: timeouts, retries with exponential backoff and per-key circuit
//! breakers. Under load the pool grows, and past configured thresholds the
//! engine degrades, sheds low-priority work and finally admits only critical
//! work.
//!
//! ## Key Features
//!
//! - **DAG dependencies**: a task becomes ready only after every dependency
//!   succeeded; a failed dependency cancels its dependents transitively
//! - **Type-routed partitions**: task types map to partitions with their own
//!   fair queues and optional concurrency caps
//! - **Fair scheduling**: round-robin across tenants, priority then FIFO
//!   within a tenant, with optional priority aging
//! - **Work-stealing workers**: dedicated OS threads with local deques
//! - **Dynamic scaling**: the pool manager samples queue depth and adds or
//!   retires workers between `min_workers` and `max_workers`
//! - **Resilience**: timeouts, retries with jittered backoff, circuit breakers
//! - **Load shedding**: graded degradation driven by depth and queue latency
//! - **Batching**: [`core::BatchAggregator`] groups small items into one call
//!
//! ```rust,ignore
//! use prometheus_task_engine::config::{EngineConfig, PartitionConfig};
//! use prometheus_task_engine::core::{payload_fn, Engine, TaskSpec};
//! use prometheus_task_engine::util::serde::Priority;
//! use serde_json::json;
//!
//! let engine = Engine::new(
//!     EngineConfig::default()
//!         .with_workers(2, 8)
//!         .with_partition(PartitionConfig::new("io", &["fetch"]).with_max_concurrency(4)),
//! )?;
//!
//! let fetch = payload_fn(|args, _ctx| async move { Ok(json!({ "fetched": args })) });
//! let handle = engine.submit(
//!     TaskSpec::new(fetch)
//!         .with_type("fetch")
//!         .with_tenant("acme")
//!         .with_priority(Priority::High)
//!         .with_args(json!("https://example.com")),
//! )?;
//! let result = handle.wait()?;
//! engine.shutdown();
//! ```
//!
//! For complete examples, see `tests/engine_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, engine, worker pool and execution policies.
pub mod core;
/// Configuration models for the engine, pool and policies.
pub mod config;
/// Builders to construct engines from configuration.
pub mod builders;
/// Queue data structures used by the scheduler.
pub mod infra;
/// Timer thread and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
