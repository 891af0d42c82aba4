//! Core task model, scheduling engine and execution policies.

pub mod batch;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod handle;
pub mod resilience;
pub mod task;
pub mod worker_pool;

pub use batch::{BatchAggregator, BatchTicket};
pub use engine::{CounterSnapshot, Engine, EngineStats, TaskInfo};
pub use error::{AppResult, EngineError, TaskError};
pub use events::{
    build_task_event, ChannelEventSink, EventSink, InMemoryEventSink, TaskEvent, TracingEventSink,
};
pub use executor::{payload_fn, BatchPayload, BatchResult, ExecutionContext, FnPayload, PayloadError, TaskPayload};
pub use handle::TaskHandle;
pub use resilience::{CircuitBreaker, CircuitState, RetryPolicy};
pub use task::{Task, TaskResult, TaskSpec, TaskState, DEFAULT_TASK_TYPE, DEFAULT_TENANT};
pub use worker_pool::{DegradationLevel, WorkerSnapshot, WorkerStatus};
