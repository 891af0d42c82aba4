//! Payload traits: the opaque callables the engine runs.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::util::serde::TaskId;

/// Error raised by a payload. The engine does not interpret it beyond
/// applying the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PayloadError {
    message: String,
}

impl PayloadError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for PayloadError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for PayloadError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for PayloadError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Per-attempt context handed to a payload.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Task being executed.
    pub task_id: TaskId,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Tenant that submitted the task.
    pub tenant: String,
    /// Task type used for routing.
    pub task_type: String,
    /// Set when the engine is degraded; payloads should take a cheaper path.
    pub degraded: bool,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub(crate) const fn new(
        task_id: TaskId,
        attempt: u32,
        tenant: String,
        task_type: String,
        degraded: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            attempt,
            tenant,
            task_type,
            degraded,
            cancel,
        }
    }

    /// Whether the engine asked this attempt to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the engine interrupts this attempt (timeout or cancel).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// A unit of work. Implementations must be cheap to share; the engine holds
/// them behind `Arc` and may call `execute` once per attempt.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_task_engine::core::{ExecutionContext, PayloadError, TaskPayload};
/// use serde_json::{json, Value};
///
/// struct Thumbnail;
///
/// #[async_trait]
/// impl TaskPayload for Thumbnail {
///     async fn execute(&self, args: Value, ctx: ExecutionContext) -> Result<Value, PayloadError> {
///         let size = if ctx.degraded { 64 } else { 256 };
///         Ok(json!({ "source": args["path"], "size": size }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskPayload: Send + Sync + 'static {
    /// Run one attempt.
    async fn execute(&self, args: Value, ctx: ExecutionContext) -> Result<Value, PayloadError>;
}

/// Adapter turning an async closure into a [`TaskPayload`].
pub struct FnPayload<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskPayload for FnPayload<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, PayloadError>> + Send + 'static,
{
    async fn execute(&self, args: Value, ctx: ExecutionContext) -> Result<Value, PayloadError> {
        (self.f)(args, ctx).await
    }
}

/// Wrap an async closure as a shareable payload.
pub fn payload_fn<F, Fut>(f: F) -> Arc<dyn TaskPayload>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, PayloadError>> + Send + 'static,
{
    Arc::new(FnPayload { f })
}

/// Result of a grouped call: either one result per item, in input order, or
/// an error that applies to the whole batch.
pub type BatchResult = Result<Vec<Result<Value, PayloadError>>, PayloadError>;

/// A payload that amortizes per-call overhead by handling many items at once.
#[async_trait]
pub trait BatchPayload: Send + Sync + 'static {
    /// Process a group of items.
    ///
    /// Returning `Ok` with a vector of a different length than `items` is
    /// treated as a whole-batch failure.
    async fn execute_batch(&self, items: Vec<Value>, ctx: ExecutionContext) -> BatchResult;
}
