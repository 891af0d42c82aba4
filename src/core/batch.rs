//! Batch aggregator.
//!
//! Items sharing a batch key are collected until `max_items` are pending or
//! `max_wait` has passed since the first one, then handed to a
//! [`BatchPayload`] as a single engine task. The task's outcome is fanned back
//! to one [`BatchTicket`] per item: per item when the payload returns a result
//! vector, otherwise the batch-wide error reaches every member.
//!
//! ```rust,ignore
//! let embed = BatchAggregator::new(engine.clone(), "embed", Arc::new(Embedder), 32, Duration::from_millis(5));
//! let ticket = embed.submit(json!("hello"));
//! let vector = ticket.wait()?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::core::engine::Engine;
use crate::core::handle::CompletionSlot;
use crate::core::{
    BatchPayload, ExecutionContext, PayloadError, TaskError, TaskHandle, TaskPayload, TaskResult, TaskSpec,
};
use crate::runtime::timer::TimerKey;
use crate::util::serde::{Priority, TenantId};

/// Settings applied to every flushed batch task.
#[derive(Debug, Clone)]
struct BatchTemplate {
    task_type: String,
    priority: Priority,
    tenant: Option<TenantId>,
    max_retries: Option<u32>,
    timeout: Option<Duration>,
}

#[derive(Default)]
struct Pending {
    items: Vec<(Value, Arc<CompletionSlot>)>,
    generation: u64,
    timer: Option<TimerKey>,
}

struct BatchInner {
    engine: Engine,
    key: String,
    payload: Arc<dyn BatchPayload>,
    max_items: usize,
    max_wait: Duration,
    template: Mutex<BatchTemplate>,
    pending: Mutex<Pending>,
    next_item: AtomicU64,
    flushed: AtomicU64,
    weak_self: Weak<Self>,
}

/// Groups items into batch tasks on an [`Engine`].
pub struct BatchAggregator {
    inner: Arc<BatchInner>,
}

/// Caller's reference to one item of a batch.
#[derive(Debug, Clone)]
pub struct BatchTicket {
    handle: TaskHandle,
}

impl BatchTicket {
    /// Item id, unique within its aggregator.
    #[must_use]
    pub const fn item_id(&self) -> u64 {
        self.handle.id()
    }

    /// Block until the item's batch finished.
    #[must_use]
    pub fn wait(&self) -> TaskResult {
        self.handle.wait()
    }

    /// Block for at most `timeout`.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult> {
        self.handle.wait_timeout(timeout)
    }

    /// Suspend until the item's batch finished.
    pub async fn wait_async(&self) -> TaskResult {
        self.handle.wait_async().await
    }

    /// The result if already known.
    #[must_use]
    pub fn try_result(&self) -> Option<TaskResult> {
        self.handle.try_result()
    }
}

impl BatchAggregator {
    /// Create an aggregator for `key`. The flushed tasks use `key` as their
    /// task type unless [`BatchAggregator::with_task_type`] overrides it.
    pub fn new(
        engine: Engine,
        key: impl Into<String>,
        payload: Arc<dyn BatchPayload>,
        max_items: usize,
        max_wait: Duration,
    ) -> Self {
        let key = key.into();
        let template = BatchTemplate {
            task_type: key.clone(),
            priority: Priority::Normal,
            tenant: None,
            max_retries: None,
            timeout: None,
        };
        let inner = Arc::new_cyclic(|weak_self| BatchInner {
            engine,
            key,
            payload,
            max_items: max_items.max(1),
            max_wait,
            template: Mutex::new(template),
            pending: Mutex::new(Pending::default()),
            next_item: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Route flushed tasks as `task_type`.
    #[must_use]
    pub fn with_task_type(self, task_type: impl Into<String>) -> Self {
        self.inner.template.lock().task_type = task_type.into();
        self
    }

    /// Priority of flushed tasks.
    #[must_use]
    pub fn with_priority(self, priority: Priority) -> Self {
        self.inner.template.lock().priority = priority;
        self
    }

    /// Tenant of flushed tasks.
    #[must_use]
    pub fn with_tenant(self, tenant: impl Into<TenantId>) -> Self {
        self.inner.template.lock().tenant = Some(tenant.into());
        self
    }

    /// Retries for a failed batch call.
    #[must_use]
    pub fn with_max_retries(self, retries: u32) -> Self {
        self.inner.template.lock().max_retries = Some(retries);
        self
    }

    /// Timeout for one batch call.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.inner.template.lock().timeout = Some(timeout);
        self
    }

    /// Batch key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Items waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().items.len()
    }

    /// Batches handed to the engine so far.
    #[must_use]
    pub fn flushed_batches(&self) -> u64 {
        self.inner.flushed.load(Ordering::Relaxed)
    }

    /// Add an item. Flushes immediately when this item fills the batch.
    pub fn submit(&self, item: Value) -> BatchTicket {
        self.inner.submit(item)
    }

    /// Flush whatever is pending now.
    pub fn flush(&self) {
        let items = self.inner.take_pending();
        self.inner.dispatch(items);
    }
}

impl Drop for BatchAggregator {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("key", &self.inner.key)
            .field("max_items", &self.inner.max_items)
            .field("max_wait", &self.inner.max_wait)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl BatchInner {
    fn submit(&self, item: Value) -> BatchTicket {
        let slot = Arc::new(CompletionSlot::default());
        let id = self.next_item.fetch_add(1, Ordering::Relaxed);
        let ticket = BatchTicket {
            handle: TaskHandle::new(id, Arc::clone(&slot)),
        };

        let mut pending = self.pending.lock();
        pending.items.push((item, slot));
        let full = pending.items.len() >= self.max_items;
        if full {
            let items = Self::take_locked(&mut pending, self);
            drop(pending);
            self.dispatch(items);
        } else if pending.items.len() == 1 {
            let generation = pending.generation;
            let weak = self.weak_self.clone();
            pending.timer = self.engine.timer().schedule(self.max_wait, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_if_current(generation);
                }
            });
        }
        ticket
    }

    fn flush_if_current(&self, generation: u64) {
        let items = {
            let mut pending = self.pending.lock();
            if pending.generation != generation {
                return;
            }
            pending.timer = None;
            Self::take_locked(&mut pending, self)
        };
        self.dispatch(items);
    }

    fn take_pending(&self) -> Vec<(Value, Arc<CompletionSlot>)> {
        let mut pending = self.pending.lock();
        Self::take_locked(&mut pending, self)
    }

    fn take_locked(pending: &mut Pending, inner: &Self) -> Vec<(Value, Arc<CompletionSlot>)> {
        if let Some(key) = pending.timer.take() {
            inner.engine.timer().cancel(key);
        }
        pending.generation += 1;
        std::mem::take(&mut pending.items)
    }

    fn dispatch(&self, items: Vec<(Value, Arc<CompletionSlot>)>) {
        if items.is_empty() {
            return;
        }
        let (values, slots): (Vec<Value>, Vec<Arc<CompletionSlot>>) = items.into_iter().unzip();
        let size = values.len();
        let spec = {
            let template = self.template.lock();
            let mut spec = TaskSpec::new(Arc::new(BatchCall {
                payload: Arc::clone(&self.payload),
            }))
            .with_type(template.task_type.clone())
            .with_priority(template.priority)
            .with_args(Value::Array(values));
            if let Some(tenant) = &template.tenant {
                spec = spec.with_tenant(tenant.clone());
            }
            if let Some(retries) = template.max_retries {
                spec = spec.with_max_retries(retries);
            }
            if let Some(timeout) = template.timeout {
                spec = spec.with_timeout(timeout);
            }
            spec
        };

        match self.engine.submit(spec) {
            Ok(handle) => {
                self.flushed.fetch_add(1, Ordering::Relaxed);
                debug!(batch_key = %self.key, task_id = handle.id(), size, "batch flushed");
                handle.on_complete(move |result| fan_out(&slots, result));
            }
            Err(err) => {
                warn!(batch_key = %self.key, size, error = %err, "batch submission rejected");
                let error = TaskError::Cancelled(format!("batch rejected: {err}"));
                for slot in &slots {
                    slot.complete(Err(error.clone()));
                }
            }
        }
    }
}

/// Engine payload wrapping a [`BatchPayload`]. Per-item results are encoded as
/// `{"ok": value}` or `{"err": message}` so they survive the task result.
struct BatchCall {
    payload: Arc<dyn BatchPayload>,
}

#[async_trait]
impl TaskPayload for BatchCall {
    async fn execute(&self, args: Value, ctx: ExecutionContext) -> Result<Value, PayloadError> {
        let items = match args {
            Value::Array(items) => items,
            other => vec![other],
        };
        let expected = items.len();
        let results = self.payload.execute_batch(items, ctx).await?;
        if results.len() != expected {
            return Err(PayloadError::new(format!(
                "batch returned {} results for {expected} items",
                results.len()
            )));
        }
        Ok(Value::Array(results.into_iter().map(encode_item).collect()))
    }
}

fn encode_item(result: Result<Value, PayloadError>) -> Value {
    match result {
        Ok(value) => json!({ "ok": value }),
        Err(err) => json!({ "err": err.message() }),
    }
}

fn decode_item(encoded: &Value) -> TaskResult {
    if let Some(value) = encoded.get("ok") {
        return Ok(value.clone());
    }
    let message = encoded
        .get("err")
        .and_then(Value::as_str)
        .unwrap_or("malformed batch item result");
    Err(TaskError::Execution(message.to_string()))
}

fn fan_out(slots: &[Arc<CompletionSlot>], result: &TaskResult) {
    match result {
        Ok(Value::Array(items)) if items.len() == slots.len() => {
            for (slot, item) in slots.iter().zip(items) {
                slot.complete(decode_item(item));
            }
        }
        Ok(_) => {
            let error = TaskError::Execution("batch result did not match its items".into());
            for slot in slots {
                slot.complete(Err(error.clone()));
            }
        }
        Err(error) => {
            for slot in slots {
                slot.complete(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_encoding() {
        assert_eq!(decode_item(&encode_item(Ok(json!(5)))), Ok(json!(5)));
        assert_eq!(
            decode_item(&encode_item(Err(PayloadError::new("bad item")))),
            Err(TaskError::Execution("bad item".into()))
        );
        assert!(decode_item(&json!(1)).is_err());
    }

    #[test]
    fn test_fan_out_whole_batch_error() {
        let slots: Vec<_> = (0..3).map(|_| Arc::new(CompletionSlot::default())).collect();
        fan_out(&slots, &Err(TaskError::Timeout));
        assert!(slots.iter().all(|s| s.peek() == Some(Err(TaskError::Timeout))));
    }

    #[test]
    fn test_fan_out_length_mismatch_fails_all() {
        let slots: Vec<_> = (0..2).map(|_| Arc::new(CompletionSlot::default())).collect();
        fan_out(&slots, &Ok(json!([{ "ok": 1 }])));
        assert!(slots.iter().all(|s| matches!(s.peek(), Some(Err(TaskError::Execution(_))))));
    }
}
