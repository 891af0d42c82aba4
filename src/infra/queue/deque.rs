//! Per-worker double-ended queue.
//!
//! The owning worker pops from the head; peers steal from the tail so the
//! two ends rarely contend on the same entries.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::priority::ReadyEntry;

/// Local run queue of one worker.
#[derive(Default)]
pub struct WorkerDeque {
    inner: Mutex<VecDeque<ReadyEntry>>,
}

impl WorkerDeque {
    /// Create an empty deque.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append entries at the tail.
    pub fn push_back_many(&self, entries: impl IntoIterator<Item = ReadyEntry>) {
        self.inner.lock().extend(entries);
    }

    /// Append one entry at the tail.
    pub fn push_back(&self, entry: ReadyEntry) {
        self.inner.lock().push_back(entry);
    }

    /// Owner side: take from the head.
    pub fn pop_front(&self) -> Option<ReadyEntry> {
        self.inner.lock().pop_front()
    }

    /// Thief side: take from the tail.
    pub fn steal_back(&self) -> Option<ReadyEntry> {
        self.inner.lock().pop_back()
    }

    /// Take everything, head first.
    pub fn drain(&self) -> Vec<ReadyEntry> {
        self.inner.lock().drain(..).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the deque is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
