//! Priority heap of ready tasks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::core::Task;
use crate::util::serde::{Priority, TaskId};

/// A task waiting in a ready queue.
///
/// `priority` starts at the task's submitted priority and may be raised by
/// aging; `enqueued_at_ms` is reset whenever that happens.
#[derive(Debug, Clone)]
pub struct ReadyEntry {
    /// The task.
    pub task: Arc<Task>,
    /// Effective priority.
    pub priority: Priority,
    /// When the entry entered (or was last boosted in) the queue.
    pub enqueued_at_ms: u128,
}

impl ReadyEntry {
    /// Wrap a task at its own priority.
    #[must_use]
    pub fn new(task: Arc<Task>, now_ms: u128) -> Self {
        Self {
            priority: task.priority,
            task,
            enqueued_at_ms: now_ms,
        }
    }

    /// Task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

/// Heap wrapper: highest priority first, then oldest, then lowest sequence.
struct HeapItem(ReadyEntry);

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.task.id == other.0.task.id
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on time and sequence so the max-heap yields FIFO.
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.task.created_at_ms.cmp(&self.0.task.created_at_ms))
            .then_with(|| other.0.task.seq.cmp(&self.0.task.seq))
    }
}

/// Binary heap with O(log n) push and pop. Removal by id and aging rebuild
/// the heap, which is fine for their low call rate.
#[derive(Default)]
pub struct PriorityQueue {
    items: BinaryHeap<HeapItem>,
}

impl PriorityQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn push(&mut self, entry: ReadyEntry) {
        self.items.push(HeapItem(entry));
    }

    /// Remove the highest-priority entry.
    pub fn pop(&mut self) -> Option<ReadyEntry> {
        self.items.pop().map(|item| item.0)
    }

    /// Peek at the next entry.
    #[must_use]
    pub fn peek(&self) -> Option<&ReadyEntry> {
        self.items.peek().map(|item| &item.0)
    }

    /// Remove the entry for `id`, if queued.
    pub fn remove(&mut self, id: TaskId) -> Option<ReadyEntry> {
        if !self.items.iter().any(|item| item.0.task.id == id) {
            return None;
        }
        let mut removed = None;
        let items: Vec<_> = self.items.drain().collect();
        self.items = items
            .into_iter()
            .filter_map(|item| {
                if item.0.task.id == id {
                    removed = Some(item.0);
                    None
                } else {
                    Some(item)
                }
            })
            .collect();
        removed
    }

    /// Boost entries that waited at least `threshold_ms` by one level.
    /// Returns how many were boosted.
    pub fn age(&mut self, now_ms: u128, threshold_ms: u128) -> usize {
        let stale = |e: &ReadyEntry| {
            e.priority != Priority::Critical && now_ms.saturating_sub(e.enqueued_at_ms) >= threshold_ms
        };
        if !self.items.iter().any(|item| stale(&item.0)) {
            return 0;
        }
        let mut boosted = 0;
        let items: Vec<_> = self.items.drain().collect();
        self.items = items
            .into_iter()
            .map(|HeapItem(mut entry)| {
                if stale(&entry) {
                    entry.priority = entry.priority.boosted();
                    entry.enqueued_at_ms = now_ms;
                    boosted += 1;
                }
                HeapItem(entry)
            })
            .collect();
        boosted
    }

    /// Remove entries whose start deadline is at or before `now_ms`.
    pub fn prune_expired(&mut self, now_ms: u128) -> Vec<ReadyEntry> {
        let expired = |e: &ReadyEntry| e.task.deadline_ms.is_some_and(|d| d <= now_ms);
        if !self.items.iter().any(|item| expired(&item.0)) {
            return Vec::new();
        }
        let mut pruned = Vec::new();
        let items: Vec<_> = self.items.drain().collect();
        self.items = items
            .into_iter()
            .filter_map(|item| {
                if expired(&item.0) {
                    pruned.push(item.0);
                    None
                } else {
                    Some(item)
                }
            })
            .collect();
        pruned
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
