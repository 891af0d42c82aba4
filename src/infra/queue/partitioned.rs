//! Shared ready queue routed by task type.
//!
//! Each partition has a fair queue and an optional concurrency cap. Popping
//! claims a slot in the partition; the slot is held until the worker calls
//! [`ReadyQueue::release`] for that partition, which it does exactly once per
//! popped entry whatever happens to the task.

use std::collections::{BTreeMap, HashMap};

use super::fair::FairQueue;
use super::priority::ReadyEntry;
use crate::config::EngineConfig;
use crate::core::Task;

struct Partition {
    name: String,
    cap: Option<usize>,
    queue: FairQueue,
    in_flight: usize,
}

impl Partition {
    fn has_capacity(&self) -> bool {
        self.cap.is_none_or(|cap| self.in_flight < cap)
    }
}

/// Partition → tenant → priority composition of ready work.
pub struct ReadyQueue {
    partitions: Vec<Partition>,
    routes: HashMap<String, usize>,
    default_index: usize,
    cursor: usize,
    len: usize,
}

impl ReadyQueue {
    /// Build partitions from configuration. The default partition is created
    /// if the configuration does not name it.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let mut partitions = Vec::with_capacity(config.partitions.len() + 1);
        let mut routes = HashMap::new();
        for p in &config.partitions {
            let index = partitions.len();
            for task_type in &p.task_types {
                routes.insert(task_type.clone(), index);
            }
            partitions.push(Partition {
                name: p.name.clone(),
                cap: p.max_concurrency,
                queue: FairQueue::new(),
                in_flight: 0,
            });
        }
        let default_index = partitions
            .iter()
            .position(|p| p.name == config.default_partition)
            .unwrap_or_else(|| {
                partitions.push(Partition {
                    name: config.default_partition.clone(),
                    cap: None,
                    queue: FairQueue::new(),
                    in_flight: 0,
                });
                partitions.len() - 1
            });
        Self {
            partitions,
            routes,
            default_index,
            cursor: 0,
            len: 0,
        }
    }

    fn index_of_type(&self, task_type: &str) -> usize {
        self.routes.get(task_type).copied().unwrap_or(self.default_index)
    }

    fn index_of_partition(&self, partition: &str) -> Option<usize> {
        self.partitions.iter().position(|p| p.name == partition)
    }

    /// Partition name a task type routes to.
    #[must_use]
    pub fn route(&self, task_type: &str) -> &str {
        &self.partitions[self.index_of_type(task_type)].name
    }

    /// Enqueue an entry into its task's partition.
    pub fn push(&mut self, entry: ReadyEntry) {
        let index = self
            .index_of_partition(&entry.task.partition)
            .unwrap_or(self.default_index);
        self.partitions[index].queue.push(entry);
        self.len += 1;
    }

    /// Take one entry, visiting partitions with spare capacity round-robin.
    pub fn pop(&mut self) -> Option<ReadyEntry> {
        let count = self.partitions.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let partition = &mut self.partitions[index];
            if !partition.has_capacity() {
                continue;
            }
            if let Some(entry) = partition.queue.pop() {
                partition.in_flight += 1;
                self.len -= 1;
                self.cursor = (index + 1) % count;
                return Some(entry);
            }
        }
        None
    }

    /// Take up to `max` entries.
    pub fn pop_batch(&mut self, max: usize) -> Vec<ReadyEntry> {
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            match self.pop() {
                Some(entry) => batch.push(entry),
                None => break,
            }
        }
        batch
    }

    /// Return a slot claimed by [`pop`](Self::pop).
    pub fn release(&mut self, partition: &str) {
        if let Some(index) = self.index_of_partition(partition) {
            let p = &mut self.partitions[index];
            p.in_flight = p.in_flight.saturating_sub(1);
        }
    }

    /// Remove a queued task. Returns false if it was not in the shared queue.
    pub fn remove(&mut self, task: &Task) -> bool {
        let Some(index) = self.index_of_partition(&task.partition) else {
            return false;
        };
        if self.partitions[index].queue.remove(&task.tenant, task.id).is_some() {
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Boost entries waiting longer than `threshold_ms`.
    pub fn age(&mut self, now_ms: u128, threshold_ms: u128) -> usize {
        self.partitions
            .iter_mut()
            .map(|p| p.queue.age(now_ms, threshold_ms))
            .sum()
    }

    /// Remove entries past their deadline.
    pub fn prune_expired(&mut self, now_ms: u128) -> Vec<ReadyEntry> {
        let mut pruned = Vec::new();
        for p in &mut self.partitions {
            pruned.extend(p.queue.prune_expired(now_ms));
        }
        self.len -= pruned.len();
        pruned
    }

    /// Queued entries per partition.
    #[must_use]
    pub fn depths(&self) -> BTreeMap<String, usize> {
        self.partitions
            .iter()
            .map(|p| (p.name.clone(), p.queue.len()))
            .collect()
    }

    /// Claimed slots per partition.
    #[must_use]
    pub fn in_flight(&self) -> BTreeMap<String, usize> {
        self.partitions
            .iter()
            .map(|p| (p.name.clone(), p.in_flight))
            .collect()
    }

    /// Total queued entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is queued.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
