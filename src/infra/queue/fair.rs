//! Per-tenant fair queue.
//!
//! Each tenant has its own priority heap. Tenants with work sit in a rotation
//! and are served round-robin, so a tenant's head entry waits behind at most
//! one dequeue per other active tenant.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::priority::{PriorityQueue, ReadyEntry};
use crate::util::serde::{TaskId, TenantId};

/// Round-robin over tenants, priority order within a tenant.
#[derive(Default)]
pub struct FairQueue {
    tenants: HashMap<TenantId, PriorityQueue>,
    rotation: VecDeque<TenantId>,
    len: usize,
}

impl FairQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry under its task's tenant.
    pub fn push(&mut self, entry: ReadyEntry) {
        let tenant = entry.task.tenant.clone();
        let queue = self.tenants.entry(tenant.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(tenant);
        }
        queue.push(entry);
        self.len += 1;
    }

    /// Take the best entry of the tenant whose turn it is.
    pub fn pop(&mut self) -> Option<ReadyEntry> {
        while let Some(tenant) = self.rotation.pop_front() {
            let Some(queue) = self.tenants.get_mut(&tenant) else {
                continue;
            };
            let Some(entry) = queue.pop() else {
                continue;
            };
            if queue.is_empty() {
                self.tenants.remove(&tenant);
            } else {
                self.rotation.push_back(tenant);
            }
            self.len -= 1;
            return Some(entry);
        }
        None
    }

    /// Remove a queued task.
    pub fn remove(&mut self, tenant: &str, id: TaskId) -> Option<ReadyEntry> {
        let queue = self.tenants.get_mut(tenant)?;
        let removed = queue.remove(id)?;
        if queue.is_empty() {
            self.tenants.remove(tenant);
            self.rotation.retain(|t| t != tenant);
        }
        self.len -= 1;
        Some(removed)
    }

    /// Boost long-waiting entries in every tenant.
    pub fn age(&mut self, now_ms: u128, threshold_ms: u128) -> usize {
        self.tenants
            .values_mut()
            .map(|q| q.age(now_ms, threshold_ms))
            .sum()
    }

    /// Remove entries past their deadline.
    pub fn prune_expired(&mut self, now_ms: u128) -> Vec<ReadyEntry> {
        let mut pruned = Vec::new();
        for queue in self.tenants.values_mut() {
            pruned.extend(queue.prune_expired(now_ms));
        }
        if !pruned.is_empty() {
            self.tenants.retain(|_, q| !q.is_empty());
            let tenants = &self.tenants;
            self.rotation.retain(|t| tenants.contains_key(t));
            self.len -= pruned.len();
        }
        pruned
    }

    /// Entries per tenant.
    #[must_use]
    pub fn tenant_depths(&self) -> BTreeMap<TenantId, usize> {
        self.tenants
            .iter()
            .map(|(t, q)| (t.clone(), q.len()))
            .collect()
    }

    /// Tenants with queued work.
    #[must_use]
    pub fn active_tenants(&self) -> usize {
        self.rotation.len()
    }

    /// Total entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}
