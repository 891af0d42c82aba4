//! Dependency graph resolver.
//!
//! Nodes are stored in an id-indexed map; each node keeps its unmet
//! dependency count and the ids waiting on it, so completing a task touches
//! only its direct children. Cycles can only be introduced by a batch whose
//! members reference each other, and [`DependencyGraph::validate`] rejects
//! those before anything is inserted.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::core::EngineError;
use crate::util::serde::TaskId;

/// Graph-level status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Some dependencies have not succeeded yet.
    Waiting,
    /// All dependencies succeeded; the task is with the scheduler.
    Released,
    /// Finished successfully.
    Succeeded,
    /// Failed, timed out or cancelled. Dependents are cancelled with it.
    Failed,
}

/// Outcome of inserting a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// No unmet dependencies.
    Ready,
    /// Waiting on this many dependencies.
    Pending(usize),
    /// A dependency already failed; the node is born cancelled.
    Doomed,
}

#[derive(Debug)]
struct Node {
    unmet: usize,
    dependents: Vec<TaskId>,
    status: NodeStatus,
}

/// A node to be validated and inserted.
#[derive(Debug, Clone)]
pub struct NewNode {
    /// Node id.
    pub id: TaskId,
    /// Ids this node depends on.
    pub dependencies: Vec<TaskId>,
}

/// Adjacency map of task dependencies.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, Node>,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` is known.
    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Status of a node.
    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<NodeStatus> {
        self.nodes.get(&id).map(|n| n.status)
    }

    /// Unmet dependency count of a node.
    #[must_use]
    pub fn unmet(&self, id: TaskId) -> Option<usize> {
        self.nodes.get(&id).map(|n| n.unmet)
    }

    /// Direct dependents of a node.
    #[must_use]
    pub fn dependents(&self, id: TaskId) -> &[TaskId] {
        self.nodes.get(&id).map_or(&[], |n| n.dependents.as_slice())
    }

    /// Check a batch against the graph without mutating it.
    ///
    /// Returns the batch indices in an order where every member comes after
    /// the batch members it depends on.
    ///
    /// # Errors
    ///
    /// `DuplicateTaskId`, `UnknownDependency` or `CyclicDependency`.
    pub fn validate(&self, batch: &[NewNode]) -> Result<Vec<usize>, EngineError> {
        let mut index: HashMap<TaskId, usize> = HashMap::with_capacity(batch.len());
        for (i, node) in batch.iter().enumerate() {
            if self.nodes.contains_key(&node.id) || index.insert(node.id, i).is_some() {
                return Err(EngineError::DuplicateTaskId(node.id));
            }
        }

        // In-degree counts only edges inside the batch; existing nodes are
        // already acyclic and cannot depend on new ids.
        let mut in_degree = vec![0usize; batch.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); batch.len()];
        for (i, node) in batch.iter().enumerate() {
            let mut seen = HashSet::new();
            for &dep in &node.dependencies {
                if !seen.insert(dep) {
                    continue;
                }
                if dep == node.id {
                    return Err(EngineError::CyclicDependency(node.id));
                }
                if let Some(&j) = index.get(&dep) {
                    in_degree[i] += 1;
                    children[j].push(i);
                } else if !self.nodes.contains_key(&dep) {
                    return Err(EngineError::UnknownDependency {
                        task: node.id,
                        dependency: dep,
                    });
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..batch.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(batch.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &child in &children[i] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        if order.len() < batch.len() {
            let stuck = (0..batch.len())
                .find(|&i| in_degree[i] > 0)
                .map_or(0, |i| batch[i].id);
            return Err(EngineError::CyclicDependency(stuck));
        }
        Ok(order)
    }

    /// Insert a validated node. Dependencies must already be present.
    pub fn insert(&mut self, node: &NewNode) -> Admission {
        let mut unmet = 0;
        let mut doomed = false;
        let mut waiting_on = Vec::new();
        let mut seen = HashSet::new();
        for &dep in &node.dependencies {
            if !seen.insert(dep) {
                continue;
            }
            match self.nodes.get(&dep).map(|n| n.status) {
                Some(NodeStatus::Succeeded) => {}
                Some(NodeStatus::Failed) => doomed = true,
                Some(NodeStatus::Waiting | NodeStatus::Released) => {
                    unmet += 1;
                    waiting_on.push(dep);
                }
                None => {
                    tracing::error!(task_id = node.id, dependency = dep, "inserting node with missing dependency");
                    doomed = true;
                }
            }
        }

        if doomed {
            self.nodes.insert(
                node.id,
                Node {
                    unmet: 0,
                    dependents: Vec::new(),
                    status: NodeStatus::Failed,
                },
            );
            return Admission::Doomed;
        }

        for dep in waiting_on {
            if let Some(parent) = self.nodes.get_mut(&dep) {
                parent.dependents.push(node.id);
            }
        }
        let status = if unmet == 0 {
            NodeStatus::Released
        } else {
            NodeStatus::Waiting
        };
        self.nodes.insert(
            node.id,
            Node {
                unmet,
                dependents: Vec::new(),
                status,
            },
        );
        if unmet == 0 {
            Admission::Ready
        } else {
            Admission::Pending(unmet)
        }
    }

    /// Drop a finished node. Live nodes are kept and `false` is returned.
    ///
    /// A finished node's dependents have either been released or cancelled,
    /// so its edges are no longer consulted.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.nodes.get(&id).map(|n| n.status) {
            Some(NodeStatus::Succeeded | NodeStatus::Failed) => self.nodes.remove(&id).is_some(),
            _ => false,
        }
    }

    /// Record success and return dependents whose last dependency this was.
    pub fn mark_succeeded(&mut self, id: TaskId) -> Vec<TaskId> {
        let dependents = match self.nodes.get_mut(&id) {
            Some(node) if node.status != NodeStatus::Failed => {
                node.status = NodeStatus::Succeeded;
                node.dependents.clone()
            }
            _ => return Vec::new(),
        };

        let mut released = Vec::new();
        for child in dependents {
            if let Some(node) = self.nodes.get_mut(&child) {
                if node.status != NodeStatus::Waiting {
                    continue;
                }
                node.unmet = node.unmet.saturating_sub(1);
                if node.unmet == 0 {
                    node.status = NodeStatus::Released;
                    released.push(child);
                }
            }
        }
        released
    }

    /// Record failure of `id` and return every transitive dependent that was
    /// still live, in breadth-first order. `id` itself is not included.
    pub fn mark_failed(&mut self, id: TaskId) -> Vec<TaskId> {
        let Some(node) = self.nodes.get_mut(&id) else {
            return Vec::new();
        };
        if node.status == NodeStatus::Succeeded {
            return Vec::new();
        }
        node.status = NodeStatus::Failed;

        let mut cascaded = Vec::new();
        let mut frontier: VecDeque<TaskId> = node.dependents.iter().copied().collect();
        while let Some(child_id) = frontier.pop_front() {
            let Some(child) = self.nodes.get_mut(&child_id) else {
                continue;
            };
            if matches!(child.status, NodeStatus::Failed | NodeStatus::Succeeded) {
                continue;
            }
            child.status = NodeStatus::Failed;
            cascaded.push(child_id);
            frontier.extend(child.dependents.iter().copied());
        }
        cascaded
    }
}
