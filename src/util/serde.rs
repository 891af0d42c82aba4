//! Serializable primitive types shared across the engine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Unique task identifier, monotonic within an engine's lifetime.
pub type TaskId = u64;

/// Tenant identifier used for fair scheduling.
pub type TenantId = String;

/// Task priority. Higher variants are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work; first to be shed under load.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
    /// Never shed by the degradation policy.
    Critical,
}

impl Priority {
    /// The next level up, saturating at `Critical`.
    #[must_use]
    pub const fn boosted(self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Monotonic id source.
pub trait IdGenerator: Send + Sync {
    /// Return the next unused id.
    fn next_id(&self) -> TaskId;
}

/// Counter-backed id generator starting at 1.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    /// Create a generator whose first id is `start`.
    #[must_use]
    pub const fn starting_at(start: TaskId) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> TaskId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
