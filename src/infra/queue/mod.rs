//! Ready-queue building blocks.
//!
//! Composition from the outside in: [`ReadyQueue`] picks a partition,
//! [`FairQueue`] picks a tenant, [`PriorityQueue`] picks the entry. Workers
//! move batches of entries into their own [`WorkerDeque`].

pub mod deque;
pub mod fair;
pub mod partitioned;
pub mod priority;

pub use deque::WorkerDeque;
pub use fair::FairQueue;
pub use partitioned::ReadyQueue;
pub use priority::{PriorityQueue, ReadyEntry};
