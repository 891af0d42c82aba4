//! In-memory queue structures used by the scheduler.

pub mod queue;

pub use queue::{FairQueue, PriorityQueue, ReadyEntry, ReadyQueue, WorkerDeque};
