//! Runtime services: the delayed-job timer and the API surface.

pub mod api;
pub mod timer;

pub use api::{health, task_status, Health, TaskStatusResponse};
pub use timer::{Timer, TimerKey};
