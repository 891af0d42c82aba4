//! Resilience policies applied around each attempt: retry backoff and
//! per-key circuit breaking. Timeouts are enforced by the worker loop.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitRegistry, CircuitState};
pub use retry::RetryPolicy;
