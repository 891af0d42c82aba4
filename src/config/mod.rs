//! Configuration models for the engine, its worker pool and resilience policies.

pub mod engine;

pub use engine::{
    CircuitBreakerConfig, EngineConfig, PartitionConfig, PoolConfig, RetryConfig, SheddingConfig,
    TimeoutPolicy,
};
