//! Builders to construct engines from configuration.

pub mod engine_builder;

pub use engine_builder::EngineBuilder;
