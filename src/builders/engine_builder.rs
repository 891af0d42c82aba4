//! Builder to assemble an [`Engine`] from configuration and collaborators.

use std::path::Path;
use std::sync::Arc;

use crate::config::{EngineConfig, PartitionConfig};
use crate::core::{AppResult, Engine, EngineError, EventSink};
use crate::util::clock::{Clock, SystemClock};
use crate::util::serde::{IdGenerator, SequentialIds};

/// Collects configuration, clock, id source and event sinks, then starts an
/// engine.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    /// Start from the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            ids: Arc::new(SequentialIds::default()),
            sinks: Vec::new(),
        }
    }

    /// Start from `TASK_ENGINE_*` environment variables.
    pub fn from_env() -> AppResult<Self> {
        Ok(Self::new(EngineConfig::from_env()?))
    }

    /// Start from a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        Ok(Self::new(EngineConfig::from_file(path)?))
    }

    /// Configuration as currently assembled.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add a partition.
    #[must_use]
    pub fn partition(mut self, partition: PartitionConfig) -> Self {
        self.config.partitions.push(partition);
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the task id source.
    #[must_use]
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Subscribe a sink before the first task is accepted.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validate and start the engine.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when validation fails, `Internal` if threads cannot be
    /// spawned.
    pub fn build(self) -> Result<Engine, EngineError> {
        Engine::with_parts(self.config, self.clock, self.ids, self.sinks)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
