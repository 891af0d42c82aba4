//! Engine, pool and policy configuration structures.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Name of the partition that receives task types no partition claims.
pub const DEFAULT_PARTITION: &str = "default";

/// How a task's timeout relates to retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// The timeout bounds each attempt; backoff time is free.
    #[default]
    PerAttempt,
    /// The timeout is a budget from the first start, backoff included.
    Overall,
}

/// Worker pool sizing and scaling thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive at all times.
    pub min_workers: usize,
    /// Upper bound for scale-up.
    pub max_workers: usize,
    /// Interval between scaling samples in milliseconds.
    pub sample_interval_ms: u64,
    /// Aggregate depth above which a sample counts as high.
    pub high_water: usize,
    /// Aggregate depth below which a sample counts as low.
    pub low_water: usize,
    /// Tasks a worker claims from the shared queue per refill.
    pub refill_batch: usize,
    /// Upper bound on a single park before a worker rescans.
    pub park_timeout_ms: u64,
    /// Stack size for worker threads in bytes.
    pub thread_stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            min_workers: 1,
            max_workers: cpus,
            sample_interval_ms: 100,
            high_water: 64,
            low_water: 4,
            refill_batch: 4,
            park_timeout_ms: 100,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    /// Validate pool sizing values.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_workers == 0 {
            return Err("min_workers must be greater than 0".into());
        }
        if self.max_workers < self.min_workers {
            return Err("max_workers must be >= min_workers".into());
        }
        if self.sample_interval_ms == 0 {
            return Err("sample_interval_ms must be greater than 0".into());
        }
        if self.low_water >= self.high_water {
            return Err("low_water must be below high_water".into());
        }
        if self.refill_batch == 0 {
            return Err("refill_batch must be greater than 0".into());
        }
        if self.park_timeout_ms == 0 {
            return Err("park_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Sampling interval as a `Duration`.
    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Park timeout as a `Duration`.
    #[must_use]
    pub const fn park_timeout(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms)
    }
}

/// A type-routed queue partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Partition name.
    pub name: String,
    /// Task types routed here.
    #[serde(default)]
    pub task_types: Vec<String>,
    /// Maximum tasks of this partition claimed by workers at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl PartitionConfig {
    /// Create a partition serving the given task types.
    pub fn new(name: impl Into<String>, task_types: &[&str]) -> Self {
        Self {
            name: name.into(),
            task_types: task_types.iter().map(|t| (*t).to_string()).collect(),
            max_concurrency: None,
        }
    }

    /// Cap concurrent claims for this partition.
    #[must_use]
    pub const fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap);
        self
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the exponential delay in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the computed delay, added on top.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            max_delay_ms: 10_000,
            jitter_ratio: 0.1,
        }
    }
}

/// Circuit breaker thresholds, applied per circuit key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Disable to let every call through.
    pub enabled: bool,
    /// Number of recent outcomes considered.
    pub window_size: usize,
    /// Outcomes required before the breaker may open.
    pub min_calls: usize,
    /// Failure ratio in `(0, 1]` that opens the breaker.
    pub failure_threshold: f64,
    /// Time spent open before a probe is allowed, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 20,
            min_calls: 10,
            failure_threshold: 0.5,
            cooldown_ms: 5_000,
        }
    }
}

/// Load-shedding thresholds on aggregate queue depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SheddingConfig {
    /// Hard cap; submissions beyond it are always rejected.
    pub max_queue_depth: usize,
    /// Depth at which payloads are asked to run in cheap mode.
    pub degrade_depth: usize,
    /// Depth at which low-priority submissions are rejected.
    pub shed_depth: usize,
    /// Depth at which only high-priority work is admitted.
    pub critical_depth: usize,
    /// Queue wait above which the level is raised one step.
    pub latency_slo_ms: Option<u64>,
}

impl Default for SheddingConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 100_000,
            degrade_depth: 1_000,
            shed_depth: 5_000,
            critical_depth: 20_000,
            latency_slo_ms: None,
        }
    }
}

impl SheddingConfig {
    /// Validate that thresholds are ordered.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if !(self.degrade_depth <= self.shed_depth && self.shed_depth <= self.critical_depth) {
            return Err("degrade_depth <= shed_depth <= critical_depth must hold".into());
        }
        Ok(())
    }
}

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Type-routed partitions. Unlisted types go to `default_partition`.
    pub partitions: Vec<PartitionConfig>,
    /// Partition for unrouted task types.
    pub default_partition: String,
    /// Retry backoff settings.
    pub retry: RetryConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Load-shedding settings.
    pub shedding: SheddingConfig,
    /// Relationship between timeouts and retries.
    pub timeout_policy: TimeoutPolicy,
    /// Timeout for tasks that do not set one, in milliseconds.
    pub default_timeout_ms: u64,
    /// Retries for tasks that do not set a count.
    pub default_max_retries: u32,
    /// Ready tasks older than this are boosted one priority level.
    pub aging_threshold_ms: Option<u64>,
    /// Finished tasks kept for `status()` and as dependency targets. Older
    /// ones are evicted, oldest first, at each pool sample.
    pub retain_terminal: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            partitions: Vec::new(),
            default_partition: DEFAULT_PARTITION.to_string(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            shedding: SheddingConfig::default(),
            timeout_policy: TimeoutPolicy::default(),
            default_timeout_ms: 30_000,
            default_max_retries: 0,
            aging_threshold_ms: None,
            retain_terminal: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker bounds.
    #[must_use]
    pub const fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.pool.min_workers = min;
        self.pool.max_workers = max;
        self
    }

    /// Set the scaling sample interval.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.pool.sample_interval_ms = saturating_millis(interval);
        self
    }

    /// Set the scaling water marks.
    #[must_use]
    pub const fn with_water_marks(mut self, low: usize, high: usize) -> Self {
        self.pool.low_water = low;
        self.pool.high_water = high;
        self
    }

    /// Set how many tasks a worker claims per refill.
    #[must_use]
    pub const fn with_refill_batch(mut self, batch: usize) -> Self {
        self.pool.refill_batch = batch;
        self
    }

    /// Add a partition.
    #[must_use]
    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Replace the retry settings.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the circuit breaker settings.
    #[must_use]
    pub const fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Replace the shedding settings.
    #[must_use]
    pub const fn with_shedding(mut self, shedding: SheddingConfig) -> Self {
        self.shedding = shedding;
        self
    }

    /// Set the timeout policy.
    #[must_use]
    pub const fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    /// Set the default per-task timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Enable priority aging.
    #[must_use]
    pub fn with_aging_threshold(mut self, threshold: Duration) -> Self {
        self.aging_threshold_ms = Some(saturating_millis(threshold));
        self
    }

    /// Keep at most `count` finished tasks queryable.
    #[must_use]
    pub const fn with_retain_terminal(mut self, count: usize) -> Self {
        self.retain_terminal = count;
        self
    }

    /// Default timeout as a `Duration`.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Validate all nested sections.
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        self.shedding
            .validate()
            .map_err(|e| format!("shedding invalid: {e}"))?;
        if self.default_timeout_ms == 0 {
            return Err("default_timeout_ms must be greater than 0".into());
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err("retry delays must satisfy 0 < base_delay_ms <= max_delay_ms".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err("retry jitter_ratio must be within [0, 1]".into());
        }
        let cb = &self.circuit_breaker;
        if cb.enabled {
            if cb.window_size == 0 || cb.min_calls == 0 || cb.min_calls > cb.window_size {
                return Err("circuit breaker needs 0 < min_calls <= window_size".into());
            }
            if !(cb.failure_threshold > 0.0 && cb.failure_threshold <= 1.0) {
                return Err("circuit breaker failure_threshold must be within (0, 1]".into());
            }
        }
        let mut seen = std::collections::HashSet::new();
        for partition in &self.partitions {
            if !seen.insert(partition.name.as_str()) {
                return Err(format!("partition `{}` defined twice", partition.name));
            }
            if partition.max_concurrency == Some(0) {
                return Err(format!(
                    "partition `{}` max_concurrency must be greater than 0",
                    partition.name
                ));
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_json_str(&raw).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
    }

    /// Build configuration from defaults overridden by `TASK_ENGINE_*`
    /// environment variables. A `.env` file is loaded first when present.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        override_from_env(&mut cfg.pool.min_workers, "TASK_ENGINE_MIN_WORKERS")?;
        override_from_env(&mut cfg.pool.max_workers, "TASK_ENGINE_MAX_WORKERS")?;
        override_from_env(&mut cfg.pool.sample_interval_ms, "TASK_ENGINE_SAMPLE_INTERVAL_MS")?;
        override_from_env(&mut cfg.pool.high_water, "TASK_ENGINE_HIGH_WATER")?;
        override_from_env(&mut cfg.pool.low_water, "TASK_ENGINE_LOW_WATER")?;
        override_from_env(&mut cfg.shedding.max_queue_depth, "TASK_ENGINE_MAX_QUEUE_DEPTH")?;
        override_from_env(&mut cfg.default_timeout_ms, "TASK_ENGINE_DEFAULT_TIMEOUT_MS")?;
        override_from_env(&mut cfg.default_max_retries, "TASK_ENGINE_DEFAULT_MAX_RETRIES")?;
        override_from_env(&mut cfg.retain_terminal, "TASK_ENGINE_RETAIN_TERMINAL")?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn override_from_env<T>(slot: &mut T, var: &str) -> AppResult<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(var) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {var}: {raw}"))?;
    }
    Ok(())
}
