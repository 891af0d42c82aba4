//! Per-key circuit breakers.
//!
//! A breaker tracks the last `window_size` outcomes for its key. Once at
//! least `min_calls` outcomes are recorded and the failure ratio reaches the
//! threshold it opens; calls then fail fast until the cool-down elapses, after
//! which exactly one probe is admitted. The probe's outcome closes or re-opens
//! the circuit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerConfig;
use crate::core::TaskError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass.
    Closed,
    /// Calls fail fast.
    Open,
    /// One probe call is allowed.
    HalfOpen,
}

/// Breaker for a single key.
#[derive(Debug)]
pub struct CircuitBreaker {
    window_size: usize,
    min_calls: usize,
    failure_threshold: f64,
    cooldown: Duration,
    state: CircuitState,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            window_size: config.window_size,
            min_calls: config.min_calls,
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.window_size),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Ask to make a call. `Ok(true)` means the call is the half-open probe.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` while the circuit rejects calls.
    #[allow(clippy::result_unit_err)]
    pub fn try_acquire(&mut self, now: Instant) -> Result<bool, ()> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(())
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(())
                } else {
                    self.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&mut self, probe: bool, success: bool, now: Instant) {
        match self.state {
            CircuitState::HalfOpen if probe => {
                self.probe_in_flight = false;
                if success {
                    self.state = CircuitState::Closed;
                    self.window.clear();
                    self.opened_at = None;
                } else {
                    self.trip(now);
                }
            }
            CircuitState::Closed => {
                if self.window.len() == self.window_size {
                    self.window.pop_front();
                }
                self.window.push_back(success);
                if self.window.len() >= self.min_calls && self.failure_ratio() >= self.failure_threshold {
                    self.trip(now);
                }
            }
            // Stragglers admitted before the circuit opened do not count.
            _ => {}
        }
    }

    /// Give back a permit whose outcome should not count (cancelled call).
    pub fn release(&mut self, probe: bool) {
        if probe && self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Failure ratio over the current window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn trip(&mut self, now: Instant) {
        tracing::warn!(failure_ratio = self.failure_ratio(), "circuit opened");
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.window.clear();
        self.probe_in_flight = false;
    }
}

/// Permission to run one call against a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitPermit {
    key: String,
    probe: bool,
}

impl CircuitPermit {
    /// Key the permit belongs to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this call is the half-open probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }
}

/// Lazily-populated map of breakers, one per key, kept for the engine's
/// lifetime.
pub struct CircuitRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Ask to run a call for `key`.
    ///
    /// # Errors
    ///
    /// `TaskError::CircuitOpen` while the key's circuit rejects calls.
    pub fn try_acquire(&self, key: &str, now: Instant) -> Result<CircuitPermit, TaskError> {
        if !self.config.enabled {
            return Ok(CircuitPermit {
                key: key.to_string(),
                probe: false,
            });
        }
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.config));
        match breaker.try_acquire(now) {
            Ok(probe) => {
                if probe {
                    tracing::info!(circuit = key, "circuit half-open, admitting probe");
                }
                Ok(CircuitPermit {
                    key: key.to_string(),
                    probe,
                })
            }
            Err(()) => Err(TaskError::CircuitOpen(key.to_string())),
        }
    }

    /// Record a call outcome.
    pub fn record(&self, permit: &CircuitPermit, success: bool, now: Instant) {
        if !self.config.enabled {
            return;
        }
        if let Some(breaker) = self.breakers.lock().get_mut(&permit.key) {
            breaker.record(permit.probe, success, now);
        }
    }

    /// Return a permit without recording an outcome.
    pub fn release(&self, permit: &CircuitPermit) {
        if let Some(breaker) = self.breakers.lock().get_mut(&permit.key) {
            breaker.release(permit.probe);
        }
    }

    /// State of one key; `Closed` for keys never seen.
    #[must_use]
    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(key)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Snapshot of all known keys.
    #[must_use]
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .lock()
            .iter()
            .map(|(k, b)| (k.clone(), b.state()))
            .collect()
    }
}
