//! Exponential backoff with additive jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Backoff schedule shared by all tasks of an engine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max,
            jitter_ratio,
        }
    }

    /// Build from configuration.
    #[must_use]
    pub const fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.jitter_ratio,
        )
    }

    /// Whether another attempt is allowed after `attempts_made` of
    /// `max_attempts` (first attempt included).
    #[must_use]
    pub const fn should_retry(attempts_made: u32, max_attempts: u32) -> bool {
        attempts_made < max_attempts
    }

    /// Delay before the next attempt, without jitter: `base * 2^attempts_made`,
    /// capped. After the first attempt this is `base * 2`.
    #[must_use]
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        2u32.checked_pow(attempts_made)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay before the next attempt with jitter in `[0, delay * ratio]` added.
    /// Never shorter than [`RetryPolicy::backoff`].
    #[must_use]
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let delay = self.backoff(attempts_made);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let span_ms = (delay.as_millis() as f64 * self.jitter_ratio) as u64;
        if span_ms == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..=span_ms);
        delay + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
