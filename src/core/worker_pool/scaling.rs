//! Scale-up and scale-down decisions from queue depth samples.
//!
//! The controller is pure state: the pool manager feeds it one sample per
//! interval and applies the decision.

use crate::config::PoolConfig;

/// Samples in a row needed before acting.
pub const CONSECUTIVE_SAMPLES: u32 = 2;

/// What the manager should do after a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    /// Keep the current worker set.
    Hold,
    /// Start one more worker.
    SpawnOne,
    /// Retire one idle worker.
    RetireOne,
}

/// Hysteresis over depth samples.
#[derive(Debug, Clone)]
pub struct ScalingController {
    min_workers: usize,
    max_workers: usize,
    high_water: usize,
    low_water: usize,
    high_streak: u32,
    low_streak: u32,
}

impl ScalingController {
    /// Create a controller from pool settings.
    #[must_use]
    pub const fn new(config: &PoolConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            high_water: config.high_water,
            low_water: config.low_water,
            high_streak: 0,
            low_streak: 0,
        }
    }

    /// Feed one sample.
    ///
    /// After two consecutive high samples every further high sample spawns
    /// one worker until `max_workers`. Two consecutive low samples retire one
    /// worker, after which the low streak starts over.
    pub fn observe(&mut self, depth: usize, active: usize) -> ScalingDecision {
        if depth > self.high_water {
            self.low_streak = 0;
            self.high_streak = self.high_streak.saturating_add(1);
            if self.high_streak >= CONSECUTIVE_SAMPLES && active < self.max_workers {
                return ScalingDecision::SpawnOne;
            }
        } else if depth < self.low_water {
            self.high_streak = 0;
            self.low_streak = self.low_streak.saturating_add(1);
            if self.low_streak >= CONSECUTIVE_SAMPLES && active > self.min_workers {
                return ScalingDecision::RetireOne;
            }
        } else {
            self.high_streak = 0;
            self.low_streak = 0;
        }
        ScalingDecision::Hold
    }

    /// Note that a retire decision was carried out.
    pub const fn retired(&mut self) {
        self.low_streak = 0;
    }

    /// Current high-sample streak.
    #[must_use]
    pub const fn high_streak(&self) -> u32 {
        self.high_streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(min: usize, max: usize) -> ScalingController {
        ScalingController::new(&PoolConfig {
            min_workers: min,
            max_workers: max,
            high_water: 10,
            low_water: 2,
            ..PoolConfig::default()
        })
    }

    #[test]
    fn test_single_high_sample_holds() {
        let mut c = controller(1, 4);
        assert_eq!(c.observe(50, 1), ScalingDecision::Hold);
        assert_eq!(c.observe(5, 1), ScalingDecision::Hold);
        assert_eq!(c.observe(50, 1), ScalingDecision::Hold);
    }

    #[test]
    fn test_one_worker_per_high_sample_capped() {
        let mut c = controller(1, 3);
        let mut active = 1;
        let mut spawned = Vec::new();
        for _ in 0..6 {
            if c.observe(100, active) == ScalingDecision::SpawnOne {
                active += 1;
            }
            spawned.push(active);
        }
        assert_eq!(spawned, vec![1, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn test_retire_after_two_low_samples_not_below_min() {
        let mut c = controller(2, 4);
        assert_eq!(c.observe(0, 3), ScalingDecision::Hold);
        assert_eq!(c.observe(0, 3), ScalingDecision::RetireOne);
        c.retired();
        assert_eq!(c.observe(0, 2), ScalingDecision::Hold);
        assert_eq!(c.observe(0, 2), ScalingDecision::Hold);
    }

    #[test]
    fn test_mid_band_resets_streaks() {
        let mut c = controller(1, 4);
        c.observe(100, 1);
        c.observe(5, 1);
        assert_eq!(c.high_streak(), 0);
    }
}
