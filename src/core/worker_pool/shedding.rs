//! Peak shaving: degradation levels and admission policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::SheddingConfig;
use crate::core::EngineError;
use crate::util::serde::Priority;

/// Load level, recomputed on every pool manager sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Everything admitted.
    #[default]
    Normal,
    /// Payloads are told to take their cheap path.
    Degraded,
    /// `Low` priority submissions are rejected.
    Shedding,
    /// Only `High` and `Critical` are admitted; released dependents wait.
    Critical,
}

impl DegradationLevel {
    /// Level for a queue depth and an optional queue latency observation.
    ///
    /// Exceeding the latency objective raises the depth-derived level by one.
    #[must_use]
    pub fn evaluate(depth: usize, queue_latency_ms: Option<u64>, config: &SheddingConfig) -> Self {
        let by_depth = if depth >= config.critical_depth {
            Self::Critical
        } else if depth >= config.shed_depth {
            Self::Shedding
        } else if depth >= config.degrade_depth {
            Self::Degraded
        } else {
            Self::Normal
        };
        match (config.latency_slo_ms, queue_latency_ms) {
            (Some(slo), Some(observed)) if observed > slo => by_depth.raised(),
            _ => by_depth,
        }
    }

    /// One level higher, saturating at `Critical`.
    #[must_use]
    pub const fn raised(self) -> Self {
        match self {
            Self::Normal => Self::Degraded,
            Self::Degraded => Self::Shedding,
            Self::Shedding | Self::Critical => Self::Critical,
        }
    }

    /// Whether payloads should run in cheap mode.
    #[must_use]
    pub fn is_degraded(self) -> bool {
        self >= Self::Degraded
    }

    /// Whether dependency-released tasks wait before entering the queues.
    #[must_use]
    pub fn defers_released(self) -> bool {
        self == Self::Critical
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Degraded => 1,
            Self::Shedding => 2,
            Self::Critical => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Degraded,
            2 => Self::Shedding,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::Shedding => "shedding",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Decide whether a submission is admitted.
///
/// # Errors
///
/// `EngineError::Backpressure` when the hard depth limit would be exceeded or
/// the level sheds this priority.
pub fn admit(
    priority: Priority,
    level: DegradationLevel,
    depth: usize,
    incoming: usize,
    config: &SheddingConfig,
) -> Result<(), EngineError> {
    if depth.saturating_add(incoming) > config.max_queue_depth {
        return Err(EngineError::Backpressure(format!(
            "queue depth {depth} at limit {}",
            config.max_queue_depth
        )));
    }
    let rejected = match level {
        DegradationLevel::Normal | DegradationLevel::Degraded => false,
        DegradationLevel::Shedding => priority == Priority::Low,
        DegradationLevel::Critical => priority < Priority::High,
    };
    if rejected {
        return Err(EngineError::Backpressure(format!(
            "{level} load: {priority:?} priority submissions rejected"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SheddingConfig {
        SheddingConfig {
            max_queue_depth: 100,
            degrade_depth: 10,
            shed_depth: 20,
            critical_depth: 40,
            latency_slo_ms: Some(50),
        }
    }

    #[test]
    fn test_levels_follow_depth() {
        let c = config();
        assert_eq!(DegradationLevel::evaluate(0, None, &c), DegradationLevel::Normal);
        assert_eq!(DegradationLevel::evaluate(10, None, &c), DegradationLevel::Degraded);
        assert_eq!(DegradationLevel::evaluate(25, None, &c), DegradationLevel::Shedding);
        assert_eq!(DegradationLevel::evaluate(400, None, &c), DegradationLevel::Critical);
    }

    #[test]
    fn test_latency_raises_one_level() {
        let c = config();
        assert_eq!(DegradationLevel::evaluate(0, Some(80), &c), DegradationLevel::Degraded);
        assert_eq!(DegradationLevel::evaluate(0, Some(20), &c), DegradationLevel::Normal);
    }

    #[test]
    fn test_admission_by_level() {
        let c = config();
        assert!(admit(Priority::Low, DegradationLevel::Degraded, 0, 1, &c).is_ok());
        assert!(admit(Priority::Low, DegradationLevel::Shedding, 0, 1, &c).is_err());
        assert!(admit(Priority::Normal, DegradationLevel::Shedding, 0, 1, &c).is_ok());
        assert!(admit(Priority::Normal, DegradationLevel::Critical, 0, 1, &c).is_err());
        assert!(admit(Priority::High, DegradationLevel::Critical, 0, 1, &c).is_ok());
    }

    #[test]
    fn test_hard_limit_always_rejects() {
        let c = config();
        let err = admit(Priority::Critical, DegradationLevel::Normal, 100, 1, &c).unwrap_err();
        assert!(matches!(err, EngineError::Backpressure(_)));
    }

    #[test]
    fn test_u8_round_trip() {
        for level in [
            DegradationLevel::Normal,
            DegradationLevel::Degraded,
            DegradationLevel::Shedding,
            DegradationLevel::Critical,
        ] {
            assert_eq!(DegradationLevel::from_u8(level.as_u8()), level);
        }
    }
}
