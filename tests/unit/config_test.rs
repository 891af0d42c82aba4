//! Tests for configuration validation and loading

use prometheus_task_engine::config::{
    CircuitBreakerConfig, EngineConfig, PartitionConfig, SheddingConfig, TimeoutPolicy,
};
use std::time::Duration;

#[test]
fn test_default_config_is_valid() {
    let cfg = EngineConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.timeout_policy, TimeoutPolicy::PerAttempt);
    assert!(cfg.pool.max_workers >= cfg.pool.min_workers);
}

#[test]
fn test_invalid_worker_bounds() {
    assert!(EngineConfig::default().with_workers(0, 4).validate().is_err());
    assert!(EngineConfig::default().with_workers(4, 2).validate().is_err());
}

#[test]
fn test_invalid_water_marks() {
    let cfg = EngineConfig::default().with_water_marks(10, 10);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_shedding_thresholds_must_be_ordered() {
    let cfg = EngineConfig::default().with_shedding(SheddingConfig {
        degrade_depth: 100,
        shed_depth: 50,
        critical_depth: 200,
        ..SheddingConfig::default()
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_duplicate_partition_rejected() {
    let cfg = EngineConfig::default()
        .with_partition(PartitionConfig::new("io", &["fetch"]))
        .with_partition(PartitionConfig::new("io", &["store"]));
    assert!(cfg.validate().is_err());
}

#[test]
fn test_zero_partition_cap_rejected() {
    let cfg = EngineConfig::default().with_partition(PartitionConfig::new("gpu", &["embed"]).with_max_concurrency(0));
    assert!(cfg.validate().is_err());
}

#[test]
fn test_circuit_breaker_bounds() {
    let cfg = EngineConfig::default().with_circuit_breaker(CircuitBreakerConfig {
        window_size: 5,
        min_calls: 10,
        ..CircuitBreakerConfig::default()
    });
    assert!(cfg.validate().is_err());

    let disabled = EngineConfig::default().with_circuit_breaker(CircuitBreakerConfig {
        enabled: false,
        window_size: 0,
        ..CircuitBreakerConfig::default()
    });
    assert!(disabled.validate().is_ok());
}

#[test]
fn test_from_json_str_fills_defaults() {
    let cfg = EngineConfig::from_json_str(
        r#"{
            "pool": { "min_workers": 2, "max_workers": 6 },
            "partitions": [{ "name": "gpu", "task_types": ["embed"], "max_concurrency": 1 }],
            "timeout_policy": "overall",
            "aging_threshold_ms": 500
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.pool.min_workers, 2);
    assert_eq!(cfg.pool.max_workers, 6);
    assert_eq!(cfg.partitions[0].max_concurrency, Some(1));
    assert_eq!(cfg.timeout_policy, TimeoutPolicy::Overall);
    assert_eq!(cfg.aging_threshold_ms, Some(500));
    assert_eq!(cfg.default_partition, "default");
}

#[test]
fn test_from_json_str_rejects_garbage_and_invalid() {
    assert!(EngineConfig::from_json_str("not json").is_err());
    assert!(EngineConfig::from_json_str(r#"{ "pool": { "min_workers": 0 } }"#).is_err());
}

#[test]
fn test_duration_builders() {
    let cfg = EngineConfig::default()
        .with_default_timeout(Duration::from_millis(750))
        .with_sample_interval(Duration::from_millis(20))
        .with_aging_threshold(Duration::from_secs(1));
    assert_eq!(cfg.default_timeout(), Duration::from_millis(750));
    assert_eq!(cfg.pool.sample_interval(), Duration::from_millis(20));
    assert_eq!(cfg.aging_threshold_ms, Some(1000));
}

#[test]
fn test_duration_builders_saturate() {
    let cfg = EngineConfig::default()
        .with_default_timeout(Duration::MAX)
        .with_aging_threshold(Duration::MAX);
    assert_eq!(cfg.default_timeout_ms, u64::MAX);
    assert_eq!(cfg.aging_threshold_ms, Some(u64::MAX));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_retain_terminal_default_and_override() {
    assert_eq!(EngineConfig::default().retain_terminal, 10_000);
    let cfg = EngineConfig::from_json_str(r#"{ "retain_terminal": 16 }"#).unwrap();
    assert_eq!(cfg.retain_terminal, 16);
    assert_eq!(EngineConfig::default().with_retain_terminal(0).retain_terminal, 0);
}

#[test]
fn test_from_file_reports_missing_path() {
    let err = EngineConfig::from_file("/definitely/not/here.json").unwrap_err();
    assert!(err.to_string().contains("reading engine config"));
}
