//! Reliability manager composition, alerting and status tests

mod common;

use collector_resilience::manager::StatusReport;
use collector_resilience::monitoring::{AnomalyKind, SYSTEM_COMPONENT};
use collector_resilience::{
    default_manager, fallback, health_check_fn, AlertLevel, CircuitState, ExecuteOptions,
    FailureKind, HealthStatus, ManagerConfig, Outcome, RateLimiterConfig, ReliabilityConfig,
    ReliabilityManager,
};
use common::{breaker_config, fast_retry, manager, FlakyOperation};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_breaker_sees_one_success_for_recovered_retry(manager: ReliabilityManager) {
    let breaker = manager
        .register_circuit_breaker("exchange", breaker_config(3))
        .unwrap();
    manager
        .register_retry_policy("fetch_trades", fast_retry(4))
        .unwrap();
    let op = FlakyOperation::new(3);

    let outcome = manager
        .execute("exchange", "fetch_trades", || op.call(), ExecuteOptions::new())
        .await;

    assert!(matches!(outcome, Outcome::Success(4)));
    assert_eq!(op.calls(), 4);

    let stats = breaker.get_stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.failure_count, 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_count_as_one_breaker_failure(manager: ReliabilityManager) {
    let breaker = manager
        .register_circuit_breaker("exchange", breaker_config(2))
        .unwrap();
    let op = FlakyOperation::always_failing("connection refused");

    let first = manager
        .execute("exchange", "fetch", || op.call(), ExecuteOptions::new())
        .await;
    assert_eq!(first.failure_kind(), Some(FailureKind::Connection));
    assert_eq!(breaker.state().await, CircuitState::Closed);

    manager
        .execute("exchange", "fetch", || op.call(), ExecuteOptions::new())
        .await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(op.calls(), 6);

    let rejected = manager
        .execute(
            "exchange",
            "fetch",
            || op.call(),
            ExecuteOptions::new().with_fallback(fallback(|| async { Ok(0) })),
        )
        .await;
    assert_eq!(rejected.value(), Some(&0));
    assert_eq!(op.calls(), 6);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejection_skips_breaker(manager: ReliabilityManager) {
    manager
        .register_rate_limiter("binance", RateLimiterConfig::token_bucket(1.0, 1))
        .unwrap();
    let op = FlakyOperation::new(0);

    let options = || ExecuteOptions::new().with_rate_limit_key("binance:BTCUSDT");
    assert!(manager
        .execute("binance", "depth", || op.call(), options())
        .await
        .is_success());
    let outcome = manager
        .execute("binance", "depth", || op.call(), options())
        .await;

    assert_eq!(outcome.failure_kind(), Some(FailureKind::RateLimit));
    assert_eq!(op.calls(), 1);

    let breaker = manager.registry().breaker("binance").unwrap();
    assert_eq!(breaker.get_stats().await.total_requests, 1);
    let metrics = manager.metrics().component_metrics("binance").unwrap();
    assert_eq!(metrics.rejected_requests, 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_alerts_deduplicated_within_cooldown(manager: ReliabilityManager) {
    let delivered = Arc::new(AtomicU32::new(0));
    let counter = delivered.clone();
    manager.on_alert(move |notification| {
        assert_eq!(notification.component, "postgres");
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    manager.register_health_check("postgres", health_check_fn(|| async { false }));

    manager.run_health_check_cycle().await;
    manager.run_health_check_cycle().await;

    let active = manager.active_alerts();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].level, AlertLevel::Critical);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    assert!(manager.resolve_alert(&active[0].id));
    assert!(!manager.resolve_alert(&active[0].id));
    assert!(manager.active_alerts().is_empty());

    let status = manager.get_comprehensive_status().await;
    assert_eq!(status.recent_alerts.len(), 1);
    assert!(status.recent_alerts[0].resolved);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_alert_stream_subscription(manager: ReliabilityManager) {
    let mut alerts = manager.subscribe_alerts();
    manager.register_health_check("redis", health_check_fn(|| async { false }));

    manager.run_health_check_cycle().await;

    let notification = alerts.recv().await.unwrap();
    assert_eq!(notification.component, "redis");
    assert_eq!(notification.level, AlertLevel::Critical);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_slow_health_check_times_out(manager: ReliabilityManager) {
    manager.register_health_check(
        "slow_api",
        health_check_fn(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            true
        }),
    );
    manager.register_health_check("fast_api", health_check_fn(|| async { true }));

    manager.run_health_check_cycle().await;

    let StatusReport::All(statuses) = manager.get_status(None).await.unwrap() else {
        panic!("expected every component");
    };
    assert_eq!(statuses["slow_api"].health, HealthStatus::Unhealthy);
    assert_eq!(statuses["fast_api"].health, HealthStatus::Healthy);
    let probe = statuses["slow_api"].last_health_check.as_ref().unwrap();
    assert!(probe.error.as_deref().unwrap().contains("timed out"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_comprehensive_status_is_a_pure_read(manager: ReliabilityManager) {
    manager
        .register_circuit_breaker("coingecko", breaker_config(3))
        .unwrap();
    manager
        .register_rate_limiter("coingecko", RateLimiterConfig::default())
        .unwrap();
    manager
        .register_circuit_breaker("bitstamp", breaker_config(3))
        .unwrap()
        .force_open()
        .await;
    let op = FlakyOperation::new(1);
    manager
        .execute("coingecko", "prices", || op.call(), ExecuteOptions::new())
        .await;
    manager.run_health_check_cycle().await;
    manager.run_data_quality_cycle().await;

    let first = manager.get_comprehensive_status().await;
    let mut second = manager.get_comprehensive_status().await;
    second.timestamp = first.timestamp;
    second.uptime_seconds = first.uptime_seconds;

    assert_eq!(first, second);
    assert_eq!(first.system_metrics.total_requests, 1);
    assert_eq!(first.retry.successful_after_retry, 1);
    assert_eq!(first.overall_health, HealthStatus::Unhealthy);
    assert_eq!(first.components["coingecko"].health, HealthStatus::Healthy);
    let bitstamp = first.components["bitstamp"].circuit_breaker.as_ref().unwrap();
    assert!(bitstamp.half_open_at.is_some());
    assert!(serde_json::to_value(&first).unwrap()["components"]["coingecko"].is_object());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_failure_burst_detected(manager: ReliabilityManager) {
    manager
        .register_circuit_breaker("kraken", breaker_config(100))
        .unwrap();
    let op = FlakyOperation::always_failing("502 bad gateway");
    for _ in 0..12 {
        let outcome = manager
            .execute(
                "kraken",
                "ohlc",
                || op.call(),
                ExecuteOptions::new().with_policy(fast_retry(1)),
            )
            .await;
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Server));
    }

    manager.run_health_check_cycle().await;
    let anomalies = manager.run_anomaly_detection_cycle().await;

    let bursts: Vec<&str> = anomalies
        .iter()
        .filter(|a| a.kind == AnomalyKind::FailureBurst)
        .map(|a| a.component.as_str())
        .collect();
    assert_eq!(bursts, vec![SYSTEM_COMPONENT, "kraken"]);

    let quality = manager.run_data_quality_cycle().await;
    assert_eq!(quality.completeness, 0.0);
    assert!(manager
        .active_alerts()
        .iter()
        .any(|a| a.component == "data_quality.completeness"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_data_quality_purges_idle_limiter_keys(manager: ReliabilityManager) {
    let limiter = manager
        .register_rate_limiter("s3", RateLimiterConfig::default())
        .unwrap();
    let op = FlakyOperation::new(0);
    manager
        .execute(
            "s3",
            "get",
            || op.call(),
            ExecuteOptions::new().with_rate_limit_key("bucket-a"),
        )
        .await;
    assert_eq!(limiter.get_stats().keys, 1);

    tokio::time::advance(manager.config().idle_key_ttl).await;
    manager.run_data_quality_cycle().await;

    assert_eq!(limiter.get_stats().keys, 0);
}

#[tokio::test(start_paused = true)]
async fn test_from_config_registers_components() {
    let mut config = ReliabilityConfig::default();
    config
        .circuit_breakers
        .insert("binance".to_string(), breaker_config(3));
    config.rate_limiters.insert(
        "binance".to_string(),
        RateLimiterConfig::fixed_window(1200, Duration::from_secs(60)),
    );
    config
        .retry_policies
        .insert("fetch_klines".to_string(), fast_retry(5));

    let manager = ReliabilityManager::from_config(&config).unwrap();

    let StatusReport::Component(status) = manager.get_status(Some("binance")).await.unwrap()
    else {
        panic!("expected a single component");
    };
    assert_eq!(status.circuit_breaker.unwrap().state, CircuitState::Closed);
    assert_eq!(status.rate_limiter.unwrap().keys, 0);
    assert_eq!(
        manager.retry_engine().policy_for("fetch_klines").max_attempts,
        5
    );
}

#[tokio::test(start_paused = true)]
async fn test_from_config_rejects_invalid_component() {
    let mut config = ReliabilityConfig::default();
    config
        .rate_limiters
        .insert("broken".to_string(), RateLimiterConfig::token_bucket(0.0, 1));

    let err = ReliabilityManager::from_config(&config).err().unwrap();
    assert!(err.to_string().contains("rate limiter 'broken'"));
}

#[tokio::test(start_paused = true)]
async fn test_background_loops_stop_on_shutdown() {
    let manager = Arc::new(ReliabilityManager::new(ManagerConfig {
        health_check_interval: Duration::from_secs(10),
        anomaly_check_interval: Duration::from_secs(10),
        ..Default::default()
    }));
    manager.start();

    tokio::time::sleep(Duration::from_secs(25)).await;
    manager.shutdown().await;
    let closed = manager.metrics().history().len();
    assert_eq!(closed, 2);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.metrics().history().len(), closed);
    assert!(!manager.get_comprehensive_status().await.running);
}

#[test]
fn test_default_manager_is_shared() {
    assert!(Arc::ptr_eq(&default_manager(), &default_manager()));
}
