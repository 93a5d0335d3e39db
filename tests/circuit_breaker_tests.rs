//! Circuit breaker state machine and degradation tests

mod common;

use collector_resilience::outcome::DegradedValue;
use collector_resilience::{
    fallback, CallOptions, CircuitBreaker, CircuitBreakerConfig, CircuitState, DegradeReason,
    Outcome,
};
use common::{breaker_config, FlakyOperation};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::advance;

async fn trip(breaker: &CircuitBreaker, failures: u32) {
    let op = FlakyOperation::always_failing("connection refused");
    for _ in 0..failures {
        let outcome = breaker.call(|| op.call(), CallOptions::new()).await;
        assert!(outcome.is_failure());
    }
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(5)]
#[tokio::test(start_paused = true)]
async fn test_opens_after_consecutive_failures(#[case] threshold: u32) {
    let breaker = CircuitBreaker::new("binance", breaker_config(threshold));

    trip(&breaker, threshold - 1).await;
    assert_eq!(breaker.state().await, CircuitState::Closed);

    trip(&breaker, 1).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(breaker.get_stats().await.circuit_open_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_intervening_success_prevents_trip() {
    let breaker = CircuitBreaker::new("kraken", breaker_config(3));
    let healthy = FlakyOperation::new(0);

    trip(&breaker, 2).await;
    assert!(breaker
        .call(|| healthy.call(), CallOptions::new())
        .await
        .is_success());
    trip(&breaker, 2).await;

    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.get_stats().await.failure_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_does_not_invoke_operation() {
    let breaker = CircuitBreaker::new("coinbase", breaker_config(2));
    trip(&breaker, 2).await;

    let op = FlakyOperation::new(0);
    advance(Duration::from_secs(29)).await;
    let outcome = breaker.call(|| op.call(), CallOptions::new()).await;

    assert_eq!(op.calls(), 0);
    match outcome {
        Outcome::Degraded(DegradedValue::Payload(payload), DegradeReason::Unavailable) => {
            assert_eq!(payload.status, "circuit_breaker_open");
            assert!(payload.fallback);
            assert!(payload.error.unwrap().contains("connection refused"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(breaker.get_stats().await.rejected_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_recovery_resets_failure_count() {
    let breaker = CircuitBreaker::new("s3", breaker_config(2));
    trip(&breaker, 2).await;

    advance(Duration::from_secs(30)).await;
    let op = FlakyOperation::new(0);

    assert!(breaker.call(|| op.call(), CallOptions::new()).await.is_success());
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    assert!(breaker.call(|| op.call(), CallOptions::new()).await.is_success());
    assert_eq!(breaker.state().await, CircuitState::Closed);

    let stats = breaker.get_stats().await;
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.success_count, 0);
    assert_eq!(op.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let breaker = CircuitBreaker::new("postgres", breaker_config(2));
    trip(&breaker, 2).await;
    advance(Duration::from_secs(30)).await;

    trip(&breaker, 1).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    let stats = breaker.get_stats().await;
    assert_eq!(stats.circuit_open_count, 2);
    assert_eq!(
        stats.half_open_at,
        Some(stats.last_state_change + chrono::Duration::seconds(30))
    );
}

#[tokio::test(start_paused = true)]
async fn test_fallback_then_cache_then_payload() {
    let breaker = CircuitBreaker::new(
        "coingecko",
        breaker_config(1).with_cache_ttl(Duration::from_secs(60)),
    );

    let fresh = breaker
        .call(
            || async { Ok::<_, anyhow::Error>(101.5f64) },
            CallOptions::new().with_cache_key("btc"),
        )
        .await;
    assert_eq!(fresh.value(), Some(&101.5));

    trip(&breaker, 1).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    let op = FlakyOperation::new(0);
    let with_fallback = breaker
        .call(
            || async { op.call().await.map(f64::from) },
            CallOptions::new()
                .with_fallback(fallback(|| async { Ok(99.0) }))
                .with_cache_key("btc"),
        )
        .await;
    assert!(matches!(
        with_fallback,
        Outcome::Degraded(DegradedValue::Value(v), DegradeReason::Fallback) if v == 99.0
    ));

    let broken_fallback = breaker
        .call(
            || async { op.call().await.map(f64::from) },
            CallOptions::new()
                .with_fallback(fallback(|| async { anyhow::bail!("stale source") }))
                .with_cache_key("btc"),
        )
        .await;
    assert!(matches!(
        broken_fallback,
        Outcome::Degraded(DegradedValue::Value(v), DegradeReason::Cache) if v == 101.5
    ));

    let uncached = breaker
        .call(
            || async { op.call().await.map(f64::from) },
            CallOptions::new().with_cache_key("eth"),
        )
        .await;
    assert!(matches!(
        uncached,
        Outcome::Degraded(DegradedValue::Payload(_), DegradeReason::Unavailable)
    ));
    assert_eq!(op.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_error_reraised_without_fallback() {
    let breaker = CircuitBreaker::new("ftx", breaker_config(5));
    let op = FlakyOperation::always_failing("request timed out");

    let outcome = breaker.call(|| op.call(), CallOptions::new()).await;

    assert_eq!(
        outcome.failure_kind(),
        Some(collector_resilience::FailureKind::Timeout)
    );
    assert!(outcome.into_result().unwrap_err().to_string().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_state_callbacks_fire_and_failures_are_isolated() {
    let breaker = CircuitBreaker::new("bybit", breaker_config(1));
    let opened = Arc::new(AtomicU32::new(0));
    let transitions = Arc::new(AtomicU32::new(0));

    breaker
        .on_state_change(|_| anyhow::bail!("listener is down"))
        .await;
    let counter = opened.clone();
    breaker
        .on_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    let counter = transitions.clone();
    breaker
        .on_state_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    trip(&breaker, 1).await;
    advance(Duration::from_secs(30)).await;
    let op = FlakyOperation::new(0);
    breaker.call(|| op.call(), CallOptions::new()).await;

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(transitions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reset_and_force_open() {
    let breaker = CircuitBreaker::new("okx", CircuitBreakerConfig::default());

    breaker.force_open().await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    breaker.reset().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.get_stats().await.failure_count, 0);
}
