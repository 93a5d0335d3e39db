//! Retry engine tests

mod common;

use collector_resilience::outcome::fallback;
use collector_resilience::{
    BackoffStrategy, ErrorClassifier, FailureKind, ReliabilityError, RetryBuilder, RetryEngine,
    RetryPolicy,
};
use common::{fast_retry, FlakyOperation};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn engine(policy: RetryPolicy) -> RetryEngine {
    RetryEngine::new(policy, Arc::new(ErrorClassifier::new()))
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_kind_attempted_once() {
    let policy = RetryBuilder::new()
        .max_attempts(3)
        .never_retry([FailureKind::Validation])
        .jitter(0.0)
        .build()
        .unwrap();
    let engine = engine(policy);
    let op = FlakyOperation::always_failing("validation failed: missing field 'close'");

    let err = engine.execute("parse_candle", || op.call()).await.unwrap_err();

    assert_eq!(op.calls(), 1);
    match err {
        ReliabilityError::RetryExhausted { kind, attempts, .. } => {
            assert_eq!(kind, FailureKind::Validation);
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[case("Unauthorized connection attempt", FailureKind::Auth)]
#[case("invalid connector id in network request", FailureKind::Validation)]
#[tokio::test(start_paused = true)]
async fn test_default_policy_does_not_retry_client_errors(
    #[case] message: &'static str,
    #[case] expected: FailureKind,
) {
    let engine = engine(RetryPolicy::default());
    let op = FlakyOperation::always_failing(message);

    let err = engine.execute("place_order", || op.call()).await.unwrap_err();

    assert_eq!(op.calls(), 1);
    assert_eq!(err.failure_kind(), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn test_exponential_delays_are_clamped() {
    let policy = RetryBuilder::new()
        .max_attempts(6)
        .base_delay(Duration::from_secs(1))
        .multiplier(2.0)
        .max_delay(Duration::from_secs(10))
        .jitter(0.0)
        .build()
        .unwrap();
    let engine = engine(policy);
    let op = FlakyOperation::always_failing("connection reset");

    let started = Instant::now();
    assert!(engine.execute("fetch", || op.call()).await.is_err());

    let delays: Vec<Duration> = engine
        .recent_attempts(10)
        .await
        .iter()
        .skip(1)
        .map(|r| r.delay_before)
        .collect();
    assert_eq!(
        delays,
        [1, 2, 4, 8, 10].map(Duration::from_secs).to_vec()
    );
    assert_eq!(started.elapsed(), Duration::from_secs(25));
}

#[rstest]
#[case(BackoffStrategy::Linear, [1, 2, 3, 4])]
#[case(BackoffStrategy::Fixed, [1, 1, 1, 1])]
#[case(BackoffStrategy::Exponential, [1, 2, 4, 8])]
fn test_strategy_delay_sequences(#[case] strategy: BackoffStrategy, #[case] expected: [u64; 4]) {
    let policy = RetryBuilder::new()
        .base_delay(Duration::from_secs(1))
        .backoff(strategy)
        .build()
        .unwrap();

    let delays: Vec<Duration> = policy.delays().take(4).collect();
    assert_eq!(delays, expected.map(Duration::from_secs).to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_flaky_operation_recovers() {
    let engine = engine(fast_retry(4));
    let op = FlakyOperation::new(3);

    assert_eq!(engine.execute("fetch", || op.call()).await.unwrap(), 4);

    let stats = engine.get_stats().await;
    assert_eq!(stats.successful_after_retry, 1);
    assert_eq!(stats.total_retry_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_budget_stops_retries() {
    let policy = RetryBuilder::new()
        .max_attempts(10)
        .base_delay(Duration::from_secs(1))
        .jitter(0.0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let engine = engine(policy);
    let op = FlakyOperation::always_failing("503 service unavailable");

    let err = engine.execute("upload", || op.call()).await.unwrap_err();

    // Attempts at 0s, 1s and 3s; the next sleep would end at 7s
    assert_eq!(op.calls(), 3);
    assert_eq!(err.failure_kind(), Some(FailureKind::Server));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_after_exhaustion() {
    let engine = engine(fast_retry(2));
    let op = FlakyOperation::always_failing("connection refused");

    let value = engine
        .run_with_backoff(
            "quote",
            || op.call(),
            None,
            Some(fallback(|| async { Ok(7) })),
        )
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(op.calls(), 2);
    assert_eq!(engine.get_stats().await.fallback_used, 1);
}

#[tokio::test(start_paused = true)]
async fn test_registered_policy_applies_per_operation() {
    let engine = engine(fast_retry(3));
    engine
        .set_policy_for_operation("critical_write", fast_retry(5))
        .unwrap();

    let critical = FlakyOperation::always_failing("connection refused");
    let routine = FlakyOperation::always_failing("connection refused");
    let _ = engine.execute("critical_write", || critical.call()).await;
    let _ = engine.execute("routine_read", || routine.call()).await;

    assert_eq!(critical.calls(), 5);
    assert_eq!(routine.calls(), 3);
}

#[test]
fn test_invalid_policy_is_rejected() {
    assert!(RetryBuilder::new().max_attempts(0).build().is_err());
    assert!(RetryBuilder::new()
        .base_delay(Duration::from_secs(5))
        .max_delay(Duration::from_secs(1))
        .build()
        .is_err());

    let engine = engine(RetryPolicy::default());
    let invalid = RetryPolicy {
        multiplier: 0.5,
        ..Default::default()
    };
    assert!(engine.set_policy_for_operation("x", invalid).is_err());
}
