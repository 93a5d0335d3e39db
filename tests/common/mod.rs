//! Common test utilities
//!
//! Provides scripted operations and reusable configuration fixtures.

#![allow(dead_code)]

use collector_resilience::{
    CircuitBreakerConfig, ManagerConfig, ReliabilityManager, RetryPolicy,
};
use rstest::fixture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Operation that fails a fixed number of times, then succeeds
pub struct FlakyOperation {
    calls: AtomicU32,
    failures_before_success: u32,
    error: &'static str,
}

impl FlakyOperation {
    pub fn new(failures_before_success: u32) -> Self {
        Self::failing_with(failures_before_success, "connection refused")
    }

    pub fn failing_with(failures_before_success: u32, error: &'static str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_before_success,
            error,
        }
    }

    /// Operation that never succeeds
    pub fn always_failing(error: &'static str) -> Self {
        Self::failing_with(u32::MAX, error)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> anyhow::Result<u32> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures_before_success {
            anyhow::bail!("{}", self.error);
        }
        Ok(n)
    }
}

/// Retry policy without jitter and with short delays
#[fixture]
pub fn fast_retry(#[default(3)] max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        jitter_range: 0.0,
        ..Default::default()
    }
}

/// Breaker that trips on consecutive failures only
#[fixture]
pub fn breaker_config(#[default(3)] failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_failure_threshold(failure_threshold)
        .with_minimum_requests(u32::MAX)
        .with_recovery_timeout(Duration::from_secs(30))
        .with_success_threshold(2)
        .with_half_open_limit(2)
}

/// Manager with short loop intervals
#[fixture]
pub fn manager() -> ReliabilityManager {
    ReliabilityManager::with_retry_policy(
        ManagerConfig {
            health_check_interval: Duration::from_secs(1),
            anomaly_check_interval: Duration::from_secs(1),
            ..Default::default()
        },
        fast_retry(3),
    )
}
