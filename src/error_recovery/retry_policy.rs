//! Retry engine with pluggable backoff and failure classification
//!
//! An operation is executed up to `max_attempts` times. Every failure is
//! classified; the policy decides whether the kind is worth another attempt,
//! and the backoff strategy grows the delay between attempts. Policies are
//! immutable and bound to operation names through a policy cache, so
//! replacing a policy never affects a retry loop already in flight.

use crate::error::{FailureKind, ReliabilityError, Result};
use crate::error_recovery::classifier::ErrorClassifier;
use crate::error_recovery::history::{AttemptHistory, AttemptRecord};
use crate::outcome::{run_fallback, Fallback};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `d' = min(d * multiplier, max_delay)`
    Exponential,
    /// `d' = min(d + base_delay, max_delay)`
    Linear,
    /// `d' = base_delay`
    Fixed,
}

impl BackoffStrategy {
    /// Delay following `previous` under `policy`, before jitter
    pub fn next_delay(&self, previous: Duration, policy: &RetryPolicy) -> Duration {
        match self {
            BackoffStrategy::Exponential => {
                Duration::try_from_secs_f64(previous.as_secs_f64() * policy.multiplier)
                    .unwrap_or(policy.max_delay)
                    .min(policy.max_delay)
            }
            BackoffStrategy::Linear => previous
                .checked_add(policy.base_delay)
                .unwrap_or(policy.max_delay)
                .min(policy.max_delay),
            BackoffStrategy::Fixed => policy.base_delay,
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay between attempts
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    /// Relative jitter; a sleep is scaled by `1 + uniform(-j, j)`
    pub jitter_range: f64,
    /// Backoff strategy
    pub backoff_strategy: BackoffStrategy,
    /// Kinds worth retrying; empty means every kind not excluded below
    pub retryable_kinds: BTreeSet<FailureKind>,
    /// Kinds never retried; wins over `retryable_kinds`
    pub non_retryable_kinds: BTreeSet<FailureKind>,
    /// Wall-clock budget; no new attempt starts once it would be exceeded
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_range: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
            retryable_kinds: BTreeSet::new(),
            non_retryable_kinds: [FailureKind::Auth, FailureKind::Validation]
                .into_iter()
                .collect(),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Policy for latency-critical operations (fewer retries, shorter delays)
    pub fn critical() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_strategy: BackoffStrategy::Linear,
            jitter_range: 0.3,
            timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    /// Policy for background collection (more retries, longer delays)
    pub fn background() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            multiplier: 3.0,
            jitter_range: 0.5,
            ..Default::default()
        }
    }

    /// Validate policy values
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReliabilityError::config("max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ReliabilityError::config(
                "multiplier must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_range) {
            return Err(ReliabilityError::config("jitter_range must be within [0, 1]"));
        }
        if self.base_delay > self.max_delay {
            return Err(ReliabilityError::config("base_delay must not exceed max_delay"));
        }
        Ok(())
    }

    /// Whether attempt number `attempt` failing with `kind` should be followed by another
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        attempt < self.max_attempts
            && !self.non_retryable_kinds.contains(&kind)
            && (self.retryable_kinds.is_empty() || self.retryable_kinds.contains(&kind))
    }

    /// Un-jittered delay sequence starting at `base_delay`
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.base_delay), move |d| {
            Some(self.backoff_strategy.next_delay(*d, self))
        })
    }

    /// Apply jitter to a delay, never going below zero
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_range <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter_range..=self.jitter_range);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor.max(0.0)).unwrap_or(delay)
    }

    fn budget_exceeded(&self, projected: Duration) -> bool {
        self.timeout.is_some_and(|budget| projected >= budget)
    }
}

/// Retry statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Total operations attempted
    pub total_operations: u64,
    /// Successful operations (no retry needed)
    pub successful_first_attempt: u64,
    /// Successful operations (after retry)
    pub successful_after_retry: u64,
    /// Failed operations (retries exhausted or not retryable)
    pub failed_after_retries: u64,
    /// Operations rescued by a fallback after failing
    pub fallback_used: u64,
    /// Total retry attempts
    pub total_retry_attempts: u64,
    /// Average retries per operation
    pub average_retries: f64,
    /// Last retry timestamp
    pub last_retry: Option<DateTime<Utc>>,
}

/// Retry engine holding the per-operation policy cache
pub struct RetryEngine {
    default_policy: Arc<RetryPolicy>,
    policies: DashMap<String, Arc<RetryPolicy>>,
    classifier: Arc<ErrorClassifier>,
    history: Mutex<AttemptHistory>,
    stats: Mutex<RetryStats>,
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Arc::new(ErrorClassifier::new()))
    }
}

impl RetryEngine {
    /// Create new retry engine
    pub fn new(default_policy: RetryPolicy, classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            default_policy: Arc::new(default_policy),
            policies: DashMap::new(),
            classifier,
            history: Mutex::new(AttemptHistory::new()),
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// Policy bound to an operation; the first lookup caches the default
    pub fn policy_for(&self, operation: &str) -> Arc<RetryPolicy> {
        if let Some(policy) = self.policies.get(operation) {
            return policy.clone();
        }
        self.policies
            .entry(operation.to_string())
            .or_insert_with(|| self.default_policy.clone())
            .clone()
    }

    /// Replace the policy for future calls of an operation
    pub fn set_policy_for_operation(&self, operation: &str, policy: RetryPolicy) -> Result<()> {
        policy.validate()?;
        self.policies
            .insert(operation.to_string(), Arc::new(policy));
        info!("Retry policy updated for operation: {}", operation);
        Ok(())
    }

    /// Execute with the operation's cached policy and no fallback
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_with_backoff(operation_name, operation, None, None)
            .await
    }

    /// Execute `operation` until it succeeds or the policy gives up
    pub async fn run_with_backoff<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
        policy: Option<Arc<RetryPolicy>>,
        fallback: Option<Fallback<T>>,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = policy.unwrap_or_else(|| self.policy_for(operation_name));
        let started = Instant::now();
        let mut delay = policy.base_delay;
        let mut delay_before = Duration::ZERO;
        let mut attempt: u32 = 1;

        self.stats.lock().await.total_operations += 1;

        loop {
            let attempt_started = Instant::now();
            let error = match operation().await {
                Ok(value) => {
                    self.record(AttemptRecord::success(
                        attempt,
                        delay_before,
                        attempt_started.elapsed(),
                    ))
                    .await;
                    self.record_completion(attempt, true, false).await;
                    if attempt > 1 {
                        info!(
                            "Operation '{}' succeeded after {} attempts",
                            operation_name, attempt
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = self.classifier.classify(&error);
            self.record(AttemptRecord::failure(
                attempt,
                kind,
                format!("{error:#}"),
                delay_before,
                attempt_started.elapsed(),
            ))
            .await;

            let sleep_for = policy.jittered(delay);
            let retry = policy.should_retry(kind, attempt);
            let over_budget = retry && policy.budget_exceeded(started.elapsed() + sleep_for);

            if retry && !over_budget {
                debug!(
                    "Retrying '{}' after {:?} (attempt {}/{}, {})",
                    operation_name, sleep_for, attempt, policy.max_attempts, kind
                );
                {
                    let mut stats = self.stats.lock().await;
                    stats.total_retry_attempts += 1;
                    stats.last_retry = Some(Utc::now());
                }
                sleep(sleep_for).await;
                delay_before = sleep_for;
                delay = policy.backoff_strategy.next_delay(delay, &policy);
                attempt += 1;
                continue;
            }

            if over_budget {
                warn!(
                    "Retry budget for '{}' exhausted after {} attempts",
                    operation_name, attempt
                );
            } else if attempt < policy.max_attempts {
                debug!("Error not retryable for '{}': {}", operation_name, kind);
            } else {
                warn!(
                    "Operation '{}' failed after {} attempts: {:#}",
                    operation_name, attempt, error
                );
            }

            let exhausted = ReliabilityError::RetryExhausted {
                kind,
                attempts: attempt,
                source: error,
            };

            if let Some(fallback) = fallback {
                match run_fallback(fallback).await {
                    Ok(value) => {
                        info!("Using fallback for operation: {}", operation_name);
                        self.record_completion(attempt, false, true).await;
                        return Ok(value);
                    }
                    Err(fallback_error) => {
                        warn!(
                            "Fallback for '{}' failed: {:#}",
                            operation_name, fallback_error
                        );
                    }
                }
            }

            self.record_completion(attempt, false, false).await;
            return Err(exhausted);
        }
    }

    async fn record(&self, record: AttemptRecord) {
        self.history.lock().await.push(record);
    }

    async fn record_completion(&self, attempts: u32, success: bool, fallback_used: bool) {
        let mut stats = self.stats.lock().await;
        match (success, attempts) {
            (true, 1) => stats.successful_first_attempt += 1,
            (true, _) => stats.successful_after_retry += 1,
            (false, _) => stats.failed_after_retries += 1,
        }
        if fallback_used {
            stats.fallback_used += 1;
        }
        stats.average_retries = if stats.total_operations == 0 {
            0.0
        } else {
            stats.total_retry_attempts as f64 / stats.total_operations as f64
        };
    }

    /// Most recent attempt records, oldest first
    pub async fn recent_attempts(&self, n: usize) -> Vec<AttemptRecord> {
        self.history.lock().await.recent(n)
    }

    /// Number of retained attempt records
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Get retry statistics
    pub async fn get_stats(&self) -> RetryStats {
        self.stats.lock().await.clone()
    }

    /// Reset statistics and history
    pub async fn reset_stats(&self) {
        *self.stats.lock().await = RetryStats::default();
        self.history.lock().await.clear();
    }
}

/// Retry builder for fluent API
pub struct RetryBuilder {
    policy: RetryPolicy,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    /// Create new retry builder
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
        }
    }

    /// Set maximum attempts
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Set initial delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Set delay cap
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set backoff strategy
    pub fn backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.policy.backoff_strategy = strategy;
        self
    }

    /// Set exponential multiplier
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set jitter range
    pub fn jitter(mut self, range: f64) -> Self {
        self.policy.jitter_range = range;
        self
    }

    /// Only retry the given kinds
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.policy.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Never retry the given kinds
    pub fn never_retry(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.policy.non_retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Set wall-clock budget
    pub fn timeout(mut self, budget: Duration) -> Self {
        self.policy.timeout = Some(budget);
        self
    }

    /// Validate and build the policy
    pub fn build(self) -> Result<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}
