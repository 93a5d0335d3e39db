//! Circuit breaker pattern implementation for resilient error recovery
//!
//! A breaker temporarily stops calling a failing dependency, then lets a
//! bounded number of probes through to test recovery. Only state transitions
//! and counters are serialized through the breaker's lock; the protected
//! operation runs without holding it. Failed and rejected calls degrade to a
//! fallback, a cached response or a structured payload.

use crate::error::{FailureKind, ReliabilityError, Result};
use crate::error_recovery::classifier::ErrorClassifier;
use crate::error_recovery::history::{AttemptHistory, AttemptRecord};
use crate::outcome::{
    run_fallback, DegradeReason, DegradedResponse, DegradedValue, Fallback, Outcome,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cached responses kept before expired entries are swept
const MAX_CACHE_ENTRIES: usize = 1024;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - operations blocked
    Open,
    /// Circuit is half-open - testing if service recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Windowed failure rate that trips the circuit
    pub failure_rate_threshold: f64,
    /// Windowed requests needed before the failure rate is considered
    pub minimum_requests: u32,
    /// Window for rate-based tripping
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
    /// Time spent open before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_limit: u32,
    /// Consecutive probe successes that close the circuit
    pub success_threshold: u32,
    /// Lifetime of cached responses
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Enable detailed logging
    pub detailed_logging: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            minimum_requests: 10,
            window_size: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            half_open_limit: 3,
            success_threshold: 3,
            cache_ttl: Duration::from_secs(300),
            detailed_logging: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create configuration for critical services
    pub fn critical_service() -> Self {
        Self {
            failure_threshold: 3,
            failure_rate_threshold: 0.3,
            minimum_requests: 5,
            window_size: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(10),
            half_open_limit: 1,
            success_threshold: 5,
            cache_ttl: Duration::from_secs(60),
            detailed_logging: true,
        }
    }

    /// Create configuration for non-critical services
    pub fn non_critical_service() -> Self {
        Self {
            failure_threshold: 10,
            failure_rate_threshold: 0.7,
            minimum_requests: 20,
            window_size: Duration::from_secs(300),
            recovery_timeout: Duration::from_secs(60),
            half_open_limit: 5,
            success_threshold: 2,
            cache_ttl: Duration::from_secs(900),
            detailed_logging: false,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_failure_rate_threshold(mut self, rate: f64) -> Self {
        self.failure_rate_threshold = rate;
        self
    }

    pub fn with_minimum_requests(mut self, requests: u32) -> Self {
        self.minimum_requests = requests;
        self
    }

    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_limit(mut self, limit: u32) -> Self {
        self.half_open_limit = limit;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(ReliabilityError::config("failure_threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ReliabilityError::config("success_threshold must be at least 1"));
        }
        if self.half_open_limit == 0 {
            return Err(ReliabilityError::config("half_open_limit must be at least 1"));
        }
        if self.minimum_requests == 0 {
            return Err(ReliabilityError::config("minimum_requests must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(ReliabilityError::config(
                "failure_rate_threshold must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Consecutive probe successes while half-open
    pub success_count: u32,
    /// Probes currently in flight
    pub half_open_in_flight: u32,
    /// Total requests
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Rejected requests
    pub rejected_requests: u64,
    /// Circuit open count
    pub circuit_open_count: u64,
    /// Last failure time
    pub last_failure: Option<DateTime<Utc>>,
    /// Last success time
    pub last_success: Option<DateTime<Utc>>,
    /// Last transition time
    pub last_state_change: DateTime<Utc>,
    /// When a probe becomes allowed, while open
    pub half_open_at: Option<DateTime<Utc>>,
    /// Live cached responses
    pub cached_responses: usize,
}

/// Circuit breaker event
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerEvent {
    /// Breaker name
    pub breaker: String,
    /// Event type
    pub event_type: CircuitBreakerEventType,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Previous state
    pub previous_state: CircuitState,
    /// New state
    pub new_state: CircuitState,
    /// Additional context
    pub context: String,
}

/// Circuit breaker event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerEventType {
    /// State changed
    StateChanged,
    /// Request rejected without running the operation
    RequestRejected,
    /// Failure recorded
    FailureRecorded,
    /// Success recorded
    SuccessRecorded,
}

/// Circuit breaker listener trait
#[async_trait::async_trait]
pub trait CircuitBreakerListener: Send + Sync {
    /// Called when circuit breaker event occurs
    async fn on_event(&self, event: &CircuitBreakerEvent) -> anyhow::Result<()>;
}

type StateCallbackFn = dyn Fn(&CircuitBreakerEvent) -> anyhow::Result<()> + Send + Sync;

#[derive(Clone)]
struct StateCallback {
    target: Option<CircuitState>,
    callback: Arc<StateCallbackFn>,
}

/// Per-call options for [`CircuitBreaker::call`]
pub struct CallOptions<T> {
    /// Substitute used when the call fails or is rejected
    pub fallback: Option<Fallback<T>>,
    /// Key under which successful results are cached
    pub cache_key: Option<String>,
}

impl<T> Default for CallOptions<T> {
    fn default() -> Self {
        Self {
            fallback: None,
            cache_key: None,
        }
    }
}

impl<T> CallOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

struct CachedResponse {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Internal circuit breaker state
struct CircuitBreakerState {
    current_state: CircuitState,
    generation: u64,
    failure_count: u32,
    success_count: u32,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    last_error: Option<String>,
    history: AttemptHistory,
    cache: HashMap<String, CachedResponse>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    circuit_open_count: u64,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

const SLOT_MASK: u64 = 0xFFFF_FFFF;

/// Half-open probes in flight, tagged with the low bits of the generation
/// that admitted them. Releases from an older generation are ignored.
struct ProbeSlots(AtomicU64);

impl ProbeSlots {
    fn tag(generation: u64) -> u64 {
        (generation & SLOT_MASK) << 32
    }

    fn new(generation: u64) -> Self {
        Self(AtomicU64::new(Self::tag(generation)))
    }

    fn reset(&self, generation: u64) {
        self.0.store(Self::tag(generation), Ordering::SeqCst);
    }

    fn in_flight(&self) -> u32 {
        (self.0.load(Ordering::SeqCst) & SLOT_MASK) as u32
    }

    fn acquire(&self) -> u32 {
        ((self.0.fetch_add(1, Ordering::SeqCst) & SLOT_MASK) + 1) as u32
    }

    fn release(&self, generation: u64) -> bool {
        let tag = Self::tag(generation);
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v & !SLOT_MASK == tag && v & SLOT_MASK > 0).then(|| v - 1)
            })
            .is_ok()
    }
}

/// Admission ticket; outcomes from an older generation leave state untouched.
/// A probe permit dropped before its outcome is recorded gives its slot back.
struct Permit<'a> {
    generation: u64,
    probe: Option<&'a CircuitBreaker>,
}

impl Permit<'_> {
    fn settle(&mut self) {
        if let Some(breaker) = self.probe.take() {
            breaker.probes.release(self.generation);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.probe.take() {
            if breaker.probes.release(self.generation) {
                debug!(
                    "Circuit breaker '{}' probe cancelled, releasing its slot",
                    breaker.name
                );
            }
        }
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    classifier: Arc<ErrorClassifier>,
    state: Mutex<CircuitBreakerState>,
    probes: ProbeSlots,
    event_listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
    callbacks: RwLock<Vec<StateCallback>>,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_classifier(name, config, Arc::new(ErrorClassifier::new()))
    }

    /// Create a breaker sharing a classifier
    pub fn with_classifier(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            classifier,
            state: Mutex::new(CircuitBreakerState {
                current_state: CircuitState::Closed,
                generation: 0,
                failure_count: 0,
                success_count: 0,
                last_state_change: Instant::now(),
                last_state_change_at: Utc::now(),
                last_error: None,
                history: AttemptHistory::new(),
                cache: HashMap::new(),
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                rejected_requests: 0,
                circuit_open_count: 0,
                last_failure: None,
                last_success: None,
            }),
            probes: ProbeSlots::new(0),
            event_listeners: RwLock::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without evaluating the recovery timeout
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.current_state
    }

    /// Run `operation` through the breaker
    pub async fn call<T, E, F, Fut>(&self, operation: F, options: CallOptions<T>) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<ReliabilityError>,
        T: Serialize + DeserializeOwned,
    {
        let mut events = Vec::new();
        let permit = self.admit(&mut events).await;
        self.dispatch(events).await;

        let Some(mut permit) = permit else {
            if self.config.detailed_logging {
                debug!("Circuit breaker '{}' open, blocking request", self.name);
            }
            return self.degrade(None, options).await;
        };

        let started = Instant::now();
        let result = operation().await;
        let duration = started.elapsed();

        let mut events = Vec::new();
        match result {
            Ok(value) => {
                {
                    let mut state = self.state.lock().await;
                    self.record_success(&mut state, &mut permit, duration, &mut events);
                    if let Some(key) = &options.cache_key {
                        self.store(&mut state, key, &value);
                    }
                }
                self.dispatch(events).await;
                Outcome::Success(value)
            }
            Err(error) => {
                let error: ReliabilityError = error.into();
                let kind = self.classifier.classify_error(&error);
                {
                    let mut state = self.state.lock().await;
                    self.record_failure(&mut state, &mut permit, kind, &error, duration, &mut events);
                }
                self.dispatch(events).await;
                self.degrade(Some((kind, error)), options).await
            }
        }
    }

    async fn admit(&self, events: &mut Vec<CircuitBreakerEvent>) -> Option<Permit<'_>> {
        let mut state = self.state.lock().await;
        state.total_requests += 1;

        if state.current_state == CircuitState::Open {
            let elapsed = state.last_state_change.elapsed();
            if elapsed >= self.config.recovery_timeout {
                self.transition_state(
                    &mut state,
                    CircuitState::HalfOpen,
                    "recovery timeout elapsed",
                    events,
                );
            } else {
                state.rejected_requests += 1;
                events.push(self.event(
                    CircuitBreakerEventType::RequestRejected,
                    CircuitState::Open,
                    CircuitState::Open,
                    format!(
                        "Request blocked, circuit open for {:?}",
                        self.config.recovery_timeout - elapsed
                    ),
                ));
                return None;
            }
        }

        match state.current_state {
            CircuitState::Closed => Some(Permit {
                generation: state.generation,
                probe: None,
            }),
            CircuitState::HalfOpen if self.probes.in_flight() < self.config.half_open_limit => {
                let in_flight = self.probes.acquire();
                if self.config.detailed_logging {
                    debug!(
                        "Circuit breaker '{}' half-open, allowing probe {}/{}",
                        self.name, in_flight, self.config.half_open_limit
                    );
                }
                Some(Permit {
                    generation: state.generation,
                    probe: Some(self),
                })
            }
            CircuitState::HalfOpen => {
                state.rejected_requests += 1;
                self.transition_state(
                    &mut state,
                    CircuitState::Open,
                    "half-open probe limit exceeded",
                    events,
                );
                None
            }
            CircuitState::Open => {
                state.rejected_requests += 1;
                None
            }
        }
    }

    fn record_success(
        &self,
        state: &mut CircuitBreakerState,
        permit: &mut Permit<'_>,
        duration: Duration,
        events: &mut Vec<CircuitBreakerEvent>,
    ) {
        permit.settle();
        state
            .history
            .push(AttemptRecord::success(1, Duration::ZERO, duration));
        state.successful_requests += 1;
        state.last_success = Some(Utc::now());
        events.push(self.event(
            CircuitBreakerEventType::SuccessRecorded,
            state.current_state,
            state.current_state,
            "Operation succeeded".to_string(),
        ));

        if permit.generation != state.generation {
            return;
        }

        match state.current_state {
            CircuitState::Closed => {
                state.failure_count = 0;
                self.evaluate_trip(state, events);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_state(
                        state,
                        CircuitState::Closed,
                        "probes succeeded",
                        events,
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(
        &self,
        state: &mut CircuitBreakerState,
        permit: &mut Permit<'_>,
        kind: FailureKind,
        error: &ReliabilityError,
        duration: Duration,
        events: &mut Vec<CircuitBreakerEvent>,
    ) {
        permit.settle();
        let message = error.to_string();
        state.history.push(AttemptRecord::failure(
            1,
            kind,
            message.clone(),
            Duration::ZERO,
            duration,
        ));
        state.failed_requests += 1;
        state.last_failure = Some(Utc::now());
        state.last_error = Some(message);
        events.push(self.event(
            CircuitBreakerEventType::FailureRecorded,
            state.current_state,
            state.current_state,
            format!("Operation failed: {kind}"),
        ));

        if permit.generation != state.generation {
            debug!(
                "Circuit breaker '{}' ignoring stale failure from an earlier state",
                self.name
            );
            return;
        }

        match state.current_state {
            CircuitState::Closed => {
                state.failure_count += 1;
                self.evaluate_trip(state, events);
            }
            CircuitState::HalfOpen => {
                self.transition_state(state, CircuitState::Open, "probe failed", events);
            }
            CircuitState::Open => {}
        }
    }

    fn evaluate_trip(&self, state: &mut CircuitBreakerState, events: &mut Vec<CircuitBreakerEvent>) {
        if state.failure_count >= self.config.failure_threshold {
            let context = format!("{} consecutive failures", state.failure_count);
            self.transition_state(state, CircuitState::Open, &context, events);
            return;
        }

        // Only outcomes since the circuit last closed count toward the rate
        let window = self
            .config
            .window_size
            .min(state.last_state_change.elapsed());
        let (requests, failures) = state.history.windowed_counts(window, Instant::now());
        if requests >= self.config.minimum_requests as usize {
            let rate = failures as f64 / requests as f64;
            if rate >= self.config.failure_rate_threshold {
                let context = format!(
                    "failure rate {:.0}% over {} requests",
                    rate * 100.0,
                    requests
                );
                self.transition_state(state, CircuitState::Open, &context, events);
            }
        }
    }

    /// Transition to new state
    fn transition_state(
        &self,
        state: &mut CircuitBreakerState,
        new_state: CircuitState,
        context: &str,
        events: &mut Vec<CircuitBreakerEvent>,
    ) {
        let old_state = state.current_state;
        if old_state == new_state {
            return;
        }

        state.current_state = new_state;
        state.generation += 1;
        state.last_state_change = Instant::now();
        state.last_state_change_at = Utc::now();
        state.failure_count = 0;
        state.success_count = 0;
        self.probes.reset(state.generation);

        match new_state {
            CircuitState::Open => {
                state.circuit_open_count += 1;
                error!("Circuit breaker '{}' opened: {}", self.name, context);
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker '{}' transitioning to half-open", self.name);
            }
            CircuitState::Closed => {
                info!("Circuit breaker '{}' closed: {}", self.name, context);
            }
        }

        events.push(self.event(
            CircuitBreakerEventType::StateChanged,
            old_state,
            new_state,
            context.to_string(),
        ));
    }

    fn event(
        &self,
        event_type: CircuitBreakerEventType,
        previous_state: CircuitState,
        new_state: CircuitState,
        context: String,
    ) -> CircuitBreakerEvent {
        CircuitBreakerEvent {
            breaker: self.name.clone(),
            event_type,
            timestamp: Utc::now(),
            previous_state,
            new_state,
            context,
        }
    }

    async fn degrade<T: DeserializeOwned>(
        &self,
        failure: Option<(FailureKind, ReliabilityError)>,
        options: CallOptions<T>,
    ) -> Outcome<T> {
        let CallOptions {
            fallback,
            cache_key,
        } = options;
        let fallback_given = fallback.is_some();

        if let Some(fallback) = fallback {
            match run_fallback(fallback).await {
                Ok(value) => {
                    debug!("Circuit breaker '{}' served fallback", self.name);
                    return Outcome::Degraded(DegradedValue::Value(value), DegradeReason::Fallback);
                }
                Err(e) => warn!("Fallback for circuit breaker '{}' failed: {:#}", self.name, e),
            }
        }

        if let Some(key) = cache_key.as_deref() {
            if let Some(value) = self.cached(key).await {
                debug!("Circuit breaker '{}' served cached '{}'", self.name, key);
                return Outcome::Degraded(DegradedValue::Value(value), DegradeReason::Cache);
            }
        }

        let error_text = match failure {
            Some((kind, error)) if !fallback_given => return Outcome::Failure(kind, error),
            Some((_, error)) => Some(error.to_string()),
            None => self.state.lock().await.last_error.clone(),
        };

        Outcome::Degraded(
            DegradedValue::Payload(DegradedResponse::circuit_open(&self.name, error_text)),
            DegradeReason::Unavailable,
        )
    }

    fn store<T: Serialize>(&self, state: &mut CircuitBreakerState, key: &str, value: &T) {
        if self.config.cache_ttl.is_zero() {
            return;
        }
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                debug!("Circuit breaker '{}' cannot cache '{}': {}", self.name, key, e);
                return;
            }
        };

        let now = Instant::now();
        if state.cache.len() >= MAX_CACHE_ENTRIES {
            state.cache.retain(|_, entry| entry.expires_at > now);
        }
        state.cache.insert(
            key.to_string(),
            CachedResponse {
                value,
                expires_at: now + self.config.cache_ttl,
            },
        );
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut state = self.state.lock().await;
        let entry = state.cache.get(key)?;
        if entry.expires_at <= Instant::now() {
            state.cache.remove(key);
            return None;
        }
        match serde_json::from_value(entry.value.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Cached response '{}' on '{}' has an unexpected shape: {}",
                    key, self.name, e
                );
                None
            }
        }
    }

    /// Reset circuit breaker to closed
    pub async fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            self.transition_state(&mut state, CircuitState::Closed, "manual reset", &mut events);
            state.failure_count = 0;
            state.success_count = 0;
            state.last_error = None;
        }
        info!("Circuit breaker '{}' reset to closed state", self.name);
        self.dispatch(events).await;
    }

    /// Force the circuit open, restarting the recovery timeout
    pub async fn force_open(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.current_state == CircuitState::Open {
                state.last_state_change = Instant::now();
                state.last_state_change_at = Utc::now();
            } else {
                self.transition_state(&mut state, CircuitState::Open, "forced open", &mut events);
            }
        }
        self.dispatch(events).await;
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        let now = Instant::now();
        let half_open_at = if state.current_state == CircuitState::Open {
            chrono::Duration::from_std(self.config.recovery_timeout)
                .ok()
                .map(|timeout| state.last_state_change_at + timeout)
        } else {
            None
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.current_state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_in_flight: self.probes.in_flight(),
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            circuit_open_count: state.circuit_open_count,
            last_failure: state.last_failure,
            last_success: state.last_success,
            last_state_change: state.last_state_change_at,
            half_open_at,
            cached_responses: state.cache.values().filter(|e| e.expires_at > now).count(),
        }
    }

    /// Add event listener
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.event_listeners.write().await.push(listener);
    }

    /// Callback for every state change
    pub async fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&CircuitBreakerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_callback(None, Arc::new(callback)).await;
    }

    /// Callback for transitions into OPEN
    pub async fn on_open<F>(&self, callback: F)
    where
        F: Fn(&CircuitBreakerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_callback(Some(CircuitState::Open), Arc::new(callback))
            .await;
    }

    /// Callback for transitions into CLOSED
    pub async fn on_close<F>(&self, callback: F)
    where
        F: Fn(&CircuitBreakerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_callback(Some(CircuitState::Closed), Arc::new(callback))
            .await;
    }

    /// Callback for transitions into HALF_OPEN
    pub async fn on_half_open<F>(&self, callback: F)
    where
        F: Fn(&CircuitBreakerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_callback(Some(CircuitState::HalfOpen), Arc::new(callback))
            .await;
    }

    async fn add_callback(&self, target: Option<CircuitState>, callback: Arc<StateCallbackFn>) {
        self.callbacks
            .write()
            .await
            .push(StateCallback { target, callback });
    }

    /// Deliver events to listeners and callbacks, outside the state lock
    async fn dispatch(&self, events: Vec<CircuitBreakerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.event_listeners.read().await.clone();
        let callbacks = self.callbacks.read().await.clone();

        for event in &events {
            for listener in &listeners {
                match AssertUnwindSafe(listener.on_event(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Circuit breaker listener failed on '{}': {:#}", self.name, e),
                    Err(_) => error!("Circuit breaker listener panicked on '{}'", self.name),
                }
            }

            if event.event_type != CircuitBreakerEventType::StateChanged {
                continue;
            }
            for cb in callbacks
                .iter()
                .filter(|cb| cb.target.map_or(true, |t| t == event.new_state))
            {
                match std::panic::catch_unwind(AssertUnwindSafe(|| (cb.callback)(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("State callback failed on '{}': {:#}", self.name, e),
                    Err(_) => error!("State callback panicked on '{}'", self.name),
                }
            }
        }
    }
}
