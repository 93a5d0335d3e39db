//! Reliability manager
//!
//! The manager is the composition root of the resilience layer. It owns a
//! registry of named circuit breakers, rate limiters and health checks, a
//! retry engine with per-operation policies, the metrics collector and the
//! alert manager. Calls enter through [`ReliabilityManager::execute`]:
//!
//! ```text
//! rate limiter admit -> circuit breaker call -> retry engine -> operation
//! ```
//!
//! The breaker wraps the retry engine, so a flaky operation that eventually
//! succeeds within its retry budget counts as one success for the breaker.

pub mod loops;
pub mod registry;
pub mod status;

pub use registry::{ComponentRegistry, Components};
pub use status::{ComponentStatus, ComprehensiveStatus, StatusReport};

use crate::config::{ManagerConfig, ReliabilityConfig};
use crate::error::{ErrorReporter, FailureKind, ReliabilityError, Result};
use crate::error_recovery::circuit_breaker::{CallOptions, CircuitBreaker, CircuitBreakerConfig};
use crate::error_recovery::classifier::ErrorClassifier;
use crate::error_recovery::retry_policy::{RetryEngine, RetryPolicy};
use crate::health::{HealthCheckResult, HealthCheckable, HealthStatus};
use crate::monitoring::alerts::{AlertManager, AlertNotification, AnomalyAlert};
use crate::monitoring::metrics::{CallResult, MetricsCollector};
use crate::monitoring::quality::DataQualityMetrics;
use crate::outcome::{Fallback, Outcome};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use loops::LoopHandles;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Recently resolved alerts included in the comprehensive status
const RECENT_ALERTS: usize = 20;

/// Per-call options for [`ReliabilityManager::execute`]
pub struct ExecuteOptions<T> {
    /// Retry policy overriding the operation's registered one
    pub policy: Option<RetryPolicy>,
    /// Substitute value when the call fails or the breaker is open
    pub fallback: Option<Fallback<T>>,
    /// Cache successful results under this key
    pub cache_key: Option<String>,
    /// Rate limiter key; defaults to the component name
    pub rate_limit_key: Option<String>,
}

impl<T> Default for ExecuteOptions<T> {
    fn default() -> Self {
        Self {
            policy: None,
            fallback: None,
            cache_key: None,
            rate_limit_key: None,
        }
    }
}

impl<T> ExecuteOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }
}

/// Coordinates breakers, limiters, retries, metrics and alerts
pub struct ReliabilityManager {
    config: ManagerConfig,
    classifier: Arc<ErrorClassifier>,
    retry: RetryEngine,
    registry: ComponentRegistry,
    metrics: MetricsCollector,
    alerts: AlertManager,
    started_at: Instant,
    health_results: Mutex<HashMap<String, HealthCheckResult>>,
    quality: Mutex<DataQualityMetrics>,
    loops: Mutex<Option<LoopHandles>>,
}

impl ReliabilityManager {
    /// Create a manager with the default retry policy
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_retry_policy(config, RetryPolicy::default())
    }

    /// Create a manager with an explicit default retry policy
    pub fn with_retry_policy(config: ManagerConfig, default_policy: RetryPolicy) -> Self {
        let classifier = Arc::new(ErrorClassifier::new());
        Self {
            retry: RetryEngine::new(default_policy, classifier.clone()),
            classifier,
            registry: ComponentRegistry::new(),
            metrics: MetricsCollector::new(config.max_snapshots),
            alerts: AlertManager::new(config.alerts.clone()),
            started_at: Instant::now(),
            health_results: Mutex::new(HashMap::new()),
            quality: Mutex::new(DataQualityMetrics::default()),
            loops: Mutex::new(None),
            config,
        }
    }

    /// Build a manager and register every configured component
    pub fn from_config(config: &ReliabilityConfig) -> Result<Self> {
        config.validate()?;
        let manager =
            Self::with_retry_policy(config.manager.clone(), config.default_retry_policy.clone());

        for (name, cfg) in &config.circuit_breakers {
            manager.register_circuit_breaker(name, cfg.clone())?;
        }
        for (name, cfg) in &config.rate_limiters {
            manager.register_rate_limiter(name, cfg.clone())?;
        }
        for (operation, policy) in &config.retry_policies {
            manager.register_retry_policy(operation, policy.clone())?;
        }

        info!(
            "Reliability manager configured with {} breakers, {} limiters, {} retry policies",
            config.circuit_breakers.len(),
            config.rate_limiters.len(),
            config.retry_policies.len()
        );
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Classifier shared by the retry engine and every breaker
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn retry_engine(&self) -> &RetryEngine {
        &self.retry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Classify errors of type `E` as `kind`
    pub fn register_error_mapping<E>(&self, kind: FailureKind)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.classifier.register_mapping::<E>(kind);
    }

    /// Run `operation` for `component` through limiter, breaker and retries
    pub async fn execute<T, F, Fut>(
        &self,
        component: &str,
        operation: &str,
        f: F,
        options: ExecuteOptions<T>,
    ) -> Outcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        T: Serialize + DeserializeOwned,
    {
        if let Some(limiter) = self.registry.limiter(component) {
            let key = options.rate_limit_key.as_deref().unwrap_or(component);
            let admission = limiter.admit(key);
            if !admission.allowed {
                self.metrics.record(component, CallResult::Rejected, None);
                return Outcome::Failure(
                    FailureKind::RateLimit,
                    ReliabilityError::RateLimited {
                        key: key.to_string(),
                        retry_after: admission.retry_after,
                    },
                );
            }
        }

        let breaker = self.breaker_for(component);
        let policy = options.policy.map(Arc::new);
        let call_options = CallOptions {
            fallback: options.fallback,
            cache_key: options.cache_key,
        };

        let started = Instant::now();
        let retry = &self.retry;
        let outcome = breaker
            .call(
                move || retry.run_with_backoff(operation, f, policy, None),
                call_options,
            )
            .await;

        let (result, latency) = match &outcome {
            Outcome::Success(_) => (CallResult::Success, Some(started.elapsed())),
            Outcome::Degraded(..) => (CallResult::Degraded, None),
            Outcome::Failure(kind, _) => (CallResult::Failure(*kind), Some(started.elapsed())),
        };
        self.metrics.record(component, result, latency);

        if let Outcome::Failure(_, error) = &outcome {
            ErrorReporter::log_error(error, component, operation);
        }
        debug!(
            component = component,
            operation = operation,
            success = outcome.is_success(),
            degraded = outcome.is_degraded(),
            "Execute completed"
        );
        outcome
    }

    fn breaker_for(&self, component: &str) -> Arc<CircuitBreaker> {
        self.registry.breaker_or_insert_with(component, || {
            debug!("Creating default circuit breaker for '{}'", component);
            self.metrics.track(component);
            CircuitBreaker::with_classifier(
                component,
                self.config.default_circuit_breaker.clone(),
                self.classifier.clone(),
            )
        })
    }

    /// Register or replace the circuit breaker of `name`
    pub fn register_circuit_breaker(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>> {
        config.validate()?;
        let breaker = Arc::new(CircuitBreaker::with_classifier(
            name,
            config,
            self.classifier.clone(),
        ));
        let replaced = self.registry.update(|c| {
            c.breakers
                .insert(name.to_string(), breaker.clone())
                .is_some()
        });
        self.metrics.track(name);
        info!(
            "Circuit breaker '{}' {}",
            name,
            if replaced { "replaced" } else { "registered" }
        );
        Ok(breaker)
    }

    /// Register or replace the rate limiter of `name`
    pub fn register_rate_limiter(
        &self,
        name: &str,
        config: RateLimiterConfig,
    ) -> Result<Arc<RateLimiter>> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(name, config));
        self.registry.update(|c| {
            c.limiters.insert(name.to_string(), limiter.clone());
        });
        self.metrics.track(name);
        info!("Rate limiter '{}' registered", name);
        Ok(limiter)
    }

    /// Register or replace the retry policy of `operation`
    pub fn register_retry_policy(&self, operation: &str, policy: RetryPolicy) -> Result<()> {
        self.retry.set_policy_for_operation(operation, policy)
    }

    /// Register or replace the health check of `name`
    pub fn register_health_check(&self, name: &str, check: Arc<dyn HealthCheckable>) {
        self.registry.update(|c| {
            c.health_checks.insert(name.to_string(), check);
        });
        self.metrics.track(name);
        info!("Health check '{}' registered", name);
    }

    pub fn unregister_circuit_breaker(&self, name: &str) -> bool {
        self.registry.update(|c| c.breakers.remove(name).is_some())
    }

    pub fn unregister_rate_limiter(&self, name: &str) -> bool {
        self.registry.update(|c| c.limiters.remove(name).is_some())
    }

    /// Remove every registration, metric and stored probe of `name`
    pub fn unregister_component(&self, name: &str) -> bool {
        let removed = self.registry.update(|c| {
            let breaker = c.breakers.remove(name).is_some();
            let limiter = c.limiters.remove(name).is_some();
            let check = c.health_checks.remove(name).is_some();
            breaker || limiter || check
        });
        self.metrics.remove(name);
        self.health_results_mut().remove(name);
        if removed {
            info!("Component '{}' unregistered", name);
        }
        removed
    }

    /// Close the breaker, clear limiter keys and resolve alerts of `name`
    pub async fn reset_component(&self, name: &str) -> Result<()> {
        let components = self.registry.snapshot();
        let breaker = components.breakers.get(name);
        let limiter = components.limiters.get(name);
        if breaker.is_none() && limiter.is_none() {
            return Err(ReliabilityError::NotFound(format!("component '{name}'")));
        }

        if let Some(breaker) = breaker {
            breaker.reset().await;
        }
        if let Some(limiter) = limiter {
            limiter.reset();
        }
        self.alerts.resolve_component(name);
        info!("Component '{}' reset", name);
        Ok(())
    }

    /// Register a callback for new alerts
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&AlertNotification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.alerts.on_alert(callback);
    }

    /// Subscribe to the alert stream
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertNotification> {
        self.alerts.subscribe()
    }

    /// Resolve an active alert; `false` if it is not active
    pub fn resolve_alert(&self, alert_id: &str) -> bool {
        self.alerts.resolve(alert_id)
    }

    pub fn active_alerts(&self) -> Vec<AnomalyAlert> {
        self.alerts.active_alerts()
    }

    /// Status of one component, or of all of them
    pub async fn get_status(&self, name: Option<&str>) -> Result<StatusReport> {
        match name {
            Some(name) => {
                let components = self.registry.snapshot();
                if !components.names().contains(name) {
                    return Err(ReliabilityError::NotFound(format!("component '{name}'")));
                }
                let status = self.component_status(&components, name).await;
                Ok(StatusReport::Component(Box::new(status)))
            }
            None => Ok(StatusReport::All(self.all_component_status().await)),
        }
    }

    async fn component_status(&self, components: &Components, name: &str) -> ComponentStatus {
        let circuit_breaker = match components.breakers.get(name) {
            Some(breaker) => Some(breaker.get_stats().await),
            None => None,
        };
        let rate_limiter = components.limiters.get(name).map(|l| l.get_stats());
        let last_health_check = if components.health_checks.contains_key(name) {
            self.health_results_mut().get(name).cloned()
        } else {
            None
        };

        ComponentStatus {
            name: name.to_string(),
            health: ComponentStatus::derive_health(
                circuit_breaker.as_ref(),
                last_health_check.as_ref(),
            ),
            last_health_check,
            circuit_breaker,
            rate_limiter,
            metrics: self.metrics.component_metrics(name).unwrap_or_default(),
        }
    }

    async fn all_component_status(&self) -> BTreeMap<String, ComponentStatus> {
        let components = self.registry.snapshot();
        let mut statuses = BTreeMap::new();
        for name in components.names() {
            let status = self.component_status(&components, &name).await;
            statuses.insert(name, status);
        }
        statuses
    }

    /// Point-in-time view of everything the manager tracks
    pub async fn get_comprehensive_status(&self) -> ComprehensiveStatus {
        let components = self.all_component_status().await;
        let health: Vec<HealthStatus> = components.values().map(|c| c.health).collect();

        ComprehensiveStatus {
            timestamp: chrono::Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            running: self.is_running(),
            overall_health: HealthStatus::combine(&health),
            components,
            system_metrics: self.metrics.system_metrics(),
            data_quality: self.quality_mut().clone(),
            retry: self.retry.get_stats().await,
            active_alerts: self.alerts.active_alerts(),
            recent_alerts: self.alerts.recent_alerts(RECENT_ALERTS),
        }
    }

    fn health_results_mut(&self) -> MutexGuard<'_, HashMap<String, HealthCheckResult>> {
        self.health_results.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn quality_mut(&self) -> MutexGuard<'_, DataQualityMetrics> {
        self.quality.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn loops_mut(&self) -> MutexGuard<'_, Option<LoopHandles>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }
}

static DEFAULT_MANAGER: Lazy<Arc<ReliabilityManager>> =
    Lazy::new(|| Arc::new(ReliabilityManager::new(ManagerConfig::default())));

/// Shared process-wide manager with default settings
pub fn default_manager() -> Arc<ReliabilityManager> {
    DEFAULT_MANAGER.clone()
}
