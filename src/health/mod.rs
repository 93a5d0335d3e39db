//! Component health checks
//!
//! A protected component may implement [`HealthCheckable`]; components that
//! do not are treated as healthy. Probes are bounded by a timeout and a
//! panicking probe counts as unhealthy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capability of a component to report its own health
#[async_trait]
pub trait HealthCheckable: Send + Sync {
    /// `true` when the component can serve requests
    async fn health_check(&self) -> bool;
}

type CheckFn = dyn Fn() -> BoxFuture<'static, bool> + Send + Sync;

/// Health check backed by a closure
pub struct FnHealthCheck {
    check: Box<CheckFn>,
}

#[async_trait]
impl HealthCheckable for FnHealthCheck {
    async fn health_check(&self) -> bool {
        (self.check)().await
    }
}

/// Wrap an async closure as a health check
pub fn health_check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheckable>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnHealthCheck {
        check: Box::new(move || f().boxed()),
    })
}

/// Health status of a component or the whole system
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Serving, but through degraded paths
    Degraded,
    /// Not serving
    Unhealthy,
}

impl HealthStatus {
    /// Combine multiple health statuses; the worst one wins
    pub fn combine(statuses: &[HealthStatus]) -> HealthStatus {
        if statuses.contains(&HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if statuses.contains(&HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Result of probing one component
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    /// Component name
    pub name: String,
    /// Whether the probe passed
    pub healthy: bool,
    /// Probe execution time in milliseconds
    pub duration_ms: u64,
    /// When the probe finished
    pub checked_at: DateTime<Utc>,
    /// Why the probe failed, if it did
    pub error: Option<String>,
}

/// Probe one component, bounded by `timeout`
pub async fn probe(
    name: &str,
    check: &Arc<dyn HealthCheckable>,
    timeout: Duration,
) -> HealthCheckResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        timeout,
        AssertUnwindSafe(check.health_check()).catch_unwind(),
    )
    .await;

    let (healthy, error) = match outcome {
        Ok(Ok(true)) => (true, None),
        Ok(Ok(false)) => (false, Some("health check reported unhealthy".to_string())),
        Ok(Err(_)) => {
            warn!("Health check for '{}' panicked", name);
            (false, Some("health check panicked".to_string()))
        }
        Err(_) => {
            warn!("Health check for '{}' timed out after {:?}", name, timeout);
            (false, Some(format!("health check timed out after {timeout:?}")))
        }
    };

    let duration = started.elapsed();
    debug!(
        component = name,
        healthy,
        duration_ms = duration.as_millis() as u64,
        "Health check completed"
    );

    HealthCheckResult {
        name: name.to_string(),
        healthy,
        duration_ms: duration.as_millis() as u64,
        checked_at: Utc::now(),
        error,
    }
}
