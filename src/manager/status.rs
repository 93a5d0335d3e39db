//! Status reports returned by the reliability manager

use crate::error_recovery::circuit_breaker::{CircuitBreakerStats, CircuitState};
use crate::error_recovery::retry_policy::RetryStats;
use crate::health::{HealthCheckResult, HealthStatus};
use crate::monitoring::alerts::AnomalyAlert;
use crate::monitoring::metrics::{ComponentMetrics, SystemMetrics};
use crate::monitoring::quality::DataQualityMetrics;
use crate::rate_limiter::RateLimiterStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub health: HealthStatus,
    pub last_health_check: Option<HealthCheckResult>,
    pub circuit_breaker: Option<CircuitBreakerStats>,
    pub rate_limiter: Option<RateLimiterStats>,
    pub metrics: ComponentMetrics,
}

impl ComponentStatus {
    /// Derive health from the breaker state and the last probe
    pub(crate) fn derive_health(
        breaker: Option<&CircuitBreakerStats>,
        probe: Option<&HealthCheckResult>,
    ) -> HealthStatus {
        let from_breaker = match breaker.map(|b| b.state) {
            Some(CircuitState::Open) => HealthStatus::Unhealthy,
            Some(CircuitState::HalfOpen) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };
        let from_probe = match probe {
            Some(result) if !result.healthy => HealthStatus::Unhealthy,
            _ => HealthStatus::Healthy,
        };
        HealthStatus::combine(&[from_breaker, from_probe])
    }
}

/// Everything the manager knows, as plain data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveStatus {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub running: bool,
    pub overall_health: HealthStatus,
    pub components: BTreeMap<String, ComponentStatus>,
    pub system_metrics: SystemMetrics,
    pub data_quality: DataQualityMetrics,
    pub retry: RetryStats,
    pub active_alerts: Vec<AnomalyAlert>,
    pub recent_alerts: Vec<AnomalyAlert>,
}

/// Answer to [`get_status`](super::ReliabilityManager::get_status)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusReport {
    Component(Box<ComponentStatus>),
    All(BTreeMap<String, ComponentStatus>),
}
