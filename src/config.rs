//! Configuration management for the resilience layer
//!
//! Settings are layered: built-in defaults, then an optional TOML, YAML or
//! JSON file, then environment variables prefixed with `RELIABILITY_` using
//! `__` between nested keys (`RELIABILITY_MANAGER__HEALTH_CHECK_INTERVAL=10s`).

use crate::error::{ReliabilityError, Result};
use crate::error_recovery::circuit_breaker::CircuitBreakerConfig;
use crate::error_recovery::retry_policy::RetryPolicy;
use crate::logging::LogConfig;
use crate::monitoring::alerts::AlertConfig;
use crate::monitoring::anomaly::AnomalyConfig;
use crate::rate_limiter::RateLimiterConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Manager loops, thresholds and alerting
    pub manager: ManagerConfig,

    /// Logging configuration
    pub logging: LogConfig,

    /// Policy for operations without their own
    pub default_retry_policy: RetryPolicy,

    /// Circuit breakers by component name
    pub circuit_breakers: BTreeMap<String, CircuitBreakerConfig>,

    /// Rate limiters by component name
    pub rate_limiters: BTreeMap<String, RateLimiterConfig>,

    /// Retry policies by operation name
    pub retry_policies: BTreeMap<String, RetryPolicy>,
}

/// Reliability manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Health loop period; the data-quality loop runs at twice this
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Anomaly loop period
    #[serde(with = "humantime_serde")]
    pub anomaly_check_interval: Duration,

    /// Upper bound for one component health check
    #[serde(with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// A component is fresh if it succeeded within this window
    #[serde(with = "humantime_serde")]
    pub freshness_window: Duration,

    /// Rate limiter keys idle this long are purged
    #[serde(with = "humantime_serde")]
    pub idle_key_ttl: Duration,

    /// Period snapshots kept
    pub max_snapshots: usize,

    /// Alert thresholds
    pub thresholds: Thresholds,

    /// Alert deduplication and history
    pub alerts: AlertConfig,

    /// Anomaly detection tuning
    pub anomaly: AnomalyConfig,

    /// Breaker config for components used without registration
    pub default_circuit_breaker: CircuitBreakerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            anomaly_check_interval: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(5),
            freshness_window: Duration::from_secs(300),
            idle_key_ttl: Duration::from_secs(3600),
            max_snapshots: 1000,
            thresholds: Thresholds::default(),
            alerts: AlertConfig::default(),
            anomaly: AnomalyConfig::default(),
            default_circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Alert thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Average latency per period above which an alert is raised
    pub max_latency_ms: f64,
    /// Failed share of requests per period above which an alert is raised
    pub max_error_rate: f64,
    /// Requests per second below which an alert is raised; 0 disables
    pub min_throughput: f64,
    pub min_completeness: f64,
    pub min_quality_score: f64,
    pub max_drift: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: 5000.0,
            max_error_rate: 0.1,
            min_throughput: 0.0,
            min_completeness: 0.95,
            min_quality_score: 0.8,
            max_drift: 0.5,
        }
    }
}

impl ManagerConfig {
    /// Validate manager settings
    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval.is_zero() || self.anomaly_check_interval.is_zero() {
            return Err(ReliabilityError::config("loop intervals must be non-zero"));
        }
        if self.health_check_timeout.is_zero() {
            return Err(ReliabilityError::config("health_check_timeout must be non-zero"));
        }
        let t = &self.thresholds;
        for (name, value) in [
            ("max_error_rate", t.max_error_rate),
            ("min_completeness", t.min_completeness),
            ("min_quality_score", t.min_quality_score),
            ("max_drift", t.max_drift),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ReliabilityError::config(format!(
                    "{name} must be within [0, 1]"
                )));
            }
        }
        if t.max_latency_ms <= 0.0 || t.min_throughput < 0.0 {
            return Err(ReliabilityError::config(
                "max_latency_ms must be positive and min_throughput non-negative",
            ));
        }
        self.default_circuit_breaker.validate()
    }
}

impl ReliabilityConfig {
    /// Load from an optional file with environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("RELIABILITY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ReliabilityConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ReliabilityError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;
        self.default_retry_policy.validate()?;

        for (name, cfg) in &self.circuit_breakers {
            cfg.validate()
                .map_err(|e| e.config_context(format_args!("circuit breaker '{name}'")))?;
        }
        for (name, cfg) in &self.rate_limiters {
            cfg.validate()
                .map_err(|e| e.config_context(format_args!("rate limiter '{name}'")))?;
        }
        for (name, policy) in &self.retry_policies {
            policy
                .validate()
                .map_err(|e| e.config_context(format_args!("retry policy '{name}'")))?;
        }
        Ok(())
    }
}
