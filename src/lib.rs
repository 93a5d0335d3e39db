//! Resilience layer for data collectors
//!
//! This crate protects calls to external data sources with rate limiting,
//! circuit breaking and classified retries, and monitors the protected
//! components from background loops.
//!
//! # Features
//!
//! - Four rate limiting algorithms (token bucket, leaky bucket, sliding and fixed window)
//! - Circuit breakers with fallbacks, response caching and state listeners
//! - Retry engine with exponential, linear and fixed backoff and jitter
//! - Error classification into a small set of failure kinds
//! - Reliability manager with health, anomaly and data-quality loops and deduplicated alerts
//!
//! # Example
//!
//! ```no_run
//! use collector_resilience::{ExecuteOptions, ManagerConfig, ReliabilityManager};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let manager = ReliabilityManager::new(ManagerConfig::default());
//! let outcome = manager
//!     .execute("binance", "fetch_ticker", || async { Ok(42u64) }, ExecuteOptions::new())
//!     .await;
//! let price = outcome.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod health;
pub mod logging;
pub mod manager;
pub mod monitoring;
pub mod outcome;
pub mod rate_limiter;

// Re-export main types for convenience
pub use config::{ManagerConfig, ReliabilityConfig, Thresholds};
pub use error::{FailureKind, ReliabilityError, Result};
pub use error_recovery::{
    BackoffStrategy, CallOptions, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ErrorClassifier, RetryBuilder, RetryEngine, RetryPolicy,
};
pub use health::{health_check_fn, HealthCheckable, HealthStatus};
pub use manager::{default_manager, ComprehensiveStatus, ExecuteOptions, ReliabilityManager};
pub use monitoring::{AlertLevel, AlertNotification, AnomalyAlert};
pub use outcome::{fallback, DegradeReason, DegradedResponse, DegradedValue, Outcome};
pub use rate_limiter::{Admission, RateLimitAlgorithm, RateLimiter, RateLimiterConfig};
