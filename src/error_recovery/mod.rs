//! Error recovery patterns for outbound calls
//!
//! This module provides failure classification, retry with backoff and
//! circuit breakers, plus the bounded attempt history they share.

pub mod circuit_breaker;
pub mod classifier;
pub mod history;
pub mod retry_policy;

// Re-export commonly used types
pub use circuit_breaker::{
    CallOptions, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent,
    CircuitBreakerEventType, CircuitBreakerListener, CircuitBreakerStats, CircuitState,
};
pub use classifier::{classify, ErrorClassifier};
pub use history::{AttemptHistory, AttemptRecord};
pub use retry_policy::{BackoffStrategy, RetryBuilder, RetryEngine, RetryPolicy, RetryStats};
