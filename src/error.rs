//! Error types for the resilience layer
//!
//! This module provides the single outward classification tag
//! ([`FailureKind`]), the crate error type and production-safe logging of
//! failures with severity levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for resilience operations
pub type Result<T> = std::result::Result<T, ReliabilityError>;

/// Classification tag for a failure, driving retry and trip decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection or socket-level failure
    Connection,
    /// Operation exceeded a deadline
    Timeout,
    /// Remote side throttled the request
    RateLimit,
    /// Remote side failed (5xx and similar)
    Server,
    /// Credentials rejected or missing
    Auth,
    /// Request or payload was rejected as invalid
    Validation,
    /// Nothing more specific could be determined
    Unknown,
}

impl FailureKind {
    /// Whether a failure of this kind is worth retrying when no policy says otherwise
    pub fn is_retryable_by_default(&self) -> bool {
        !matches!(self, FailureKind::Auth | FailureKind::Validation)
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Server => "server",
            FailureKind::Auth => "auth",
            FailureKind::Validation => "validation",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types surfaced by the resilience layer
#[derive(Error, Debug)]
pub enum ReliabilityError {
    /// An error that already carries its classification
    #[error("{kind} error: {message}")]
    Tagged { kind: FailureKind, message: String },

    /// Retry engine gave up
    #[error("Retry exhausted after {attempts} attempt(s) ({kind}): {source}")]
    RetryExhausted {
        kind: FailureKind,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Rate limiter rejected the call
    #[error("Rate limit exceeded for '{key}'")]
    RateLimited {
        key: String,
        retry_after: Option<Duration>,
    },

    /// No result and no degraded value could be produced
    #[error("Service unavailable: {message}")]
    Unavailable { message: String },

    /// Unknown component or operation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error returned by a wrapped operation
    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Low severity - information only
    Info,
    /// Medium severity - warning condition
    Warning,
    /// High severity - error condition
    Error,
    /// Critical severity - immediate attention required
    Critical,
}

impl ReliabilityError {
    /// Create a tagged error of the given kind
    pub fn tagged<S: Into<String>>(kind: FailureKind, msg: S) -> Self {
        Self::Tagged {
            kind,
            message: msg.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::tagged(FailureKind::Connection, msg)
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::tagged(FailureKind::Timeout, msg)
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(msg: S) -> Self {
        Self::tagged(FailureKind::RateLimit, msg)
    }

    /// Create a server error
    pub fn server<S: Into<String>>(msg: S) -> Self {
        Self::tagged(FailureKind::Server, msg)
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::tagged(FailureKind::Auth, msg)
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::tagged(FailureKind::Validation, msg)
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Prefix a configuration error with the entry it belongs to
    pub fn config_context(self, context: impl fmt::Display) -> Self {
        match self {
            Self::Config(msg) => Self::Config(format!("{context}: {msg}")),
            other => other,
        }
    }

    /// Classification carried by this error itself, if any
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Tagged { kind, .. } | Self::RetryExhausted { kind, .. } => Some(*kind),
            Self::RateLimited { .. } => Some(FailureKind::RateLimit),
            Self::Unavailable { .. } => Some(FailureKind::Server),
            Self::Config(_) => Some(FailureKind::Validation),
            Self::NotFound(_) | Self::Operation(_) => None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetryExhausted { .. } => false,
            other => other
                .failure_kind()
                .map(|kind| kind.is_retryable_by_default())
                .unwrap_or(false),
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Tagged { kind, .. } | Self::RetryExhausted { kind, .. } => match kind {
                FailureKind::Auth => ErrorSeverity::Critical,
                FailureKind::Validation => ErrorSeverity::Warning,
                FailureKind::Connection | FailureKind::Timeout => ErrorSeverity::Warning,
                _ => ErrorSeverity::Error,
            },
            Self::RateLimited { .. } => ErrorSeverity::Info,
            Self::Unavailable { .. } => ErrorSeverity::Warning,
            Self::Config(_) => ErrorSeverity::Critical,
            Self::NotFound(_) | Self::Operation(_) => ErrorSeverity::Error,
        }
    }
}

/// Error logging utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log an error at a level matching its severity
    pub fn log_error(error: &ReliabilityError, component: &str, operation: &str) {
        let kind = error.failure_kind().map(|k| k.as_str()).unwrap_or("unclassified");
        match error.severity() {
            ErrorSeverity::Critical | ErrorSeverity::Error => {
                tracing::error!(component, operation, kind, "{error}");
            }
            ErrorSeverity::Warning => tracing::warn!(component, operation, kind, "{error}"),
            ErrorSeverity::Info => tracing::info!(component, operation, kind, "{error}"),
        }
    }
}
