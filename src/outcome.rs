//! Tagged call outcomes
//!
//! Every protected call resolves to exactly one [`Outcome`]: the real
//! result, a degraded stand-in, or a classified failure. Callers match on
//! it instead of unwinding through error hierarchies.

use crate::error::{FailureKind, ReliabilityError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Boxed fallback producing a substitute value
pub type Fallback<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Wrap an async closure as a [`Fallback`]
pub fn fallback<T, F, Fut>(f: F) -> Fallback<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// Run a fallback, turning a panic into an error
pub(crate) async fn run_fallback<T>(fallback: Fallback<T>) -> anyhow::Result<T> {
    let future = std::panic::catch_unwind(AssertUnwindSafe(fallback))
        .map_err(|_| anyhow::anyhow!("fallback panicked"))?;
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("fallback panicked")))
}

/// Why a degraded value was returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    /// Caller-supplied fallback produced the value
    Fallback,
    /// A cached response was served
    Cache,
    /// Nothing better was available; structured payload returned
    Unavailable,
}

/// Structured stand-in returned when no real or substitute value exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedResponse {
    pub status: String,
    pub message: String,
    pub fallback: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DegradedResponse {
    pub fn circuit_open(breaker: &str, error: Option<String>) -> Self {
        Self {
            status: "circuit_breaker_open".to_string(),
            message: format!("Service '{breaker}' is temporarily unavailable"),
            fallback: true,
            timestamp: Utc::now(),
            error,
        }
    }
}

/// Value carried by a degraded outcome
#[derive(Debug, Clone, PartialEq)]
pub enum DegradedValue<T> {
    /// Substitute of the caller's result type
    Value(T),
    /// Structured payload
    Payload(DegradedResponse),
}

/// Result of a protected call
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    Degraded(DegradedValue<T>, DegradeReason),
    Failure(FailureKind, ReliabilityError),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(..))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(..))
    }

    /// Failure kind, if this is a failure
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Failure(kind, _) => Some(*kind),
            _ => None,
        }
    }

    /// The real or substitute value, if one of the caller's type exists
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(v) | Outcome::Degraded(DegradedValue::Value(v), _) => Some(v),
            _ => None,
        }
    }

    /// Collapse into a plain result; a bare degraded payload becomes `Unavailable`
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(v) | Outcome::Degraded(DegradedValue::Value(v), _) => Ok(v),
            Outcome::Degraded(DegradedValue::Payload(payload), _) => {
                Err(ReliabilityError::Unavailable {
                    message: payload.message,
                })
            }
            Outcome::Failure(_, error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_payload_shape() {
        let payload = DegradedResponse::circuit_open("kraken", None);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "circuit_breaker_open");
        assert_eq!(json["fallback"], true);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_panicking_fallback_becomes_error() {
        let fb: Fallback<u32> = fallback(|| async {
            if true {
                panic!("broken fallback");
            }
            Ok(0)
        });
        assert!(run_fallback(fb).await.is_err());

        let fb: Fallback<u32> = fallback(|| async { Ok(5) });
        assert_eq!(run_fallback(fb).await.unwrap(), 5);
    }

    #[test]
    fn test_into_result() {
        let ok: Outcome<u32> = Outcome::Degraded(DegradedValue::Value(7), DegradeReason::Cache);
        assert_eq!(ok.into_result().unwrap(), 7);

        let payload: Outcome<u32> = Outcome::Degraded(
            DegradedValue::Payload(DegradedResponse::circuit_open("s3", Some("boom".into()))),
            DegradeReason::Unavailable,
        );
        assert!(matches!(
            payload.into_result(),
            Err(ReliabilityError::Unavailable { .. })
        ));
    }
}
