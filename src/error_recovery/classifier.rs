//! Failure classification
//!
//! Maps any error returned by a wrapped operation to a [`FailureKind`].
//! Resolution order: errors that already carry a tag, then registered and
//! well-known concrete error types anywhere in the source chain, then an
//! ordered, case-insensitive text rule table, then `Unknown`.

use crate::error::{FailureKind, ReliabilityError};
use once_cell::sync::Lazy;
use std::error::Error as StdError;
use std::io;
use std::sync::RwLock;
use tracing::debug;

type TypeMatcher = fn(&(dyn StdError + 'static)) -> bool;

struct TypeMapping {
    type_name: &'static str,
    kind: FailureKind,
    matches: TypeMatcher,
}

struct TextRule {
    kind: FailureKind,
    needles: &'static [&'static str],
    status_codes: &'static [(u16, u16)],
}

const TEXT_RULES: &[TextRule] = &[
    TextRule {
        kind: FailureKind::RateLimit,
        needles: &["rate limit", "ratelimit", "too many requests", "throttl"],
        status_codes: &[(429, 429)],
    },
    TextRule {
        kind: FailureKind::Server,
        needles: &[
            "server error",
            "internal error",
            "service unavailable",
            "bad gateway",
            "overloaded",
        ],
        status_codes: &[(500, 599)],
    },
    TextRule {
        kind: FailureKind::Auth,
        needles: &[
            "unauthorized",
            "unauthorised",
            "forbidden",
            "authentication",
            "permission denied",
            "invalid api key",
            "invalid token",
            "invalid credentials",
        ],
        status_codes: &[(401, 401), (403, 403)],
    },
    TextRule {
        kind: FailureKind::Validation,
        needles: &[
            "invalid",
            "validation",
            "malformed",
            "bad request",
            "unprocessable",
        ],
        status_codes: &[(400, 400), (422, 422)],
    },
    TextRule {
        kind: FailureKind::Timeout,
        needles: &["timed out", "timeout", "deadline exceeded"],
        status_codes: &[(408, 408), (504, 504)],
    },
    TextRule {
        kind: FailureKind::Connection,
        needles: &[
            "connection refused",
            "connection reset",
            "connection closed",
            "connection aborted",
            "connection lost",
            "failed to connect",
            "could not connect",
            "unreachable",
            "broken pipe",
            "dns error",
            "name resolution",
        ],
        status_codes: &[],
    },
];

/// Words a status code must directly follow to count
const STATUS_PREFIXES: &[&str] = &["http", "status", "code"];

static GLOBAL: Lazy<ErrorClassifier> = Lazy::new(ErrorClassifier::new);

/// Classify with the process-wide classifier
pub fn classify(error: &anyhow::Error) -> FailureKind {
    GLOBAL.classify(error)
}

/// Error classifier with an extensible concrete-type table
pub struct ErrorClassifier {
    mappings: RwLock<Vec<TypeMapping>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Create a classifier with only the built-in rules
    pub fn new() -> Self {
        Self {
            mappings: RwLock::new(Vec::new()),
        }
    }

    /// Process-wide classifier used by [`classify`]
    pub fn global() -> &'static ErrorClassifier {
        &GLOBAL
    }

    /// Map a concrete error type to a kind. Later registrations for the
    /// same type replace earlier ones.
    pub fn register_mapping<E>(&self, kind: FailureKind)
    where
        E: StdError + 'static,
    {
        let type_name = std::any::type_name::<E>();
        let mut mappings = self.mappings.write().unwrap_or_else(|e| e.into_inner());
        mappings.retain(|m| m.type_name != type_name);
        mappings.push(TypeMapping {
            type_name,
            kind,
            matches: is_type::<E>,
        });
        debug!("Registered failure mapping {} -> {}", type_name, kind);
    }

    /// Classify an operation error
    pub fn classify(&self, error: &anyhow::Error) -> FailureKind {
        for cause in error.chain() {
            if let Some(kind) = self.classify_cause(cause) {
                return kind;
            }
        }
        classify_text(&format!("{error:#}"))
    }

    /// Classify a crate error
    pub fn classify_error(&self, error: &ReliabilityError) -> FailureKind {
        if let Some(kind) = self.classify_cause(error) {
            return kind;
        }
        classify_text(&error.to_string())
    }

    fn classify_cause(&self, cause: &(dyn StdError + 'static)) -> Option<FailureKind> {
        if let Some(tagged) = cause.downcast_ref::<ReliabilityError>() {
            if let Some(kind) = tagged.failure_kind() {
                return Some(kind);
            }
            // Transparent wrapper hides the inner root error from the chain.
            if let ReliabilityError::Operation(inner) = tagged {
                return inner.chain().find_map(|c| self.classify_cause(c));
            }
        }

        {
            let mappings = self.mappings.read().unwrap_or_else(|e| e.into_inner());
            if let Some(mapping) = mappings.iter().rev().find(|m| (m.matches)(cause)) {
                return Some(mapping.kind);
            }
        }

        if cause.is::<tokio::time::error::Elapsed>() {
            return Some(FailureKind::Timeout);
        }

        cause
            .downcast_ref::<io::Error>()
            .and_then(|e| classify_io_kind(e.kind()))
    }
}

fn is_type<E: StdError + 'static>(error: &(dyn StdError + 'static)) -> bool {
    error.is::<E>()
}

fn classify_io_kind(kind: io::ErrorKind) -> Option<FailureKind> {
    use io::ErrorKind::*;
    match kind {
        TimedOut => Some(FailureKind::Timeout),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | AddrInUse
        | AddrNotAvailable | BrokenPipe | UnexpectedEof => Some(FailureKind::Connection),
        PermissionDenied => Some(FailureKind::Auth),
        InvalidInput | InvalidData => Some(FailureKind::Validation),
        _ => None,
    }
}

fn classify_text(text: &str) -> FailureKind {
    let lowered = text.to_lowercase();
    let codes = status_codes(&lowered);

    TEXT_RULES
        .iter()
        .find(|rule| {
            rule.needles.iter().any(|n| lowered.contains(n))
                || codes.iter().any(|code| {
                    rule.status_codes
                        .iter()
                        .any(|(lo, hi)| (*lo..=*hi).contains(code))
                })
        })
        .map(|rule| rule.kind)
        .unwrap_or(FailureKind::Unknown)
}

/// Three-digit HTTP status codes following "http", "status" or "code"
fn status_codes(text: &str) -> Vec<u16> {
    let mut codes = Vec::new();
    for prefix in STATUS_PREFIXES {
        for (idx, _) in text.match_indices(prefix) {
            let rest = text[idx + prefix.len()..].trim_start_matches('s');
            let rest = match rest.strip_prefix('/') {
                // http/1.1
                Some(version) => {
                    version.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.')
                }
                None => rest,
            };
            let rest = rest.trim_start_matches(|c: char| matches!(c, ' ' | ':' | '=' | '#' | '-'));
            let end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if end != 3 {
                continue;
            }
            if let Ok(code) = rest[..end].parse::<u16>() {
                if (100..=599).contains(&code) && !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Debug)]
    struct ExchangeMaintenance;

    impl std::fmt::Display for ExchangeMaintenance {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "exchange in maintenance")
        }
    }

    impl StdError for ExchangeMaintenance {}

    #[rstest]
    #[case("Rate limit hit for /api/v3/klines", FailureKind::RateLimit)]
    #[case("HTTP 429 from upstream", FailureKind::RateLimit)]
    #[case("request timed out after 10s", FailureKind::Timeout)]
    #[case("Connection reset while reading body", FailureKind::Connection)]
    #[case("upstream returned HTTP 503", FailureKind::Server)]
    #[case("Internal Server Error", FailureKind::Server)]
    #[case("401 Unauthorized", FailureKind::Auth)]
    #[case("Invalid API key", FailureKind::Auth)]
    #[case("invalid symbol BTC-FOO", FailureKind::Validation)]
    #[case("something odd happened", FailureKind::Unknown)]
    #[case("upstream returned 503", FailureKind::Unknown)]
    fn test_text_rules(#[case] message: &str, #[case] expected: FailureKind) {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify(&anyhow::anyhow!(message.to_string())), expected);
    }

    #[rstest]
    #[case("401 Unauthorized: invalid API key for websocket connection", FailureKind::Auth)]
    #[case("Unauthorized connection attempt", FailureKind::Auth)]
    #[case("Validation failed: invalid connector id", FailureKind::Validation)]
    #[case("invalid order quantity 500", FailureKind::Validation)]
    #[case("network config invalid", FailureKind::Validation)]
    #[case("HTTP/1.1 503 Service Unavailable: connection pool exhausted", FailureKind::Server)]
    #[case("status: 502 while validating order", FailureKind::Server)]
    #[case("too many requests, status=503", FailureKind::RateLimit)]
    #[case("connection timed out", FailureKind::Timeout)]
    #[case("connection reset by peer", FailureKind::Connection)]
    fn test_mixed_keywords(#[case] message: &str, #[case] expected: FailureKind) {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify(&anyhow::anyhow!(message.to_string())), expected);
    }

    #[test]
    fn test_tagged_error_wins_over_text() {
        let classifier = ErrorClassifier::new();
        let err = anyhow::Error::from(ReliabilityError::validation("connection field missing"));
        assert_eq!(classifier.classify(&err), FailureKind::Validation);
    }

    #[test]
    fn test_io_errors() {
        let classifier = ErrorClassifier::new();
        let refused = anyhow::Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "x"));
        let timed_out = anyhow::Error::from(io::Error::new(io::ErrorKind::TimedOut, "x"));
        assert_eq!(classifier.classify(&refused), FailureKind::Connection);
        assert_eq!(classifier.classify(&timed_out), FailureKind::Timeout);
    }

    #[test]
    fn test_context_wrapped_io_error() {
        let classifier = ErrorClassifier::new();
        let err = anyhow::Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "x"))
            .context("fetching order book");
        assert_eq!(classifier.classify(&err), FailureKind::Connection);
    }

    #[test]
    fn test_registered_mapping() {
        let classifier = ErrorClassifier::new();
        let err = anyhow::Error::from(ExchangeMaintenance);
        assert_eq!(classifier.classify(&err), FailureKind::Unknown);

        classifier.register_mapping::<ExchangeMaintenance>(FailureKind::Server);
        assert_eq!(classifier.classify(&err), FailureKind::Server);

        classifier.register_mapping::<ExchangeMaintenance>(FailureKind::RateLimit);
        assert_eq!(classifier.classify(&err), FailureKind::RateLimit);
    }

    #[test]
    fn test_operation_wrapper_is_unwrapped() {
        let classifier = ErrorClassifier::new();
        classifier.register_mapping::<ExchangeMaintenance>(FailureKind::Server);
        let inner = anyhow::Error::from(ExchangeMaintenance);
        let wrapped = anyhow::Error::from(ReliabilityError::Operation(inner));
        assert_eq!(classifier.classify(&wrapped), FailureKind::Server);
    }

    #[test]
    fn test_status_code_extraction() {
        assert_eq!(status_codes("code=502; retry in 1500ms"), vec![502]);
        assert_eq!(status_codes("http/1.1 429 too many"), vec![429]);
        assert_eq!(status_codes("https 404 / status code 410"), vec![404, 410]);
        assert!(status_codes("order 12345").is_empty());
        assert!(status_codes("quantity 500 exceeds lot size").is_empty());
    }
}
