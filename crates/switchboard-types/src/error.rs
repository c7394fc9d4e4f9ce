//! Error taxonomy for provider dispatch.
//!
//! Adapters report failures as [`ProviderError`]; the classifier maps those to
//! an [`ErrorCategory`]; the chain surfaces a single aggregated [`ChainError`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchAttempt;

/// Retry hint attached to a queue-timeout rejection.
pub const QUEUE_TIMEOUT_RETRY_HINT: Duration = Duration::from_secs(1);

/// Classification bucket for a single provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    AuthError,
    BadRequest,
    ServerError,
    Timeout,
    NetworkError,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Verdict produced by the error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    /// The same request may succeed against a different provider.
    pub fallback_eligible: bool,
    /// The failure was a cancellation, not a provider fault.
    pub abort_like: bool,
}

impl Classification {
    pub fn eligible(category: ErrorCategory) -> Self {
        Self {
            category,
            fallback_eligible: true,
            abort_like: false,
        }
    }

    pub fn terminal(category: ErrorCategory) -> Self {
        Self {
            category,
            fallback_eligible: false,
            abort_like: false,
        }
    }
}

/// Failure returned by a provider adapter.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        /// Raw `Retry-After` header value, if the response carried one.
        retry_after: Option<String>,
    },

    /// Connection-level failure before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The adapter gave up waiting on the provider.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The adapter observed the cancellation signal.
    #[error("request cancelled")]
    Cancelled,

    /// Anything else; classified by message content.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ProviderError::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attach a raw `Retry-After` header value to an HTTP error.
    ///
    /// No-op for non-HTTP variants.
    pub fn with_retry_after(self, value: impl Into<String>) -> Self {
        match self {
            ProviderError::Http {
                status, message, ..
            } => ProviderError::Http {
                status,
                message,
                retry_after: Some(value.into()),
            },
            other => other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after_header(&self) -> Option<&str> {
        match self {
            ProviderError::Http { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }

    /// The human message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            ProviderError::Http { message, .. } => message,
            ProviderError::Network(m) | ProviderError::Timeout(m) | ProviderError::Other(m) => m,
            ProviderError::Cancelled => "request cancelled",
        }
    }
}

/// Rejection from the per-provider admission controller.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("admission queue for '{provider}' is full")]
    QueueFull { provider: String, retry_after: Duration },

    #[error("gave up after {waited:?} in the admission queue for '{provider}'")]
    QueueTimeout { provider: String, waited: Duration },

    #[error("admission wait for '{provider}' was cancelled")]
    Cancelled { provider: String },
}

impl AdmissionError {
    pub fn provider(&self) -> &str {
        match self {
            AdmissionError::QueueFull { provider, .. }
            | AdmissionError::QueueTimeout { provider, .. }
            | AdmissionError::Cancelled { provider } => provider,
        }
    }

    /// Suggested delay before the caller tries again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionError::QueueFull { retry_after, .. } => Some(*retry_after),
            AdmissionError::QueueTimeout { .. } => Some(QUEUE_TIMEOUT_RETRY_HINT),
            AdmissionError::Cancelled { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, AdmissionError::Cancelled { .. })
    }

    pub fn code(&self) -> ChainErrorCode {
        match self {
            AdmissionError::QueueFull { .. } => ChainErrorCode::QueueFull,
            AdmissionError::QueueTimeout { .. } => ChainErrorCode::QueueTimeout,
            AdmissionError::Cancelled { .. } => ChainErrorCode::Cancelled,
        }
    }
}

/// Errors from a circuit-breaker state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("breaker store unavailable: {0}")]
    Unavailable(String),

    #[error("breaker state serialization error: {0}")]
    Serialization(String),
}

/// Code carried by the error that crosses the dispatcher boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorCode {
    BadRequest,
    AuthError,
    RateLimit,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
    DeadlineExceeded,
    Cancelled,
    ServiceUnavailable,
    QueueFull,
    QueueTimeout,
}

impl ChainErrorCode {
    /// Whether the caller may reasonably retry the whole dispatch later.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ChainErrorCode::BadRequest
                | ChainErrorCode::AuthError
                | ChainErrorCode::Unknown
                | ChainErrorCode::Cancelled
        )
    }
}

impl From<ErrorCategory> for ChainErrorCode {
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::RateLimit => ChainErrorCode::RateLimit,
            ErrorCategory::AuthError => ChainErrorCode::AuthError,
            ErrorCategory::BadRequest => ChainErrorCode::BadRequest,
            ErrorCategory::ServerError => ChainErrorCode::ServerError,
            ErrorCategory::Timeout => ChainErrorCode::Timeout,
            ErrorCategory::NetworkError => ChainErrorCode::NetworkError,
            ErrorCategory::Unknown => ChainErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ChainErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainErrorCode::BadRequest => "bad_request",
            ChainErrorCode::AuthError => "auth_error",
            ChainErrorCode::RateLimit => "rate_limit",
            ChainErrorCode::ServerError => "server_error",
            ChainErrorCode::NetworkError => "network_error",
            ChainErrorCode::Timeout => "timeout",
            ChainErrorCode::Unknown => "unknown",
            ChainErrorCode::DeadlineExceeded => "deadline_exceeded",
            ChainErrorCode::Cancelled => "cancelled",
            ChainErrorCode::ServiceUnavailable => "service_unavailable",
            ChainErrorCode::QueueFull => "queue_full",
            ChainErrorCode::QueueTimeout => "queue_timeout",
        };
        f.write_str(s)
    }
}

/// Aggregated failure of one dispatch call.
///
/// Carries every provider attempt in the order it was made so the failure can
/// be debugged without correlating logs.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ChainError {
    pub code: ChainErrorCode,
    pub message: String,
    pub attempts: Vec<DispatchAttempt>,
    pub elapsed: Duration,
    pub retry_after: Option<Duration>,
}

impl ChainError {
    pub fn new(code: ChainErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attempts: Vec::new(),
            elapsed: Duration::ZERO,
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Provider names in the order they were tried.
    pub fn attempted_providers(&self) -> Vec<&str> {
        self.attempts.iter().map(|a| a.provider.as_str()).collect()
    }

    /// Multi-line summary of every attempt, for CLI and log output.
    pub fn attempt_summary(&self) -> String {
        self.attempts
            .iter()
            .enumerate()
            .map(|(i, a)| format!("{}. {}", i + 1, a))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::http(429, "slow down");
        assert_eq!(err.to_string(), "HTTP 429: slow down");
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.message(), "slow down");
    }

    #[test]
    fn test_with_retry_after_only_applies_to_http() {
        let err = ProviderError::http(429, "slow down").with_retry_after("2");
        assert_eq!(err.retry_after_header(), Some("2"));

        let err = ProviderError::Network("reset".into()).with_retry_after("2");
        assert!(err.retry_after_header().is_none());
    }

    #[test]
    fn test_admission_error_hints() {
        let full = AdmissionError::QueueFull {
            provider: "openai".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(full.retry_after(), Some(Duration::from_secs(3)));
        assert!(full.is_retryable());
        assert_eq!(full.code(), ChainErrorCode::QueueFull);

        let timeout = AdmissionError::QueueTimeout {
            provider: "openai".into(),
            waited: Duration::from_millis(500),
        };
        assert_eq!(timeout.retry_after(), Some(QUEUE_TIMEOUT_RETRY_HINT));
        assert_eq!(timeout.code(), ChainErrorCode::QueueTimeout);

        let cancelled = AdmissionError::Cancelled {
            provider: "openai".into(),
        };
        assert!(!cancelled.is_retryable());
        assert_eq!(cancelled.provider(), "openai");
    }

    #[test]
    fn test_chain_error_code_retryability() {
        assert!(!ChainErrorCode::BadRequest.is_retryable());
        assert!(!ChainErrorCode::AuthError.is_retryable());
        assert!(!ChainErrorCode::Cancelled.is_retryable());
        assert!(!ChainErrorCode::Unknown.is_retryable());
        assert!(ChainErrorCode::DeadlineExceeded.is_retryable());
        assert!(ChainErrorCode::ServiceUnavailable.is_retryable());
        assert!(ChainErrorCode::QueueFull.is_retryable());
        assert!(ChainErrorCode::RateLimit.is_retryable());
    }

    #[test]
    fn test_chain_error_code_serde_matches_display() {
        for code in [
            ChainErrorCode::DeadlineExceeded,
            ChainErrorCode::ServiceUnavailable,
            ChainErrorCode::QueueTimeout,
            ChainErrorCode::AuthError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{code}\""));
        }
    }

    #[test]
    fn test_chain_error_display_and_providers() {
        let mut err = ChainError::new(ChainErrorCode::ServiceUnavailable, "all providers exhausted");
        err.attempts.push(DispatchAttempt::failed(
            "a",
            "HTTP 503: down",
            Some(ErrorCategory::ServerError),
            true,
        ));
        err.attempts.push(DispatchAttempt::circuit_open("b", None));

        assert_eq!(
            err.to_string(),
            "service_unavailable: all providers exhausted"
        );
        assert_eq!(err.attempted_providers(), vec!["a", "b"]);
        let summary = err.attempt_summary();
        assert!(summary.contains("1. a"));
        assert!(summary.contains("2. b"));
        assert!(summary.contains("circuit open"));
    }
}
