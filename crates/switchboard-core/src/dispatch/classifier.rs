//! Error classifier.
//!
//! Maps a [`ProviderError`] to an [`ErrorCategory`] plus a fallback verdict.
//! Status codes take precedence over message text. Unrecognised errors are
//! not fallback-eligible: an error nobody has seen before is surfaced rather
//! than masked by a fallback that is unlikely to help.

use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use regex::Regex;

use switchboard_types::error::{Classification, ErrorCategory, ProviderError};

/// Messages that mean the caller's request is at fault. Checked first.
const DO_NOT_FALLBACK: &[(&str, ErrorCategory)] = &[
    ("invalid api key", ErrorCategory::AuthError),
    ("invalid_api_key", ErrorCategory::AuthError),
    ("incorrect api key", ErrorCategory::AuthError),
    ("api key not valid", ErrorCategory::AuthError),
    ("unauthorized", ErrorCategory::AuthError),
    ("permission denied", ErrorCategory::AuthError),
    ("content policy", ErrorCategory::BadRequest),
    ("content_policy", ErrorCategory::BadRequest),
    ("safety", ErrorCategory::BadRequest),
    ("invalid request", ErrorCategory::BadRequest),
    ("invalid_request", ErrorCategory::BadRequest),
    ("invalid_argument", ErrorCategory::BadRequest),
];

/// Messages that describe a transient provider-side condition.
const RETRY_FALLBACK: &[(&str, ErrorCategory)] = &[
    ("rate limit", ErrorCategory::RateLimit),
    ("rate_limit", ErrorCategory::RateLimit),
    ("too many requests", ErrorCategory::RateLimit),
    ("quota", ErrorCategory::RateLimit),
    ("resource_exhausted", ErrorCategory::RateLimit),
    ("timeout", ErrorCategory::Timeout),
    ("timed out", ErrorCategory::Timeout),
    ("econnreset", ErrorCategory::NetworkError),
    ("connection reset", ErrorCategory::NetworkError),
    ("econnrefused", ErrorCategory::NetworkError),
    ("connection refused", ErrorCategory::NetworkError),
    ("socket hang up", ErrorCategory::NetworkError),
    ("service unavailable", ErrorCategory::ServerError),
    ("unavailable", ErrorCategory::ServerError),
    ("overloaded", ErrorCategory::ServerError),
    ("bad gateway", ErrorCategory::ServerError),
    ("502", ErrorCategory::ServerError),
    ("503", ErrorCategory::ServerError),
];

/// Messages produced by an abort rather than by the provider.
const ABORT_LIKE: &[&str] = &["aborted", "cancelled", "canceled"];

/// Classify a provider failure.
pub fn classify(error: &ProviderError) -> Classification {
    match error {
        ProviderError::Cancelled => abort(),
        ProviderError::Network(_) => Classification::eligible(ErrorCategory::NetworkError),
        ProviderError::Timeout(_) => Classification::eligible(ErrorCategory::Timeout),
        ProviderError::Http {
            status, message, ..
        } => classify_status(*status).unwrap_or_else(|| classify_message(message)),
        ProviderError::Other(message) => classify_message(message),
    }
}

/// Status-code precedence rules. `None` means the status is not decisive.
fn classify_status(status: u16) -> Option<Classification> {
    match status {
        400 => Some(Classification::terminal(ErrorCategory::BadRequest)),
        401 | 403 => Some(Classification::terminal(ErrorCategory::AuthError)),
        429 => Some(Classification::eligible(ErrorCategory::RateLimit)),
        s if s >= 500 => Some(Classification::eligible(ErrorCategory::ServerError)),
        _ => None,
    }
}

/// Classify by case-insensitive substring match on the message alone.
pub fn classify_message(message: &str) -> Classification {
    let lower = message.to_lowercase();

    if ABORT_LIKE.iter().any(|p| lower.contains(p)) {
        return abort();
    }
    if let Some((_, category)) = DO_NOT_FALLBACK.iter().find(|(p, _)| lower.contains(p)) {
        return Classification::terminal(*category);
    }
    if let Some((_, category)) = RETRY_FALLBACK.iter().find(|(p, _)| lower.contains(p)) {
        return Classification::eligible(*category);
    }
    Classification::terminal(ErrorCategory::Unknown)
}

fn abort() -> Classification {
    Classification {
        category: ErrorCategory::Unknown,
        fallback_eligible: false,
        abort_like: true,
    }
}

/// Whether a classified failure is evidence the provider is unhealthy.
///
/// Caller-side failures (bad request, auth) and aborts never count.
pub fn counts_against_breaker(classification: &Classification) -> bool {
    if classification.abort_like {
        return false;
    }
    matches!(
        classification.category,
        ErrorCategory::RateLimit
            | ErrorCategory::ServerError
            | ErrorCategory::NetworkError
            | ErrorCategory::Timeout
    ) || classification.fallback_eligible
}

static RETRY_AFTER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)retry[- _]after[:\s]+(\d+(?:\.\d+)?)\s*(ms|milliseconds|s|secs?|seconds?)?\b",
        r"(?i)\bwait\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds|s|secs?|seconds?)\b",
        r"(?i)try again in\s+(\d+(?:\.\d+)?)\s*(ms|milliseconds|s|secs?|seconds?)?\b",
        r#"(?i)"retryDelay"\s*:\s*"(\d+(?:\.\d+)?)(s)""#,
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Longest cooldown taken from a provider hint. Larger values are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Seconds to a `Duration`, clamped to [`MAX_RETRY_AFTER`]. Negative, NaN
/// and unrepresentable values are not a hint.
fn hint_from_secs(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs)
        .ok()
        .map(|d| d.min(MAX_RETRY_AFTER))
}

/// Extract a suggested cooldown from a failure.
///
/// Checks the `Retry-After` header first (delta-seconds or HTTP-date), then
/// common phrasings in the message body.
pub fn parse_retry_after(error: &ProviderError) -> Option<Duration> {
    if let Some(header) = error.retry_after_header()
        && let Some(d) = parse_retry_after_header(header)
    {
        return Some(d);
    }
    parse_retry_after_message(error.message())
}

/// Parse a `Retry-After` header value.
pub fn parse_retry_after_header(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return hint_from_secs(secs);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    let wait = at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
    Some(wait.min(MAX_RETRY_AFTER))
}

fn parse_retry_after_message(message: &str) -> Option<Duration> {
    RETRY_AFTER_PATTERNS.iter().find_map(|re| {
        let caps = re.captures(message)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let millis = caps
            .get(2)
            .map(|u| u.as_str().to_lowercase())
            .is_some_and(|u| u == "ms" || u == "milliseconds");
        hint_from_secs(if millis { value / 1000.0 } else { value })
    })
}
