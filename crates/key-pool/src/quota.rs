//! Failure classification for the hosted model API
//!
//! A 429 or a resource-exhaustion marker means rate limiting whatever else
//! the response says. Otherwise status codes take precedence; message markers
//! cover upstreams that return 400 with an `API_KEY_INVALID` status or
//! transports that fail without any HTTP response. Only rate limiting
//! triggers rotation.

use transport::{ErrorClassification, InvokeError};

/// Quota / traffic limiting markers (e.g. `RESOURCE_EXHAUSTED`).
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "resource_exhausted",
    "resource exhausted",
    "quota",
    "rate limit",
    "too many requests",
];

/// Missing model/resource or rejected key.
const INVALID_CREDENTIAL_PATTERNS: &[&str] = &[
    "not_found",
    "not found",
    "api_key_invalid",
    "api key not valid",
    "permission_denied",
];

/// Retryable on the same key.
const TRANSIENT_PATTERNS: &[&str] = &["unavailable", "deadline exceeded", "timed out"];

/// Classify an HTTP status alone. `None` means the status is not decisive.
pub fn classify_status(status: u16) -> Option<ErrorClassification> {
    match status {
        429 => Some(ErrorClassification::RateLimited),
        401 | 403 | 404 => Some(ErrorClassification::InvalidCredential),
        408 | 500 | 502 | 503 | 504 => Some(ErrorClassification::Transient),
        _ => None,
    }
}

/// Classify a failure message by its markers (case-insensitive).
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    let has_marker = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));
    if has_marker(RATE_LIMIT_PATTERNS) {
        ErrorClassification::RateLimited
    } else if has_marker(INVALID_CREDENTIAL_PATTERNS) {
        ErrorClassification::InvalidCredential
    } else if has_marker(TRANSIENT_PATTERNS) {
        ErrorClassification::Transient
    } else {
        ErrorClassification::Other
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classify a failed remote call.
pub fn classify(error: &InvokeError) -> ErrorClassification {
    if error.status == Some(429) || is_rate_limit_message(&error.message) {
        return ErrorClassification::RateLimited;
    }
    error
        .status
        .and_then(classify_status)
        .unwrap_or_else(|| classify_message(&error.message))
}
