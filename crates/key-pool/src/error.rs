//! Error types for pool and dispatch operations

use transport::InvokeError;

/// Errors from pool construction and key administration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no API keys configured")]
    NoCredentials,

    #[error("API key must not be blank")]
    BlankCredential,

    #[error("key index {index} out of range (pool has {len} keys)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cannot remove the last API key")]
    LastCredential,

    #[error("key index {index} has a call in flight")]
    CredentialInUse { index: usize },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Final failure of one dispatch, surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("all API keys are exhausted{}", detail(.last_error))]
    AllCredentialsExhausted { last_error: Option<String> },

    #[error("API key rejected or model not found: {message}")]
    InvalidCredential { message: String },

    #[error("gave up after {attempts} attempts{}", detail(.last_error))]
    RetriesExceeded {
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("request cancelled")]
    Cancelled,

    /// Unclassified upstream failure, propagated unchanged.
    #[error(transparent)]
    Upstream(#[from] InvokeError),
}

fn detail(last_error: &Option<String>) -> String {
    match last_error {
        Some(message) => format!(" (last error: {message})"),
        None => String::new(),
    }
}

impl DispatchError {
    /// Stable label for error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::AllCredentialsExhausted { .. } => "all_credentials_exhausted",
            DispatchError::InvalidCredential { .. } => "invalid_credential",
            DispatchError::RetriesExceeded { .. } => "retries_exceeded",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Upstream(_) => "upstream_error",
        }
    }
}
