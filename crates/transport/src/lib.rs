//! Remote invocation surface for the key pool
//!
//! Defines the `Transport` trait that decouples dispatch logic from the hosted
//! model API. `GeminiTransport` talks to a `generateContent` endpoint with an
//! API key header; tests and other callers can plug in their own transport.
//!
//! A transport performs exactly one remote call per `invoke`. Failures carry an
//! optional HTTP status and a message; the key pool inspects those only to
//! classify the failure, never for content.

pub mod gemini;

pub use gemini::GeminiTransport;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Classification of upstream failures to determine the dispatch reaction.
///
/// - RateLimited exhausts the credential and rotates to the next one
/// - InvalidCredential marks the credential errored and fails the call
/// - Transient retries on the same credential after a backoff
/// - Other marks the credential errored and propagates the raw failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Quota or traffic limiting (429, RESOURCE_EXHAUSTED)
    RateLimited,
    /// Missing model/resource or rejected key (404, 401, 403)
    InvalidCredential,
    /// Timeouts and upstream 5xx, retryable on the same key
    Transient,
    /// Anything else
    Other,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::InvalidCredential => "invalid_credential",
            ErrorClassification::Transient => "transient",
            ErrorClassification::Other => "other",
        }
    }
}

/// A failed remote call.
///
/// `status` is the upstream HTTP status when a response was received, `None`
/// for connection-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", display_invoke_error(.status, .message))]
pub struct InvokeError {
    pub status: Option<u16>,
    pub message: String,
}

fn display_invoke_error(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("upstream returned {code}: {message}"),
        None => format!("upstream request failed: {message}"),
    }
}

impl InvokeError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Failure without an HTTP response (connect error, timeout, decode error).
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

/// One text generation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Overrides the transport's default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Result alias for transport calls.
pub type Result<T> = std::result::Result<T, InvokeError>;

/// Abstraction over the hosted model API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    /// Perform exactly one remote call authenticated with `credential`.
    ///
    /// Returns the complete generated text, never a partial result.
    fn invoke<'a>(
        &'a self,
        credential: &'a str,
        request: &'a GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}
