//! Service-specific error types
//!
//! Every failed request renders as
//! `{"error":{"type":"...","message":"...","request_id":"req_..."}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::DispatchError;
use thiserror::Error;

/// Per-request failures surfaced as HTTP responses.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Pool(#[from] key_pool::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Dispatch(e) => match e {
                DispatchError::AllCredentialsExhausted { .. }
                | DispatchError::RetriesExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                DispatchError::InvalidCredential { .. } => StatusCode::UNAUTHORIZED,
                DispatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
            },
            Error::Pool(e) => match e {
                key_pool::Error::BlankCredential => StatusCode::BAD_REQUEST,
                key_pool::Error::IndexOutOfRange { .. } => StatusCode::NOT_FOUND,
                key_pool::Error::LastCredential | key_pool::Error::CredentialInUse { .. } => {
                    StatusCode::CONFLICT
                }
                key_pool::Error::NoCredentials => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Value of the `type` field in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request",
            Error::Dispatch(e) => e.kind(),
            Error::Pool(_) => "key_admin_error",
        }
    }

    /// JSON body without the request id, for embedding in batch results.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind(),
            "message": self.to_string(),
        })
    }

    pub fn into_response(self, request_id: &str) -> Response {
        let mut body = self.body();
        body["request_id"] = serde_json::Value::String(request_id.to_owned());
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": body }).to_string(),
        )
            .into_response()
    }
}

/// Fresh request id of the form `req_<32 hex>`.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}
