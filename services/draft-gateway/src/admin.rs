//! Admin API for key management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) so key administration
//! never shares the public port. Changes wait for any running dispatch.
//!
//! Endpoints:
//! - GET    /admin/keys          list keys (masked) with status
//! - POST   /admin/keys          add a key `{"key": "..."}`
//! - DELETE /admin/keys/{index}  remove the key at `index`

use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use key_pool::Dispatcher;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, new_request_id};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    dispatcher: Arc<Dispatcher>,
}

impl AdminState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/keys", get(list_keys).post(add_key))
        .route("/admin/keys/{index}", delete(remove_key))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/keys: never exposes key values, only the masked preview.
async fn list_keys(State(state): State<AdminState>) -> Response {
    let status = state.dispatcher.pool().status();
    let keys: Vec<serde_json::Value> = status
        .credentials
        .iter()
        .enumerate()
        .map(|(index, credential)| {
            let mut entry = serde_json::to_value(credential).unwrap_or_default();
            entry["index"] = index.into();
            entry
        })
        .collect();
    json(
        StatusCode::OK,
        serde_json::json!({ "selected": status.selected, "keys": keys }),
    )
}

#[derive(Deserialize)]
struct AddKeyRequest {
    key: String,
}

/// POST /admin/keys: 201 when added, 200 when the key was already pooled.
async fn add_key(
    State(state): State<AdminState>,
    payload: Result<axum::Json<AddKeyRequest>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    let axum::Json(body) = match payload {
        Ok(body) => body,
        Err(e) => return Error::InvalidRequest(e.body_text()).into_response(&request_id),
    };
    match state.dispatcher.add_credential(&body.key).await {
        Ok(true) => {
            let keys_total = state.dispatcher.pool().len();
            info!(index = keys_total - 1, "key added via admin API");
            json(
                StatusCode::CREATED,
                serde_json::json!({ "status": "added", "keys_total": keys_total }),
            )
        }
        Ok(false) => json(
            StatusCode::OK,
            serde_json::json!({
                "status": "already_present",
                "keys_total": state.dispatcher.pool().len(),
            }),
        ),
        Err(e) => Error::from(e).into_response(&request_id),
    }
}

/// DELETE /admin/keys/{index}
async fn remove_key(State(state): State<AdminState>, Path(index): Path<usize>) -> Response {
    match state.dispatcher.remove_credential(index).await {
        Ok(removed) => json(
            StatusCode::OK,
            serde_json::json!({
                "status": "removed",
                "index": index,
                "masked": removed.masked,
                "selected": state.dispatcher.pool().selected_index(),
            }),
        ),
        Err(e) => Error::from(e).into_response(&new_request_id()),
    }
}
