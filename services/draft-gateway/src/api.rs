//! Generation endpoints
//!
//! `POST /v1/generate` runs one prompt through the dispatcher.
//! `POST /v1/batch` runs several prompts one after another with pacing
//! between successful items.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::Secret;
use key_pool::BatchOutcome;
use serde::Deserialize;
use std::time::Instant;
use tracing::{info, instrument};
use transport::GenerateRequest;

use crate::AppState;
use crate::error::{Error, new_request_id};
use crate::metrics::record_request;

/// Upper bound on items in one batch request.
pub const MAX_BATCH_ITEMS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<GenerateRequest>,
}

fn is_blank(request: &GenerateRequest) -> bool {
    request.prompt.trim().is_empty()
}

fn json_ok(body: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// POST /v1/generate
#[instrument(skip_all, fields(request_id = tracing::field::Empty))]
pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    tracing::Span::current().record("request_id", request_id.as_str());
    let started = Instant::now();

    let response = match run_generate(&state, payload).await {
        Ok(text) => json_ok(serde_json::json!({ "text": text, "request_id": request_id })),
        Err(e) => {
            info!(
                transport = state.transport.id(),
                kind = e.kind(),
                error = %e,
                "generate failed"
            );
            e.into_response(&request_id)
        }
    };
    record_request("generate", response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

async fn run_generate(
    state: &AppState,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<String, Error> {
    let Json(request) = payload.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    if is_blank(&request) {
        return Err(Error::InvalidRequest("prompt must not be empty".into()));
    }

    let transport = state.transport.as_ref();
    let request = &request;
    let text = state
        .dispatcher
        .execute(
            move |key: Secret<String>| async move { transport.invoke(key.expose(), request).await },
            &state.shutdown,
        )
        .await?;
    Ok(text)
}

/// POST /v1/batch
#[instrument(skip_all, fields(request_id = tracing::field::Empty))]
pub async fn batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Response {
    let request_id = new_request_id();
    tracing::Span::current().record("request_id", request_id.as_str());
    let started = Instant::now();

    let response = match run_batch(&state, payload).await {
        Ok(results) => json_ok(serde_json::json!({ "results": results, "request_id": request_id })),
        Err(e) => e.into_response(&request_id),
    };
    record_request("batch", response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

async fn run_batch(
    state: &AppState,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Vec<serde_json::Value>, Error> {
    let Json(batch) = payload.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    if batch.items.len() > MAX_BATCH_ITEMS {
        return Err(Error::InvalidRequest(format!(
            "batch has {} items, limit is {MAX_BATCH_ITEMS}",
            batch.items.len()
        )));
    }
    if let Some(index) = batch.items.iter().position(is_blank) {
        return Err(Error::InvalidRequest(format!(
            "item {index}: prompt must not be empty"
        )));
    }

    let outcomes = state
        .dispatcher
        .run_batch(
            &batch.items,
            |item: &GenerateRequest| {
                let transport = state.transport.clone();
                let request = item.clone();
                move |key: Secret<String>| {
                    let transport = transport.clone();
                    let request = request.clone();
                    async move { transport.invoke(key.expose(), &request).await }
                }
            },
            &state.shutdown,
        )
        .await;

    Ok(outcomes
        .into_iter()
        .map(|outcome| match outcome {
            BatchOutcome::Completed(text) => serde_json::json!({ "status": "ok", "text": text }),
            BatchOutcome::Failed(e) => {
                serde_json::json!({ "status": "error", "error": Error::from(e).body() })
            }
            BatchOutcome::Skipped => serde_json::json!({ "status": "skipped" }),
        })
        .collect())
}
