//! Gemini transport: one `generateContent` call per invoke.
//!
//! The API key travels in the `x-goog-api-key` header, never in the URL, so it
//! cannot leak through request logs. Error bodies of the form
//! `{"error":{"code":429,"message":"...","status":"RESOURCE_EXHAUSTED"}}` are
//! flattened into `InvokeError.message` as `"RESOURCE_EXHAUSTED: ..."` so the
//! classifier can match on the status marker.

use crate::{GenerateRequest, InvokeError, Result, Transport};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on error text carried back from upstream.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// reqwest-backed client for the Gemini `generateContent` API.
pub struct GeminiTransport {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    timeout: Duration,
}

impl GeminiTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            default_model: default_model.into(),
            timeout,
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{model}:generateContent",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn generate(&self, credential: &str, request: &GenerateRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let body = request_body(request);

        let response = self
            .client
            .post(self.endpoint(model))
            .header(API_KEY_HEADER, credential)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InvokeError::transport(format!(
                        "request timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    InvokeError::transport(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InvokeError::transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), model, "upstream returned error");
            return Err(InvokeError::new(status.as_u16(), error_message(&text)));
        }

        let parsed: GenerateResponse = serde_json::from_str(&text)
            .map_err(|e| InvokeError::transport(format!("invalid response JSON: {e}")))?;
        let output = extract_text(&parsed);
        if output.is_empty() {
            return Err(InvokeError::transport("empty response"));
        }
        debug!(model, chars = output.len(), "generation complete");
        Ok(output)
    }
}

impl Transport for GeminiTransport {
    fn id(&self) -> &str {
        "gemini"
    }

    fn invoke<'a>(
        &'a self,
        credential: &'a str,
        request: &'a GenerateRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.generate(credential, request))
    }
}

/// Build the JSON request body for `generateContent`.
fn request_body(request: &GenerateRequest) -> serde_json::Value {
    let mut body = serde_json::json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": request.prompt }]
        }]
    });
    if let Some(system) = &request.system {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
    }
    body
}

/// Concatenate the text parts of the first candidate.
fn extract_text(response: &GenerateResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Flatten an upstream error body into a bounded message.
fn error_message(body: &str) -> String {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.status {
            Some(status) => format!("{status}: {}", envelope.error.message),
            None => envelope.error.message,
        },
        Err(_) => body.to_string(),
    };
    message.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
