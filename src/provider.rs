//! The remote generation provider.
//!
//! [`Provider`] is the seam between the orchestrator and the outside world. [`GeminiProvider`]
//! speaks the Gemini `generateContent` API over any [`HttpClient`]. Failures are parsed eagerly
//! into a [`ProviderError`]: status, provider error code, message and an optional retry hint,
//! wherever in the payload the provider chose to put it.
use crate::client::HttpClient;
use crate::retry::{parse_duration, retry_hint_in_message};
use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, header::RETRY_AFTER};
use bon::Builder;
use serde::{Deserialize, Serialize};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

/// Top-level request keys; every other `config` key is a generation parameter.
const TOP_LEVEL_CONFIG_KEYS: [&str; 4] = ["systemInstruction", "safetySettings", "tools", "toolConfig"];

const MAX_ERROR_BODY_CHARS: usize = 512;

static MODEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("model name pattern is valid"));

/// Whether `name` can be placed in the provider URL as a single path segment.
pub fn is_valid_model_name(name: &str) -> bool {
    MODEL_NAME.is_match(name)
}

/// What to generate, and with which model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct GenerationRequest {
    #[builder(into)]
    pub model: String,
    #[builder(into)]
    pub content: String,
    #[serde(default)]
    #[builder(default)]
    pub config: Value,
}

impl GenerationRequest {
    /// The same request aimed at a different model.
    pub fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_owned(),
            ..self.clone()
        }
    }
}

/// A successful generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    /// The model that actually produced the text (the alternate, after a fallback).
    pub model: String,
    pub text: String,
    /// Provider calls made, including the successful one.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// The provider answered with an error.
    Upstream,
    /// The request never got an answer (connection refused, reset, ...).
    Transport,
    /// Local misconfiguration, such as a missing credential.
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub origin: ErrorOrigin,
    pub status: Option<u16>,
    /// Provider error code, e.g. `RESOURCE_EXHAUSTED`.
    pub code: Option<String>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn upstream(
        status: Option<u16>,
        code: Option<String>,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            origin: ErrorOrigin::Upstream,
            status,
            code,
            message: message.into(),
            retry_after,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            origin: ErrorOrigin::Transport,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self {
            origin: ErrorOrigin::Config,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Parse an error response. Retry hints are looked up in the structured `retryDelay`
    /// detail first, then the `Retry-After` header, then the message text.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let envelope = serde_json::from_slice::<ErrorEnvelope>(body).ok();

        let (code, message, detail_hint) = match envelope {
            Some(ErrorEnvelope { error }) => {
                let hint = error
                    .details
                    .iter()
                    .filter_map(|detail| detail.get("retryDelay")?.as_str())
                    .find_map(parse_duration);
                let message = error
                    .message
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").into());
                (error.status, message, hint)
            }
            None => {
                let text: String = String::from_utf8_lossy(body)
                    .chars()
                    .take(MAX_ERROR_BODY_CHARS)
                    .collect();
                let message = if text.trim().is_empty() {
                    format!("provider returned HTTP {}", status.as_u16())
                } else {
                    text
                };
                (None, message, None)
            }
        };

        let header_hint = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_duration);

        let retry_after = detail_hint
            .or(header_hint)
            .or_else(|| retry_hint_in_message(&message));

        Self::upstream(Some(status.as_u16()), code, message, retry_after)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
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

#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Make exactly one generation call.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GeminiProvider<T: HttpClient> {
    client: T,
    base_url: Url,
    api_key: Option<String>,
}

impl<T: HttpClient> GeminiProvider<T> {
    pub fn new(client: T, base_url: Url, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    fn endpoint(&self, model: &str) -> Result<Url, ProviderError> {
        if !is_valid_model_name(model) {
            return Err(ProviderError::config(format!("invalid model name {model:?}")));
        }
        self.base_url
            .join(&format!("v1beta/models/{model}:generateContent"))
            .map_err(|e| ProviderError::config(format!("invalid provider URL for {model}: {e}")))
    }
}

/// Build the `generateContent` body, splitting `config` into top-level keys and
/// `generationConfig`.
fn request_body(request: &GenerationRequest) -> Value {
    let mut body = Map::new();
    body.insert(
        "contents".into(),
        json!([{ "role": "user", "parts": [{ "text": request.content }] }]),
    );

    if let Value::Object(config) = &request.config {
        let mut generation_config = Map::new();
        for (key, value) in config {
            if TOP_LEVEL_CONFIG_KEYS.contains(&key.as_str()) {
                body.insert(key.clone(), value.clone());
            } else {
                generation_config.insert(key.clone(), value.clone());
            }
        }
        if !generation_config.is_empty() {
            body.insert("generationConfig".into(), Value::Object(generation_config));
        }
    }
    Value::Object(body)
}

fn extract_text(body: &[u8]) -> Result<String, ProviderError> {
    let response: GenerateContentResponse = serde_json::from_slice(body).map_err(|e| {
        ProviderError::upstream(Some(200), None, format!("malformed provider response: {e}"), None)
    })?;

    let candidate = response.candidates.into_iter().next();
    let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());
    let text: String = candidate
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(ProviderError::upstream(
            Some(200),
            finish_reason,
            "provider returned no text",
            None,
        ));
    }
    Ok(text)
}

#[async_trait]
impl<T: HttpClient> Provider for GeminiProvider<T> {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let Some(api_key) = &self.api_key else {
            return Err(ProviderError::config("no provider API key configured"));
        };

        let url = self.endpoint(&request.model)?;
        let body = serde_json::to_vec(&request_body(request))
            .map_err(|e| ProviderError::config(format!("failed to encode request: {e}")))?;

        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header("content-type", "application/json")
            .header("x-goog-api-key", api_key)
            .body(axum::body::Body::from(body))
            .map_err(|e| ProviderError::config(format!("failed to build request: {e}")))?;

        let response = self.client.request(req).await.map_err(|e| {
            warn!(error = %e, "Provider request failed");
            ProviderError::transport(format!("request failed: {e}"))
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| ProviderError::transport(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            let error = ProviderError::from_response(status, &headers, &bytes);
            debug!(status = status.as_u16(), code = ?error.code, retry_after = ?error.retry_after, "Provider returned error");
            return Err(error);
        }

        extract_text(&bytes)
    }
}
