//! Error types surfaced by the orchestrator and their HTTP translation.
//!
//! Provider failures never leave the executor in their raw shape: they are classified into a
//! [`GenerationError`] that carries any retry hint as a structured [`Duration`]. The HTTP layer
//! only ever looks at that field when deciding between a `429` and a `500`.
use crate::queue::QueueError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The model is cooling down; no provider call was made.
    #[error("model {model} is cooling down for another {retry_after:?}")]
    CooldownActive { model: String, retry_after: Duration },

    /// The provider reported quota or resource exhaustion. A cooldown has been recorded.
    #[error("quota exceeded for model {model}: {message}")]
    QuotaExceeded {
        model: String,
        message: String,
        retry_after: Duration,
    },

    /// Transient failures persisted through every allowed attempt.
    #[error("model {model} still unavailable after {attempts} attempts: {message}")]
    Transient {
        model: String,
        message: String,
        retry_after: Option<Duration>,
        attempts: u32,
    },

    /// Non-retryable failure, including missing credentials.
    #[error("generation with model {model} failed: {message}")]
    Fatal { model: String, message: String },
}

impl GenerationError {
    pub fn model(&self) -> &str {
        match self {
            GenerationError::CooldownActive { model, .. }
            | GenerationError::QuotaExceeded { model, .. }
            | GenerationError::Transient { model, .. }
            | GenerationError::Fatal { model, .. } => model,
        }
    }

    /// How long the caller should wait before trying again, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::CooldownActive { retry_after, .. }
            | GenerationError::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            GenerationError::Transient { retry_after, .. } => *retry_after,
            GenerationError::Fatal { .. } => None,
        }
    }

    /// Attach a retry hint if the error does not carry one already.
    pub fn with_retry_hint(self, hint: Option<Duration>) -> Self {
        match self {
            GenerationError::Transient {
                model,
                message,
                retry_after: None,
                attempts,
            } => GenerationError::Transient {
                model,
                message,
                retry_after: hint,
                attempts,
            },
            other => other,
        }
    }

    /// Short machine-readable name used in response bodies and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::CooldownActive { .. } => "cooldown_active",
            GenerationError::QuotaExceeded { .. } => "quota_exceeded",
            GenerationError::Transient { .. } => "provider_unavailable",
            GenerationError::Fatal { .. } => "generation_failed",
        }
    }
}

/// Seconds for a `Retry-After` header: rounded up, never zero.
pub fn retry_after_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Everything a handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient balance for {feature}")]
    InsufficientCredit { feature: &'static str },

    #[error("credit check failed: {0}")]
    CreditGate(String),
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Generation(err) if err.retry_after().is_some() => {
                (StatusCode::TOO_MANY_REQUESTS, err.kind())
            }
            ApiError::Generation(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.kind()),
            ApiError::Queue(_) => (StatusCode::INTERNAL_SERVER_ERROR, "queue_error"),
            ApiError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::InsufficientCredit { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credit")
            }
            ApiError::CreditGate(_) => (StatusCode::INTERNAL_SERVER_ERROR, "credit_gate_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        }));
        let mut response = (status, body).into_response();

        if let ApiError::Generation(err) = &self
            && let Some(retry_after) = err.retry_after()
        {
            response.headers_mut().insert(
                RETRY_AFTER,
                HeaderValue::from(retry_after_secs(retry_after)),
            );
        }
        response
    }
}
