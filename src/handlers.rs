/// Axum handlers for the generation API
use crate::AppState;
use crate::errors::ApiError;
use crate::middleware::ClientKey;
use crate::provider::{GenerationRequest, is_valid_model_name};
use crate::queue::{Job, JobState};
use crate::traits::GENERATION_FEATURE;
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBody {
    /// Falls back to the configured primary model.
    pub model: Option<String>,
    pub content: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Job> for JobStatus {
    fn from(job: Job) -> Self {
        Self {
            id: job.id().to_owned(),
            state: job.state(),
            progress: job.progress(),
            result: job.result().map(str::to_owned),
            error: job.error().map(str::to_owned),
            created_at: job.created_at(),
        }
    }
}

/// `POST /v1/generate`: run a generation now, or enqueue it when `async` is set.
#[instrument(skip(state, client, body))]
pub async fn generate(
    State(state): State<AppState>,
    client: Option<Extension<ClientKey>>,
    Json(body): Json<GenerateBody>,
) -> Result<Response, ApiError> {
    if body.content.trim().is_empty() {
        return Err(ApiError::InvalidRequest("content must not be empty".into()));
    }
    if let Some(model) = &body.model
        && !is_valid_model_name(model)
    {
        return Err(ApiError::InvalidRequest(format!(
            "model must match [A-Za-z0-9._-]+, got {model:?}"
        )));
    }
    let client = client.map_or_else(ClientKey::anonymous, |Extension(key)| key);

    let has_balance = state
        .credit_gate
        .has_balance(&client.0, GENERATION_FEATURE)
        .await
        .map_err(|e| ApiError::CreditGate(e.to_string()))?;
    if !has_balance {
        info!(client = %client.0, "Insufficient balance, refusing generation");
        return Err(ApiError::InsufficientCredit {
            feature: GENERATION_FEATURE,
        });
    }

    let request = GenerationRequest::builder()
        .model(body.model.unwrap_or_else(|| state.default_model.clone()))
        .content(body.content)
        .config(body.config)
        .build();

    if body.run_async {
        // Charged by the queue once the job completes.
        let job_id = state.queue.add(request, Some(client.0)).await?;
        debug!(job_id = %job_id, backend = state.queue.backend(), "Generation job accepted");
        return Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })).into_response());
    }

    let generation = state.router.execute(&request).await?;

    if let Err(e) = state
        .credit_gate
        .deduct(&client.0, GENERATION_FEATURE)
        .await
    {
        // The text is already generated; do not withhold it over a billing hiccup.
        warn!(client = %client.0, error = %e, "Failed to deduct credit after generation");
    }

    Ok(Json(GenerateResponse {
        text: generation.text,
        model: generation.model,
    })
    .into_response())
}

/// `GET /v1/jobs/{id}`
#[instrument(skip(state))]
pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatus>, ApiError> {
    match state.queue.get_job(&id).await? {
        Some(job) => Ok(Json(job.into())),
        None => Err(ApiError::JobNotFound(id)),
    }
}

/// `GET /health`
#[instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let gate = state.router.executor().gate();
    Json(json!({
        "status": "ok",
        "queueBackend": state.queue.backend(),
        "maxConcurrent": gate.max_concurrent(),
        "inFlight": gate.in_use(),
        "rateLimit": state.rate_limiter.config(),
    }))
}
