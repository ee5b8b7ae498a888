//! Generation jobs and the queue that runs them.
//!
//! Callers only ever see `Arc<dyn JobQueue>`. Which implementation sits behind it is decided
//! once, at startup, by [`connect`]:
//!
//! - [`DurableQueue`]: job records and the pending list live in Redis; background
//!   [`Worker`]s pop job ids and run them through the [`ModelFallbackRouter`].
//! - [`InMemoryQueue`]: chosen when Redis is not configured, refuses the connection, or does not
//!   answer within the probe timeout. It runs each job to completion inside `add`.
//!
//! There is no switching back to Redis once the in-memory queue has been picked.
//!
//! Whichever backend runs a job charges the submitting client through the [`CreditGate`] once
//! the job has completed. Failed jobs are not charged.
mod durable;
mod memory;
mod redis_store;
mod worker;

pub use durable::{DurableQueue, JobStore};
pub use memory::InMemoryQueue;
pub use redis_store::RedisJobStore;
pub use worker::{Worker, WorkerSettings};

use crate::errors::GenerationError;
use crate::fallback::ModelFallbackRouter;
use crate::provider::{Generation, GenerationRequest};
use crate::traits::{CreditGate, GENERATION_FEATURE, NoOpCreditGate};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Progress reported once a worker has picked a job up.
pub const ACTIVE_PROGRESS: u8 = 10;

/// How long job records are kept, counted from the last write in Redis and from completion in
/// memory.
pub const JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// The payload of a job is a plain generation request.
pub type JobSpec = GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A generation job. Progress only moves forward, and a finished job never changes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    id: String,
    state: JobState,
    progress: u8,
    payload: JobSpec,
    /// Client charged once the job completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: JobState::Queued,
            progress: 0,
            payload,
            client: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Bill the job to `client`.
    pub fn with_client(mut self, client: Option<String>) -> Self {
        self.client = client;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn payload(&self) -> &JobSpec {
        &self.payload
    }

    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Move a queued job to `active`. Returns `false` if it was not queued.
    pub fn start(&mut self) -> bool {
        if self.state != JobState::Queued {
            return false;
        }
        self.state = JobState::Active;
        self.advance(ACTIVE_PROGRESS);
        true
    }

    /// Raise progress to `progress` (capped below 100 until the job finishes).
    pub fn advance(&mut self, progress: u8) {
        if self.state.is_terminal() {
            return;
        }
        self.progress = self.progress.max(progress.min(99));
    }

    pub fn complete(&mut self, text: String) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(text);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Failed;
        self.progress = 100;
        self.error = Some(message.into());
    }

    /// Record the outcome of running the job.
    pub fn finish(&mut self, outcome: Result<Generation, GenerationError>) {
        match outcome {
            Ok(generation) => self.complete(generation.text),
            Err(error) => self.fail(error.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[async_trait]
pub trait JobQueue: Send + Sync + std::fmt::Debug {
    /// Accept a job and return its id. The id always resolves through [`JobQueue::get_job`].
    ///
    /// `client`, when given, is charged through the credit gate once the job completes.
    async fn add(&self, spec: JobSpec, client: Option<String>) -> Result<String, QueueError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Backend name, for operational visibility only.
    fn backend(&self) -> &'static str;

    /// Drop finished jobs past their retention. Returns how many were removed.
    ///
    /// Backends that expire records on their own have nothing to do here.
    fn evict_expired(&self) -> usize {
        0
    }
}

/// Charge the job's client for a completed generation. A failed deduction is only logged,
/// since the result is already stored.
async fn charge_completed(gate: &dyn CreditGate, job: &Job) {
    if job.state() != JobState::Completed {
        return;
    }
    let Some(client) = job.client() else {
        return;
    };
    if let Err(e) = gate.deduct(client, GENERATION_FEATURE).await {
        warn!(job_id = %job.id(), client = %client, error = %e, "Failed to deduct credit for finished job");
    }
}

#[derive(Debug, Clone, Builder)]
pub struct QueueSettings {
    /// Redis URL; without one the in-memory queue is used.
    #[builder(into)]
    pub redis_url: Option<String>,
    #[builder(default = Duration::from_secs(2))]
    pub probe_timeout: Duration,
    #[builder(into, default = "genqueue".to_owned())]
    pub key_prefix: String,
    /// Lifetime of job records in either backend.
    #[builder(default = JOB_RETENTION)]
    pub job_retention: Duration,
    #[builder(default)]
    pub worker: WorkerSettings,
    /// Charged when a queued generation completes.
    #[builder(default = Arc::new(NoOpCreditGate) as Arc<dyn CreditGate>)]
    pub credit_gate: Arc<dyn CreditGate>,
}

/// Probe Redis and build the queue for the lifetime of the process.
pub async fn connect(
    settings: &QueueSettings,
    router: Arc<ModelFallbackRouter>,
) -> Arc<dyn JobQueue> {
    let probe = async {
        let url = settings
            .redis_url
            .as_deref()
            .ok_or_else(|| QueueError::Backend("no durable queue URL configured".into()))?;
        let store =
            RedisJobStore::connect(url, &settings.key_prefix, settings.job_retention).await?;
        Ok::<_, QueueError>(Arc::new(store) as Arc<dyn JobStore>)
    };
    select_queue(probe, router, settings).await
}

/// Pick the durable queue if `probe` yields a store within the settings' probe timeout, the
/// in-memory one otherwise.
pub async fn select_queue<F>(
    probe: F,
    router: Arc<ModelFallbackRouter>,
    settings: &QueueSettings,
) -> Arc<dyn JobQueue>
where
    F: Future<Output = Result<Arc<dyn JobStore>, QueueError>>,
{
    let in_memory = || {
        Arc::new(
            InMemoryQueue::new(Arc::clone(&router))
                .with_credit_gate(Arc::clone(&settings.credit_gate))
                .with_retention(settings.job_retention),
        ) as Arc<dyn JobQueue>
    };

    match tokio::time::timeout(settings.probe_timeout, probe).await {
        Ok(Ok(store)) => {
            info!(
                workers = settings.worker.concurrency,
                "Durable queue reachable, starting workers"
            );
            Arc::new(DurableQueue::start_with_credit_gate(
                store,
                Arc::clone(&router),
                Arc::clone(&settings.credit_gate),
                settings.worker,
            ))
        }
        Ok(Err(error)) => {
            warn!(error = %error, "Durable queue unavailable, using in-memory queue");
            in_memory()
        }
        Err(_) => {
            warn!(
                timeout_ms = settings.probe_timeout.as_millis() as u64,
                "Durable queue probe timed out, using in-memory queue"
            );
            in_memory()
        }
    }
}
