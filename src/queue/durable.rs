use super::{Job, JobQueue, JobSpec, QueueError, Worker, WorkerSettings};
use crate::fallback::ModelFallbackRouter;
use crate::traits::{CreditGate, NoOpCreditGate};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

/// Persistent storage behind the durable queue: job records plus a FIFO list of pending ids.
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Insert or overwrite a job record.
    async fn save(&self, job: &Job) -> Result<(), QueueError>;

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Append a job id to the pending list.
    async fn push(&self, id: &str) -> Result<(), QueueError>;

    /// Take the oldest pending job id, if any. Never blocks.
    async fn pop(&self) -> Result<Option<String>, QueueError>;
}

/// Queue backed by an external [`JobStore`], drained by background workers.
///
/// Workers are stopped when the queue is dropped.
#[derive(Debug)]
pub struct DurableQueue {
    store: Arc<dyn JobStore>,
    workers: Vec<JoinHandle<()>>,
}

impl DurableQueue {
    pub fn start(
        store: Arc<dyn JobStore>,
        router: Arc<ModelFallbackRouter>,
        settings: WorkerSettings,
    ) -> Self {
        Self::start_with_credit_gate(store, router, Arc::new(NoOpCreditGate), settings)
    }

    /// Start the workers; each completed job is charged to its client through `credit_gate`.
    pub fn start_with_credit_gate(
        store: Arc<dyn JobStore>,
        router: Arc<ModelFallbackRouter>,
        credit_gate: Arc<dyn CreditGate>,
        settings: WorkerSettings,
    ) -> Self {
        let worker = Arc::new(
            Worker::new(Arc::clone(&store), router, settings.poll_interval)
                .with_credit_gate(credit_gate),
        );
        let workers = worker.spawn(settings.concurrency);
        Self { store, workers }
    }
}

impl Drop for DurableQueue {
    fn drop(&mut self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

#[async_trait]
impl JobQueue for DurableQueue {
    #[instrument(skip(self, spec, client), fields(model = %spec.model))]
    async fn add(&self, spec: JobSpec, client: Option<String>) -> Result<String, QueueError> {
        let mut job = Job::new(spec).with_client(client);
        let id = job.id().to_owned();
        self.store.save(&job).await?;

        if let Err(push_error) = self.store.push(&id).await {
            // The record exists, so hand back the id with the job already failed.
            error!(job_id = %id, error = %push_error, "Failed to enqueue job");
            job.fail(format!("failed to enqueue job: {push_error}"));
            self.store.save(&job).await?;
            return Ok(id);
        }

        info!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        self.store.load(id).await
    }

    fn backend(&self) -> &'static str {
        "durable"
    }
}
