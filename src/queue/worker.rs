use super::{JobStore, QueueError, charge_completed};
use crate::fallback::ModelFallbackRouter;
use crate::traits::{CreditGate, NoOpCreditGate};
use bon::Builder;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Attempts per store operation before a worker gives up on it.
const STORE_ATTEMPTS: u32 = 5;

/// Upper bound for the wait between store attempts.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Builder)]
pub struct WorkerSettings {
    /// Number of consumer loops. Each job still passes the global admission gate.
    #[builder(default = 1)]
    pub concurrency: usize,
    /// How long an idle consumer waits before polling the store again.
    #[builder(default = Duration::from_millis(500))]
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Consumes pending job ids from a [`JobStore`] and runs them.
///
/// A popped id is owned by the worker until the job's terminal state is saved. Store errors
/// before the generation starts put the id back on the pending list; the terminal save is
/// retried with backoff.
#[derive(Debug)]
pub struct Worker {
    store: Arc<dyn JobStore>,
    router: Arc<ModelFallbackRouter>,
    credit_gate: Arc<dyn CreditGate>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        router: Arc<ModelFallbackRouter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            router,
            credit_gate: Arc::new(NoOpCreditGate),
            poll_interval,
        }
    }

    pub fn with_credit_gate(mut self, credit_gate: Arc<dyn CreditGate>) -> Self {
        self.credit_gate = credit_gate;
        self
    }

    /// Start `concurrency` consumer loops (at least one).
    pub fn spawn(self: &Arc<Self>, concurrency: usize) -> Vec<JoinHandle<()>> {
        (0..concurrency.max(1))
            .map(|consumer| {
                let worker = Arc::clone(self);
                tokio::spawn(async move { worker.run(consumer).await })
            })
            .collect()
    }

    async fn run(&self, consumer: usize) {
        info!(consumer, "Worker started");
        loop {
            match self.store.pop().await {
                Ok(Some(job_id)) => {
                    if let Err(e) = self.process(&job_id).await {
                        error!(consumer, job_id = %job_id, error = %e, "Failed to process job");
                    }
                }
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!(consumer, error = %e, "Failed to poll queue");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Run one job to a terminal state. Generation failures end up on the job; only store
    /// errors are returned.
    #[instrument(skip(self))]
    pub async fn process(&self, job_id: &str) -> Result<(), QueueError> {
        let loaded = self
            .with_store_retries("load job", || self.store.load(job_id))
            .await;
        let mut job = match loaded {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Popped a job id with no record, skipping");
                return Ok(());
            }
            Err(e) => {
                self.requeue(job_id).await;
                return Err(e);
            }
        };

        if !job.start() {
            debug!(state = ?job.state(), "Job is not queued, skipping");
            return Ok(());
        }
        if let Err(e) = self
            .with_store_retries("mark job active", || self.store.save(&job))
            .await
        {
            // The stored record is still queued, so another consumer can pick it up.
            self.requeue(job_id).await;
            return Err(e);
        }

        let outcome = self.router.execute(job.payload()).await;
        if let Err(e) = &outcome {
            info!(error = %e, "Job failed");
        }
        job.finish(outcome);
        self.with_store_retries("save finished job", || self.store.save(&job))
            .await?;
        charge_completed(self.credit_gate.as_ref(), &job).await;

        debug!(state = ?job.state(), "Job finished");
        Ok(())
    }

    async fn requeue(&self, job_id: &str) {
        match self
            .with_store_retries("requeue job", || self.store.push(job_id))
            .await
        {
            Ok(()) => info!(job_id = %job_id, "Job returned to the pending list"),
            Err(e) => error!(job_id = %job_id, error = %e, "Could not requeue job, it stays queued until resubmitted"),
        }
    }

    /// Run `op` up to [`STORE_ATTEMPTS`] times, doubling the wait from the poll interval.
    async fn with_store_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut delay = self.poll_interval;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < STORE_ATTEMPTS => {
                    warn!(attempt, operation = what, error = %e, "Store operation failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_STORE_BACKOFF);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
