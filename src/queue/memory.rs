use super::{JOB_RETENTION, Job, JobQueue, JobSpec, QueueError, charge_completed};
use crate::fallback::ModelFallbackRouter;
use crate::traits::{CreditGate, NoOpCreditGate};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

#[derive(Debug)]
struct StoredJob {
    job: Job,
    finished_at: Option<Instant>,
}

/// Fallback queue used when no durable backend is reachable.
///
/// `add` runs the job to completion before returning its id, so the first `get_job` already
/// sees a terminal state. Finished jobs are kept for the retention period and then dropped by
/// [`JobQueue::evict_expired`].
#[derive(Debug)]
pub struct InMemoryQueue {
    jobs: DashMap<String, StoredJob>,
    router: Arc<ModelFallbackRouter>,
    credit_gate: Arc<dyn CreditGate>,
    retention: Duration,
}

impl InMemoryQueue {
    pub fn new(router: Arc<ModelFallbackRouter>) -> Self {
        Self {
            jobs: DashMap::new(),
            router,
            credit_gate: Arc::new(NoOpCreditGate),
            retention: JOB_RETENTION,
        }
    }

    pub fn with_credit_gate(mut self, credit_gate: Arc<dyn CreditGate>) -> Self {
        self.credit_gate = credit_gate;
        self
    }

    /// How long a finished job stays readable.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Number of records currently held, finished or not.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn store(&self, job: &Job) {
        let finished_at = job.state().is_terminal().then(Instant::now);
        self.jobs.insert(
            job.id().to_owned(),
            StoredJob {
                job: job.clone(),
                finished_at,
            },
        );
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    #[instrument(skip(self, spec, client), fields(model = %spec.model))]
    async fn add(&self, spec: JobSpec, client: Option<String>) -> Result<String, QueueError> {
        let mut job = Job::new(spec).with_client(client);
        let id = job.id().to_owned();
        job.start();
        self.store(&job);

        let outcome = self.router.execute(job.payload()).await;
        job.finish(outcome);
        self.store(&job);
        charge_completed(self.credit_gate.as_ref(), &job).await;

        info!(job_id = %id, state = ?job.state(), "In-memory job finished");
        Ok(id)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.get(id).map(|entry| entry.job.clone()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn evict_expired(&self) -> usize {
        let before = self.jobs.len();
        let retention = self.retention;
        self.jobs.retain(|_, stored| {
            stored
                .finished_at
                .is_none_or(|finished| finished.elapsed() < retention)
        });
        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            debug!(removed, "Evicted finished in-memory jobs");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobState;
    use crate::test_utils::{MockProvider, RecordingCreditGate, overloaded, test_router};

    fn spec() -> JobSpec {
        JobSpec::builder().model("flash").content("write a haiku").build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_is_complete_when_add_returns() {
        let queue = InMemoryQueue::new(test_router(MockProvider::new()));

        let id = queue.add(spec(), None).await.unwrap();
        let job = queue.get_job(&id).await.unwrap().unwrap();

        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.progress(), 100);
        assert_eq!(job.result(), Some("generated by flash"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_recorded_not_returned() {
        let provider = MockProvider::new();
        provider.script(
            "flash",
            vec![Err(overloaded(None)), Err(overloaded(None)), Err(overloaded(None))],
        );
        let queue = InMemoryQueue::new(test_router(provider.clone()));

        let id = queue.add(spec(), None).await.unwrap();
        let job = queue.get_job(&id).await.unwrap().unwrap();

        assert_eq!(job.state(), JobState::Failed);
        assert!(job.error().unwrap().contains("still unavailable"));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_id_is_not_found() {
        let queue = InMemoryQueue::new(test_router(MockProvider::new()));
        assert!(queue.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_unique() {
        let queue = InMemoryQueue::new(test_router(MockProvider::new()));
        let first = queue.add(spec(), None).await.unwrap();
        let second = queue.add(spec(), None).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_job_is_charged_to_its_client() {
        let gate = Arc::new(RecordingCreditGate::default());
        let queue = InMemoryQueue::new(test_router(MockProvider::new()))
            .with_credit_gate(gate.clone());

        queue.add(spec(), Some("203.0.113.7".into())).await.unwrap();
        assert_eq!(
            gate.deductions(),
            vec![("203.0.113.7".to_owned(), "generation".to_owned())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_is_not_charged() {
        let provider = MockProvider::new();
        provider.script(
            "flash",
            vec![Err(overloaded(None)), Err(overloaded(None)), Err(overloaded(None))],
        );
        let gate = Arc::new(RecordingCreditGate::default());
        let queue = InMemoryQueue::new(test_router(provider)).with_credit_gate(gate.clone());

        queue.add(spec(), Some("203.0.113.7".into())).await.unwrap();
        assert!(gate.deductions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_are_evicted_after_retention() {
        let queue = InMemoryQueue::new(test_router(MockProvider::new()))
            .with_retention(Duration::from_secs(600));

        let old = queue.add(spec(), None).await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;
        let recent = queue.add(spec(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(queue.evict_expired(), 0);
        assert_eq!(queue.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.evict_expired(), 1);
        assert!(queue.get_job(&old).await.unwrap().is_none());
        assert_eq!(
            queue.get_job(&recent).await.unwrap().unwrap().state(),
            JobState::Completed
        );

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(queue.evict_expired(), 1);
        assert!(queue.is_empty());
    }
}
