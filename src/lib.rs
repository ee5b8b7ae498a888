//! genqueue - admission-controlled, cooldown-aware generation orchestration
//!
//! This library sits between callers and a remote generation provider with strict quotas. It
//! bounds how many calls are in flight, retries transient failures with backoff, puts exhausted
//! models on cooldown, falls back to an alternate model, and runs long generations as jobs on a
//! queue that degrades from Redis to in-process execution when Redis is unavailable.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod admission;
pub mod client;
pub mod config;
pub mod cooldown;
pub mod errors;
pub mod executor;
pub mod fallback;
pub mod handlers;
pub mod middleware;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod traits;

use fallback::ModelFallbackRouter;
use handlers::{generate, health, job_status};
use middleware::RateLimitLayer;
use queue::JobQueue;
use rate_limit::RateLimiter;
use traits::{CreditGate, NoOpCreditGate};

/// Shared state handed to every handler
#[derive(Clone, Debug, Builder)]
pub struct AppState {
    pub router: Arc<ModelFallbackRouter>,
    pub queue: Arc<dyn JobQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    #[builder(default = Arc::new(NoOpCreditGate) as Arc<dyn CreditGate>)]
    pub credit_gate: Arc<dyn CreditGate>,
    /// Model used when a request does not name one.
    #[builder(into)]
    pub default_model: String,
    /// Rate-limit clients by `x-forwarded-for` rather than the peer address.
    #[builder(default)]
    pub trust_forwarded_for: bool,
}

/// Build the main router
/// This creates routes for:
/// - `POST /v1/generate` - Run or enqueue a generation (rate limited per client)
/// - `GET /v1/jobs/{id}` - Poll a queued generation
/// - `GET /health` - Queue backend, admission budget and rate-limit settings
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    let rate_limit = RateLimitLayer::new(Arc::clone(&state.rate_limiter))
        .trust_forwarded_for(state.trust_forwarded_for);
    Router::new()
        .route("/v1/generate", post(generate).layer(rate_limit))
        .route("/v1/jobs/{id}", get(job_status))
        .route("/health", get(health))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is prepended to every metric name. It accepts either a string literal or an owned
/// string; the layer keeps it for the lifetime of the process.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}

/// Mocks and fixtures shared by unit and integration tests.
#[doc(hidden)]
pub mod test_utils {
    use crate::admission::AdmissionGate;
    use crate::client::HttpClient;
    use crate::cooldown::CooldownRegistry;
    use crate::executor::RetryExecutor;
    use crate::fallback::{FallbackPolicy, ModelFallbackRouter};
    use crate::provider::{GenerationRequest, Provider, ProviderError};
    use crate::queue::{Job, JobQueue, JobStore, QueueError};
    use crate::retry::BackoffPolicy;
    use crate::traits::{CreditError, CreditGate};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        response_builder: Arc<dyn Fn() -> axum::response::Response + Send + Sync>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self::with_headers(status, &[], body)
        }

        pub fn with_headers(status: StatusCode, headers: &[(&str, &str)], body: &str) -> Self {
            let body = body.to_string();
            let headers: Vec<(String, String)> = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                response_builder: Arc::new(move || {
                    let mut builder = axum::response::Response::builder()
                        .status(status)
                        .header("content-type", "application/json");
                    for (name, value) in &headers {
                        builder = builder.header(name, value);
                    }
                    builder.body(axum::body::Body::from(body.clone())).unwrap()
                }),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("response_builder", &"<closure>")
                .finish()
        }
    }

    impl Clone for MockHttpClient {
        fn clone(&self) -> Self {
            Self {
                requests: Arc::clone(&self.requests),
                response_builder: Arc::clone(&self.response_builder),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests.lock().unwrap().push(MockRequest {
                method,
                uri,
                headers,
                body,
            });

            Ok((self.response_builder)())
        }
    }

    #[derive(Debug, Default)]
    struct ProviderLog {
        scripts: HashMap<String, VecDeque<Result<String, ProviderError>>>,
        calls: Vec<(String, Instant)>,
    }

    /// Scripted [`Provider`]. Each model answers from its script in order, then succeeds with
    /// `"generated by {model}"`. Clones share the script and the call log.
    #[derive(Debug, Clone, Default)]
    pub struct MockProvider {
        log: Arc<Mutex<ProviderLog>>,
        latency: Duration,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call take `latency` before answering.
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn script(&self, model: &str, outcomes: Vec<Result<String, ProviderError>>) {
            self.log
                .lock()
                .unwrap()
                .scripts
                .entry(model.to_owned())
                .or_default()
                .extend(outcomes);
        }

        pub fn call_count(&self) -> usize {
            self.log.lock().unwrap().calls.len()
        }

        pub fn calls_for(&self, model: &str) -> usize {
            self.log
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter(|(m, _)| m == model)
                .count()
        }

        pub fn models_called(&self) -> Vec<String> {
            self.log
                .lock()
                .unwrap()
                .calls
                .iter()
                .map(|(m, _)| m.clone())
                .collect()
        }

        /// When each call started, in call order.
        pub fn call_starts(&self) -> Vec<Instant> {
            self.log
                .lock()
                .unwrap()
                .calls
                .iter()
                .map(|(_, at)| *at)
                .collect()
        }

        /// Highest number of calls that were in progress at the same time.
        pub fn peak_concurrency(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
            let outcome = {
                let mut log = self.log.lock().unwrap();
                log.calls.push((request.model.clone(), Instant::now()));
                log.scripts
                    .get_mut(&request.model)
                    .and_then(VecDeque::pop_front)
            };

            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            outcome.unwrap_or_else(|| Ok(format!("generated by {}", request.model)))
        }
    }

    /// The provider's "model overloaded" answer.
    pub fn overloaded(retry_after: Option<Duration>) -> ProviderError {
        ProviderError::upstream(
            Some(503),
            Some("UNAVAILABLE".into()),
            "The model is overloaded. Please try again later.",
            retry_after,
        )
    }

    /// The provider's quota exhaustion answer.
    pub fn quota_exhausted(retry_after: Option<Duration>) -> ProviderError {
        ProviderError::upstream(
            Some(429),
            Some("RESOURCE_EXHAUSTED".into()),
            "You exceeded your current quota, please check your plan and billing details.",
            retry_after,
        )
    }

    /// Router over `provider` with one admission slot, fast deterministic backoff and no
    /// alternate model.
    pub fn test_router(provider: MockProvider) -> Arc<ModelFallbackRouter> {
        let executor = RetryExecutor::new(
            Arc::new(provider),
            Arc::new(CooldownRegistry::default()),
            Arc::new(AdmissionGate::new(1)),
            BackoffPolicy::builder()
                .base(Duration::from_millis(10))
                .jitter(false)
                .build(),
        );
        Arc::new(ModelFallbackRouter::new(executor, FallbackPolicy::default()))
    }

    /// [`JobStore`] kept in process memory, with switches to simulate backend failures.
    #[derive(Debug, Default)]
    pub struct MemoryJobStore {
        jobs: Mutex<HashMap<String, Job>>,
        history: Mutex<HashMap<String, Vec<Job>>>,
        pending: Mutex<VecDeque<String>>,
        fail_pushes: AtomicBool,
        fail_pops: AtomicBool,
        load_failures: AtomicUsize,
        save_failures: AtomicUsize,
    }

    /// Consume one of the remaining scripted failures, if any.
    fn take_failure(remaining: &AtomicUsize) -> bool {
        remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl MemoryJobStore {
        pub fn pending_len(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        /// Every version of the job that was saved, oldest first.
        pub fn history(&self, id: &str) -> Vec<Job> {
            self.history
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .unwrap_or_default()
        }

        pub fn fail_pushes(&self, fail: bool) {
            self.fail_pushes.store(fail, Ordering::SeqCst);
        }

        pub fn fail_pops(&self, fail: bool) {
            self.fail_pops.store(fail, Ordering::SeqCst);
        }

        /// Make the next `count` loads fail.
        pub fn fail_next_loads(&self, count: usize) {
            self.load_failures.store(count, Ordering::SeqCst);
        }

        /// Make the next `count` saves fail without storing anything.
        pub fn fail_next_saves(&self, count: usize) {
            self.save_failures.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl JobStore for MemoryJobStore {
        async fn save(&self, job: &Job) -> Result<(), QueueError> {
            if take_failure(&self.save_failures) {
                return Err(QueueError::Backend("save refused".into()));
            }
            self.jobs
                .lock()
                .unwrap()
                .insert(job.id().to_owned(), job.clone());
            self.history
                .lock()
                .unwrap()
                .entry(job.id().to_owned())
                .or_default()
                .push(job.clone());
            Ok(())
        }

        async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
            if take_failure(&self.load_failures) {
                return Err(QueueError::Backend("load refused".into()));
            }
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn push(&self, id: &str) -> Result<(), QueueError> {
            if self.fail_pushes.load(Ordering::SeqCst) {
                return Err(QueueError::Backend("push refused".into()));
            }
            self.pending.lock().unwrap().push_back(id.to_owned());
            Ok(())
        }

        async fn pop(&self) -> Result<Option<String>, QueueError> {
            if self.fail_pops.load(Ordering::SeqCst) {
                return Err(QueueError::Backend("pop refused".into()));
            }
            Ok(self.pending.lock().unwrap().pop_front())
        }
    }

    /// [`CreditGate`] with unlimited balance that records every deduction.
    #[derive(Debug, Default)]
    pub struct RecordingCreditGate {
        deductions: Mutex<Vec<(String, String)>>,
    }

    impl RecordingCreditGate {
        /// `(client, feature)` pairs in the order they were charged.
        pub fn deductions(&self) -> Vec<(String, String)> {
            self.deductions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CreditGate for RecordingCreditGate {
        async fn has_balance(&self, _client: &str, _feature: &str) -> Result<bool, CreditError> {
            Ok(true)
        }

        async fn deduct(&self, client: &str, feature: &str) -> Result<(), CreditError> {
            self.deductions
                .lock()
                .unwrap()
                .push((client.to_owned(), feature.to_owned()));
            Ok(())
        }
    }

    /// Poll `queue` until job `id` is finished. Panics after about five seconds.
    pub async fn wait_for_terminal<Q: JobQueue + ?Sized>(queue: &Q, id: &str) -> Job {
        for _ in 0..500 {
            if let Some(job) = queue.get_job(id).await.unwrap()
                && job.state().is_terminal()
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::rate_limit::RateLimitConfig;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use test_utils::{MockProvider, RecordingCreditGate, test_router};

    fn server_with_gate(provider: MockProvider, gate: Arc<RecordingCreditGate>) -> TestServer {
        let router = test_router(provider);
        let queue = InMemoryQueue::new(Arc::clone(&router)).with_credit_gate(gate.clone());
        let state = AppState::builder()
            .queue(Arc::new(queue) as Arc<dyn JobQueue>)
            .router(router)
            .rate_limiter(Arc::new(RateLimiter::new(RateLimitConfig::default())))
            .credit_gate(gate)
            .default_model("flash")
            .trust_forwarded_for(true)
            .build();
        TestServer::new(build_router(state)).unwrap()
    }

    fn server(provider: MockProvider) -> TestServer {
        server_with_gate(provider, Arc::new(RecordingCreditGate::default()))
    }

    #[tokio::test]
    async fn test_generate_uses_default_model() {
        let server = server(MockProvider::new());

        let response = server
            .post("/v1/generate")
            .add_header("x-forwarded-for", "203.0.113.9")
            .json(&json!({"content": "hello"}))
            .await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body, json!({"text": "generated by flash", "model": "flash"}));
        assert_eq!(response.header("x-ratelimit-limit"), "20");
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected() {
        let server = server(MockProvider::new());
        let response = server
            .post("/v1/generate")
            .json(&json!({"content": "  "}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_model_outside_path_segment_charset_is_rejected() {
        let provider = MockProvider::new();
        let server = server(provider.clone());
        let response = server
            .post("/v1/generate")
            .json(&json!({"model": "../../v1/files?key=x", "content": "hello"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_and_async_generations_are_both_charged() {
        let gate = Arc::new(RecordingCreditGate::default());
        let server = server_with_gate(MockProvider::new(), gate.clone());

        server
            .post("/v1/generate")
            .add_header("x-forwarded-for", "203.0.113.9")
            .json(&json!({"content": "hello"}))
            .await
            .assert_status_ok();
        server
            .post("/v1/generate")
            .add_header("x-forwarded-for", "203.0.113.9")
            .json(&json!({"content": "hello", "async": true}))
            .await
            .assert_status(StatusCode::ACCEPTED);

        let charged = ("203.0.113.9".to_owned(), "generation".to_owned());
        assert_eq!(gate.deductions(), vec![charged.clone(), charged]);
    }

    #[tokio::test]
    async fn test_health_reports_configuration() {
        let server = server(MockProvider::new());
        let body: Value = server.get("/health").await.json();
        assert_eq!(body["queueBackend"], "memory");
        assert_eq!(body["maxConcurrent"], 1);
        assert_eq!(body["inFlight"], 0);
        assert_eq!(body["rateLimit"], json!({"maxRequests": 20, "windowSecs": 60}));
    }
}
