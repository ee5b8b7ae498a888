//! Integration tests for the generation server
//!
//! These tests drive the full router (rate limiting, credit gate, orchestration and the job
//! queue) over HTTP requests against a scripted provider.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response, StatusCode};
use genqueue::admission::AdmissionGate;
use genqueue::cooldown::CooldownRegistry;
use genqueue::executor::RetryExecutor;
use genqueue::fallback::{FallbackPolicy, ModelFallbackRouter};
use genqueue::queue::{self, InMemoryQueue, JobQueue, QueueSettings};
use genqueue::rate_limit::{RateLimitConfig, RateLimiter};
use genqueue::retry::BackoffPolicy;
use genqueue::test_utils::{MockProvider, RecordingCreditGate, overloaded, quota_exhausted};
use genqueue::traits::{CreditError, CreditGate};
use genqueue::{AppState, build_router};
use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower::util::ServiceExt; // for oneshot()

fn orchestrator(provider: &MockProvider, max_concurrent: usize) -> Arc<ModelFallbackRouter> {
    let executor = RetryExecutor::new(
        Arc::new(provider.clone()),
        Arc::new(CooldownRegistry::default()),
        Arc::new(AdmissionGate::new(max_concurrent)),
        BackoffPolicy::builder().base(Duration::from_secs(1)).build(),
    );
    Arc::new(ModelFallbackRouter::new(executor, FallbackPolicy::default()))
}

fn app_with(
    router: Arc<ModelFallbackRouter>,
    queue: Arc<dyn JobQueue>,
    rate_limit: RateLimitConfig,
    credit_gate: Option<Arc<dyn CreditGate>>,
) -> Router {
    let state = AppState::builder()
        .router(router)
        .queue(queue)
        .rate_limiter(Arc::new(RateLimiter::new(rate_limit)))
        .maybe_credit_gate(credit_gate)
        .default_model("gemini-2.5-flash")
        .build();
    build_router(state)
}

fn app(provider: &MockProvider, max_concurrent: usize) -> Router {
    let router = orchestrator(provider, max_concurrent);
    let queue = Arc::new(InMemoryQueue::new(Arc::clone(&router)));
    app_with(router, queue, RateLimitConfig::default(), None)
}

/// A generate request arriving from peer address `client`, as `axum::serve` would deliver it.
fn generate_request(client: &str, body: Value) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/v1/generate")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let peer = SocketAddr::new(client.parse::<IpAddr>().unwrap(), 51000);
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_single_permit_serialises_concurrent_generations() {
    let provider = MockProvider::new().with_latency(Duration::from_secs(2));
    let app = app(&provider, 1);

    let first = tokio::spawn(
        app.clone()
            .oneshot(generate_request("10.0.0.1", json!({"content": "first"}))),
    );
    let second = tokio::spawn(
        app.clone()
            .oneshot(generate_request("10.0.0.2", json!({"content": "second"}))),
    );

    assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(second.await.unwrap().unwrap().status(), StatusCode::OK);

    assert_eq!(provider.peak_concurrency(), 1);
    let starts = provider.call_starts();
    assert!(starts[1] - starts[0] >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_quota_hint_puts_model_on_cooldown() {
    let provider = MockProvider::new();
    provider.script(
        "gemini-2.5-flash",
        vec![Err(quota_exhausted(Some(Duration::from_secs(30))))],
    );
    let app = app(&provider, 1);

    let response = app
        .clone()
        .oneshot(generate_request("10.0.0.1", json!({"content": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "30");
    assert_eq!(json_body(response).await["error"]["type"], "quota_exceeded");

    tokio::time::advance(Duration::from_secs(10)).await;

    let response = app
        .oneshot(generate_request("10.0.0.1", json!({"content": "hello"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "20");
    assert_eq!(json_body(response).await["error"]["type"], "cooldown_active");
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_with_backoff() {
    let provider = MockProvider::new();
    provider.script(
        "gemini-2.5-flash",
        vec![Err(overloaded(None)), Err(overloaded(None))],
    );
    let app = app(&provider, 1);

    let started = Instant::now();
    let response = app
        .oneshot(generate_request("10.0.0.1", json!({"content": "hello"})))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!({"text": "generated by gemini-2.5-flash", "model": "gemini-2.5-flash"})
    );
    assert_eq!(provider.call_count(), 3);
    assert!(
        elapsed >= Duration::from_secs(3) && elapsed <= Duration::from_secs(4),
        "elapsed {elapsed:?}"
    );
}

#[tokio::test]
async fn test_unreachable_queue_backend_still_accepts_jobs() {
    let provider = MockProvider::new();
    let router = orchestrator(&provider, 1);
    let settings = QueueSettings::builder()
        .redis_url("redis://127.0.0.1:1/")
        .probe_timeout(Duration::from_millis(500))
        .build();
    let queue = queue::connect(&settings, Arc::clone(&router)).await;
    assert_eq!(queue.backend(), "memory");

    let app = app_with(router, queue, RateLimitConfig::default(), None);

    let response = app
        .clone()
        .oneshot(generate_request(
            "10.0.0.1",
            json!({"content": "a long story", "async": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job_id = json_body(response).await["jobId"]
        .as_str()
        .unwrap()
        .to_owned();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/v1/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    assert_eq!(job["id"], job_id);
    assert_eq!(job["state"], "completed");
    assert_eq!(job["progress"], 100);
    assert_eq!(job["result"], "generated by gemini-2.5-flash");
    assert_eq!(job["error"], Value::Null);
}

#[tokio::test(start_paused = true)]
async fn test_fourth_request_in_window_is_rate_limited() {
    let provider = MockProvider::new();
    let router = orchestrator(&provider, 1);
    let queue = Arc::new(InMemoryQueue::new(Arc::clone(&router)));
    let app = app_with(
        router,
        queue,
        RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        },
        None,
    );

    for remaining in ["2", "1", "0"] {
        let response = app
            .clone()
            .oneshot(generate_request("192.0.2.10", json!({"content": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    tokio::time::advance(Duration::from_secs(10)).await;
    let response = app
        .clone()
        .oneshot(generate_request("192.0.2.10", json!({"content": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "50");
    assert_eq!(provider.call_count(), 3);

    // Another client has its own window.
    let response = app
        .oneshot(generate_request("192.0.2.11", json!({"content": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[derive(Debug)]
struct EmptyWallet;

#[async_trait]
impl CreditGate for EmptyWallet {
    async fn has_balance(&self, _client: &str, _feature: &str) -> Result<bool, CreditError> {
        Ok(false)
    }

    async fn deduct(&self, _client: &str, _feature: &str) -> Result<(), CreditError> {
        panic!("nothing should be deducted without balance");
    }
}

#[tokio::test]
async fn test_insufficient_credit_is_payment_required() {
    let provider = MockProvider::new();
    let router = orchestrator(&provider, 1);
    let queue = Arc::new(InMemoryQueue::new(Arc::clone(&router)));
    let app = app_with(
        router,
        queue,
        RateLimitConfig::default(),
        Some(Arc::new(EmptyWallet)),
    );

    for body in [json!({"content": "hi"}), json!({"content": "hi", "async": true})] {
        let response = app
            .clone()
            .oneshot(generate_request("10.0.0.1", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let provider = MockProvider::new();
    let app = app(&provider, 1);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/jobs/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["type"], "not_found");
}

#[tokio::test(start_paused = true)]
async fn test_failed_generation_without_hint_is_server_error() {
    let provider = MockProvider::new();
    provider.script(
        "gemini-2.5-pro",
        vec![Err(genqueue::provider::ProviderError::upstream(
            Some(400),
            Some("INVALID_ARGUMENT".into()),
            "Request contains an invalid argument",
            None,
        ))],
    );
    let app = app(&provider, 1);

    let response = app
        .oneshot(generate_request(
            "10.0.0.1",
            json!({"model": "gemini-2.5-pro", "content": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get("retry-after").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_spoofed_forwarded_for_does_not_escape_rate_limit() {
    let provider = MockProvider::new();
    let router = orchestrator(&provider, 1);
    let queue = Arc::new(InMemoryQueue::new(Arc::clone(&router)));
    let app = app_with(
        router,
        queue,
        RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        },
        None,
    );

    let mut allowed = 0;
    for i in 1..=5 {
        let mut request = generate_request("192.0.2.50", json!({"content": "hi"}));
        request
            .headers_mut()
            .insert("x-forwarded-for", format!("203.0.113.{i}").parse().unwrap());
        if app.clone().oneshot(request).await.unwrap().status() == StatusCode::OK {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 1);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_async_generation_is_charged_when_job_completes() {
    let provider = MockProvider::new();
    let router = orchestrator(&provider, 1);
    let gate = Arc::new(RecordingCreditGate::default());
    let queue = Arc::new(InMemoryQueue::new(Arc::clone(&router)).with_credit_gate(gate.clone()));
    let app = app_with(router, queue, RateLimitConfig::default(), Some(gate.clone()));

    let response = app
        .oneshot(generate_request(
            "198.51.100.7",
            json!({"content": "a long story", "async": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        gate.deductions(),
        vec![("198.51.100.7".to_owned(), "generation".to_owned())]
    );
}
