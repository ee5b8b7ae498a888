//! Tower layer that applies the per-client [`RateLimiter`] in front of a route.
//!
//! The client is identified by the peer address from axum's `ConnectInfo`. Behind a reverse proxy
//! the layer can be told to trust `x-forwarded-for` instead, taking its first entry; without that
//! switch the header is ignored, since any caller can set it. The resolved key is attached to the
//! request as a [`ClientKey`] extension so handlers can use the same identity for credit checks.
use crate::errors::retry_after_secs;
use crate::rate_limit::{RateDecision, RateLimiter};
use axum::Json;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, warn};

pub const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity of the calling client, as used for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl ClientKey {
    pub fn anonymous() -> Self {
        Self("anonymous".to_owned())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_forwarded_for: false,
        }
    }

    /// Key clients by the first `x-forwarded-for` entry when present. Only safe behind a proxy
    /// that overwrites the header.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            limiter: Arc::clone(&self.limiter),
            trust_forwarded_for: self.trust_forwarded_for,
            inner,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
    inner: S,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let limiter = Arc::clone(&self.limiter);
        let trust_forwarded_for = self.trust_forwarded_for;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(client) = client_key(&req, trust_forwarded_for) else {
                warn!("Could not identify client, skipping rate limit");
                req.extensions_mut().insert(ClientKey::anonymous());
                return inner.call(req).await;
            };

            let decision = match limiter.check(&client.0) {
                Ok(decision) => decision,
                Err(e) => {
                    // Limiter faults must never block traffic.
                    error!(client = %client.0, error = %e, "Rate limit check failed, allowing request");
                    req.extensions_mut().insert(client);
                    return inner.call(req).await;
                }
            };

            match decision {
                RateDecision::Allowed {
                    limit,
                    remaining,
                    reset_after,
                } => {
                    req.extensions_mut().insert(client);
                    let mut response = inner.call(req).await?;
                    set_rate_headers(
                        response.headers_mut(),
                        limit,
                        remaining,
                        retry_after_secs(reset_after),
                    );
                    Ok(response)
                }
                RateDecision::Rejected { limit, retry_after } => {
                    debug!(client = %client.0, "Request rejected by rate limit");
                    Ok(rejection(limit, retry_after_secs(retry_after)))
                }
            }
        })
    }
}

fn client_key(req: &Request<Body>, trust_forwarded_for: bool) -> Option<ClientKey> {
    if trust_forwarded_for
        && let Some(forwarded) = req.headers().get(FORWARDED_FOR)
        && let Ok(forwarded) = forwarded.to_str()
        && let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty())
    {
        return Some(ClientKey(first.to_owned()));
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| ClientKey(addr.ip().to_string()))
}

fn set_rate_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_secs: u64) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_secs));
}

fn rejection(limit: u32, retry_after_secs: u64) -> Response<Body> {
    let body = json!({
        "error": {
            "message": format!("Too many requests, retry in {retry_after_secs}s"),
            "type": "rate_limited",
        }
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    set_rate_headers(headers, limit, 0, retry_after_secs);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use axum::Router;
    use axum::extract::Extension;
    use axum::routing::get;
    use rstest::rstest;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(max_requests: u32, trust_forwarded_for: bool) -> Router {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_secs(60),
        }));
        Router::new()
            .route(
                "/",
                get(|Extension(ClientKey(client)): Extension<ClientKey>| async move { client }),
            )
            .layer(RateLimitLayer::new(limiter).trust_forwarded_for(trust_forwarded_for))
    }

    fn request_from(peer: Option<[u8; 4]>, forwarded_for: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(ip) = forwarded_for {
            builder = builder.header(FORWARDED_FOR, ip);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from((peer, 4242))));
        }
        request
    }

    async fn body_text(response: Response<Body>) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_response_carries_rate_headers() {
        let response = app(3, false)
            .oneshot(request_from(Some([192, 0, 2, 1]), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "3");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "2");
        assert_eq!(response.headers()[RATE_LIMIT_RESET], "60");
        assert_eq!(body_text(response).await, "192.0.2.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_429_with_retry_after() {
        let app = app(1, false);
        app.clone()
            .oneshot(request_from(Some([198, 51, 100, 2]), None))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        let response = app
            .oneshot(request_from(Some([198, 51, 100, 2]), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "45");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_header_is_ignored_by_default() {
        let app = app(1, false);
        let mut statuses = Vec::new();
        for spoofed in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            let response = app
                .clone()
                .oneshot(request_from(Some([192, 0, 2, 1]), Some(spoofed)))
                .await
                .unwrap();
            statuses.push(response.status());
        }
        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_trusted_forwarded_header_keys_each_client() {
        let app = app(1, true);
        for forwarded in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
            let response = app
                .clone()
                .oneshot(request_from(Some([10, 0, 0, 1]), Some(forwarded)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, forwarded);
        }
    }

    #[rstest]
    #[case(false, Some("203.0.113.7, 10.0.0.1"), "192.0.2.1")]
    #[case(true, Some("203.0.113.7, 10.0.0.1"), "203.0.113.7")]
    #[case(true, Some(" , "), "192.0.2.1")]
    #[case(true, None, "192.0.2.1")]
    #[tokio::test]
    async fn test_client_key_source(
        #[case] trust: bool,
        #[case] forwarded_for: Option<&str>,
        #[case] expected: &str,
    ) {
        let response = app(3, trust)
            .oneshot(request_from(Some([192, 0, 2, 1]), forwarded_for))
            .await
            .unwrap();
        assert_eq!(body_text(response).await, expected);
    }

    #[tokio::test]
    async fn test_unidentified_client_passes_through() {
        let app = app(1, false);
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(request_from(None, Some("203.0.113.9")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(RATE_LIMIT_LIMIT).is_none());
        }
    }
}
