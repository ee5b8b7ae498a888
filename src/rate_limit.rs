//! Fixed-window request limiting per client.
//!
//! Each client key gets its own window. The first request opens it; once the window is older
//! than its configured length the next request starts a new one. Requests beyond the maximum are
//! rejected with the time left in the current window.
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(serialize_with = "serialize_secs", rename = "windowSecs")]
    pub window: Duration,
}

fn serialize_secs<S: serde::Serializer>(window: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(window.as_secs())
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        /// Time until the current window closes.
        reset_after: Duration,
    },
    Rejected {
        limit: u32,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("request counter overflowed for client {0}")]
    CounterOverflow(String),
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Count one request from `client_key` and decide whether it may proceed.
    pub fn check(&self, client_key: &str) -> Result<RateDecision, RateLimitError> {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(client_key.to_owned())
            .or_insert_with(|| RateWindow {
                window_start: now,
                count: 0,
            });

        if now.duration_since(window.window_start) > self.config.window {
            trace!(client = %client_key, "Rate window expired, starting a new one");
            window.window_start = now;
            window.count = 0;
        }

        window.count = window
            .count
            .checked_add(1)
            .ok_or_else(|| RateLimitError::CounterOverflow(client_key.to_owned()))?;

        let left = self
            .config
            .window
            .saturating_sub(now.duration_since(window.window_start));
        let limit = self.config.max_requests;

        if window.count > limit {
            debug!(client = %client_key, count = window.count, "Rate limit exceeded");
            return Ok(RateDecision::Rejected {
                limit,
                retry_after: left,
            });
        }

        Ok(RateDecision::Allowed {
            limit,
            remaining: limit - window.count,
            reset_after: left,
        })
    }

    /// Drop windows that have expired. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.window_start) <= self.config.window);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "Pruned expired rate windows");
        }
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
