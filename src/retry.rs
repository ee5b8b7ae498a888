//! Retry policy: error classification, exponential backoff with jitter, and retry hint parsing.
//!
//! Every provider failure falls into exactly one [`ErrorClass`]. Quota exhaustion is checked
//! first because providers report it with the same status code as ordinary rate limiting.
use crate::provider::{ErrorOrigin, ProviderError};
use bon::Builder;
use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// Status codes that signal a temporary condition on the provider side.
const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

const QUOTA_PATTERNS: [&str; 4] = [
    "quota",
    "resource_exhausted",
    "resource exhausted",
    "exceeded your current",
];

const TRANSIENT_PATTERNS: [&str; 9] = [
    "overloaded",
    "unavailable",
    "rate limit",
    "rate-limit",
    "too many requests",
    "try again later",
    "deadline exceeded",
    "connection reset",
    "timed out",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Usage limits hit. Never retried; puts the model on cooldown.
    QuotaExceeded,
    /// Temporary overload or unavailability. Retried while attempts remain.
    Transient,
    /// Anything else. Fails immediately.
    Fatal,
}

pub fn classify(error: &ProviderError) -> ErrorClass {
    if error.origin == ErrorOrigin::Config {
        return ErrorClass::Fatal;
    }

    let haystack = format!(
        "{} {}",
        error.code.as_deref().unwrap_or_default(),
        error.message
    )
    .to_lowercase();

    if QUOTA_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return ErrorClass::QuotaExceeded;
    }

    if error.origin == ErrorOrigin::Transport
        || error.status.is_some_and(|s| TRANSIENT_STATUSES.contains(&s))
        || TRANSIENT_PATTERNS.iter().any(|p| haystack.contains(p))
    {
        return ErrorClass::Transient;
    }

    ErrorClass::Fatal
}

/// Exponential backoff: `base * 2^(step - 1)`, capped at `max_delay`, plus up to `base / 2` of
/// random jitter.
#[derive(Debug, Clone, Builder)]
pub struct BackoffPolicy {
    #[builder(default = Duration::from_secs(1))]
    pub base: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
    #[builder(default = true)]
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows the `step`th computed backoff (1-indexed).
    pub fn delay_for_step(&self, step: u32) -> Duration {
        let exponent = step.saturating_sub(1).min(20);
        let delay = self
            .base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter {
            delay + self.jitter_for(self.base)
        } else {
            delay
        }
    }

    fn jitter_for(&self, base: Duration) -> Duration {
        let bound = base.as_millis() as u64 / 2;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=bound))
    }
}

static DURATION_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*(milliseconds?|ms|seconds?|secs?|s|minutes?|mins?|m)?\s*$")
        .expect("duration literal pattern is valid")
});

static RETRY_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)retry\s+(?:in|after)\s+(\d+(?:\.\d+)?)\s*(milliseconds?|ms|seconds?|secs?|s|minutes?|mins?|m)\b",
    )
    .expect("retry phrase pattern is valid")
});

/// Parse a duration such as `"30s"`, `"1500ms"`, `"2 minutes"` or a bare `"45"` (seconds).
pub fn parse_duration(text: &str) -> Option<Duration> {
    let captures = DURATION_LITERAL.captures(text)?;
    to_duration(&captures[1], captures.get(2).map_or("s", |m| m.as_str()))
}

/// Find a "retry in 12.5s" style hint inside a free-form provider message.
pub fn retry_hint_in_message(message: &str) -> Option<Duration> {
    let captures = RETRY_PHRASE.captures(message)?;
    to_duration(&captures[1], &captures[2])
}

fn to_duration(value: &str, unit: &str) -> Option<Duration> {
    let value: f64 = value.parse().ok()?;
    let seconds = match unit.to_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => value / 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
        _ => value,
    };
    Duration::try_from_secs_f64(seconds).ok()
}
