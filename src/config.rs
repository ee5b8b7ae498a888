//! Configuration parsing and validation for the generation server
//!
//! This module handles command-line argument parsing and validation using clap.
//! Credentials, models and the Redis URL can also come from the environment.
use crate::cooldown::CooldownRegistry;
use crate::fallback::FallbackPolicy;
use crate::provider::is_valid_model_name;
use crate::queue::{QueueSettings, WorkerSettings};
use crate::rate_limit::RateLimitConfig;
use crate::retry::BackoffPolicy;
use anyhow::{anyhow, bail};
use clap::Parser;
use std::time::Duration;
use url::Url;

#[derive(Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the API server will listen.
    #[arg(short = 'p', long, default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "genqueue")]
    pub metrics_prefix: String,

    /// Base URL of the Gemini-compatible generation API.
    #[arg(
        long,
        env = "PROVIDER_URL",
        default_value = "https://generativelanguage.googleapis.com/"
    )]
    pub provider_url: String,

    /// API key for the provider. Without one every generation fails.
    #[arg(long, env = "PROVIDER_API_KEY")]
    pub provider_key: Option<String>,

    /// Model used when a request does not name one.
    #[arg(long, env = "PRIMARY_MODEL", default_value = "gemini-2.5-flash")]
    pub primary_model: String,

    /// Model tried once the requested model has failed.
    #[arg(long, env = "ALTERNATE_MODEL")]
    pub alternate_model: Option<String>,

    /// Provider calls allowed in flight at once, across all requests and jobs.
    #[arg(long, default_value_t = 1)]
    pub max_concurrent: usize,

    /// Attempts per generation against the requested model.
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Attempts against the alternate model.
    #[arg(long, default_value_t = 2)]
    pub fallback_attempts: u32,

    #[arg(long, default_value_t = 1000)]
    pub backoff_base_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    /// Cooldown after quota exhaustion when the provider gives no retry hint.
    #[arg(long, default_value_t = 60)]
    pub default_cooldown_secs: u64,

    /// Cooldown after repeated overload failures.
    #[arg(long, default_value_t = 120)]
    pub overload_cooldown_secs: u64,

    /// Requests per client per rate-limit window.
    #[arg(long, default_value_t = 20)]
    pub rate_limit_max: u32,

    #[arg(long, default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Identify clients by the first `x-forwarded-for` entry instead of the peer address.
    /// Only enable behind a proxy that sets the header itself.
    #[arg(long, default_value_t = false)]
    pub trust_forwarded_for: bool,

    /// Redis URL for the durable job queue. Jobs run in process when unset or unreachable.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// How long the startup probe waits for Redis.
    #[arg(long, default_value_t = 2000)]
    pub queue_probe_timeout_ms: u64,

    /// Prefix for every Redis key the queue writes.
    #[arg(long, default_value = "genqueue")]
    pub queue_key_prefix: String,

    /// How long job records stay readable: the Redis TTL, or the time since completion for the
    /// in-memory queue.
    #[arg(long, default_value_t = 86_400)]
    pub job_retention_secs: u64,

    #[arg(long, default_value_t = 1)]
    pub worker_concurrency: usize,

    #[arg(long, default_value_t = 500)]
    pub worker_poll_interval_ms: u64,

    /// Maximum number of idle HTTP connections to keep alive to the provider.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("metrics_port", &self.metrics_port)
            .field("provider_url", &self.provider_url)
            .field("provider_key", &self.provider_key.as_ref().map(|_| "<redacted>"))
            .field("primary_model", &self.primary_model)
            .field("alternate_model", &self.alternate_model)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_attempts", &self.max_attempts)
            .field("rate_limit_max", &self.rate_limit_max)
            .field("rate_limit_window_secs", &self.rate_limit_window_secs)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("worker_concurrency", &self.worker_concurrency)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        Url::parse(&self.provider_url)
            .map_err(|e| anyhow!("Invalid provider URL '{}': {}", self.provider_url, e))?;

        let positive = [
            ("max-concurrent", self.max_concurrent as u64),
            ("max-attempts", u64::from(self.max_attempts)),
            ("fallback-attempts", u64::from(self.fallback_attempts)),
            ("rate-limit-max", u64::from(self.rate_limit_max)),
            ("rate-limit-window-secs", self.rate_limit_window_secs),
            ("worker-concurrency", self.worker_concurrency as u64),
            ("worker-poll-interval-ms", self.worker_poll_interval_ms),
            ("job-retention-secs", self.job_retention_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            bail!("--{name} must be greater than zero");
        }

        if self.backoff_max_ms < self.backoff_base_ms {
            bail!(
                "--backoff-max-ms ({}) must not be below --backoff-base-ms ({})",
                self.backoff_max_ms,
                self.backoff_base_ms
            );
        }
        if !is_valid_model_name(&self.primary_model) {
            bail!(
                "--primary-model must match [A-Za-z0-9._-]+, got {:?}",
                self.primary_model
            );
        }
        if let Some(alternate) = &self.alternate_model
            && !is_valid_model_name(alternate)
        {
            bail!("--alternate-model must match [A-Za-z0-9._-]+, got {alternate:?}");
        }
        Ok(self)
    }

    pub fn provider_url(&self) -> Result<Url, anyhow::Error> {
        Ok(Url::parse(&self.provider_url)?)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::builder()
            .base(Duration::from_millis(self.backoff_base_ms))
            .max_delay(Duration::from_millis(self.backoff_max_ms))
            .build()
    }

    pub fn cooldown_registry(&self) -> CooldownRegistry {
        CooldownRegistry::new(
            Duration::from_secs(self.default_cooldown_secs),
            Duration::from_secs(self.overload_cooldown_secs),
        )
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy::builder()
            .maybe_alternate_model(self.alternate_model.clone())
            .primary_attempts(self.max_attempts)
            .alternate_attempts(self.fallback_attempts)
            .build()
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_max,
            window: Duration::from_secs(self.rate_limit_window_secs),
        }
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings::builder()
            .maybe_redis_url(self.redis_url.clone())
            .probe_timeout(Duration::from_millis(self.queue_probe_timeout_ms))
            .key_prefix(self.queue_key_prefix.clone())
            .job_retention(self.job_retention())
            .worker(
                WorkerSettings::builder()
                    .concurrency(self.worker_concurrency)
                    .poll_interval(Duration::from_millis(self.worker_poll_interval_ms))
                    .build(),
            )
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("genqueue").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse(&[]).validate().unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.rate_limit(), RateLimitConfig::default());
        assert!(!config.trust_forwarded_for);
        assert_eq!(config.queue_settings().job_retention, crate::queue::JOB_RETENTION);

        let fallback = config.fallback_policy();
        assert_eq!(fallback.primary_attempts, 3);
        assert_eq!(fallback.alternate_attempts, 2);
    }

    #[rstest]
    #[case(&["--max-concurrent", "0"], "max-concurrent")]
    #[case(&["--max-attempts", "0"], "max-attempts")]
    #[case(&["--rate-limit-window-secs", "0"], "rate-limit-window-secs")]
    #[case(&["--provider-url", "not a url"], "Invalid provider URL")]
    #[case(&["--backoff-base-ms", "5000", "--backoff-max-ms", "100"], "backoff-max-ms")]
    #[case(&["--job-retention-secs", "0"], "job-retention-secs")]
    #[case(&["--primary-model", "models/../pro"], "primary-model")]
    #[case(&["--alternate-model", "pro?alt=sse"], "alternate-model")]
    fn test_invalid_values_are_rejected(#[case] args: &[&str], #[case] expected: &str) {
        let err = parse(args).validate().unwrap_err();
        assert!(err.to_string().contains(expected), "unexpected error: {err}");
    }

    #[test]
    fn test_queue_settings_carry_worker_options() {
        let config = parse(&[
            "--redis-url",
            "redis://127.0.0.1:6379",
            "--worker-concurrency",
            "4",
            "--queue-probe-timeout-ms",
            "250",
        ]);
        let settings = config.queue_settings();
        assert_eq!(settings.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(settings.probe_timeout, Duration::from_millis(250));
        assert_eq!(settings.worker.concurrency, 4);
    }

    #[test]
    fn test_trust_forwarded_for_is_opt_in() {
        let config = parse(&["--trust-forwarded-for"]).validate().unwrap();
        assert!(config.trust_forwarded_for);
    }

    #[test]
    fn test_debug_redacts_provider_key() {
        let config = parse(&["--provider-key", "secret-key"]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("<redacted>"));
    }
}
