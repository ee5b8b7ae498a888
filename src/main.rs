use clap::Parser as _;
use genqueue::{
    AppState,
    admission::AdmissionGate,
    build_metrics_layer_and_handle, build_metrics_router, build_router,
    client::create_hyper_client,
    config::Config,
    executor::RetryExecutor,
    fallback::ModelFallbackRouter,
    provider::GeminiProvider,
    queue::{self, QueueSettings},
    rate_limit::RateLimiter,
    traits::{CreditGate, NoOpCreditGate},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How often finished in-memory jobs are checked against their retention.
const JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting genqueue with config: {:?}", config);

    if config.provider_key.is_none() {
        warn!("No provider API key configured, every generation will fail");
    }

    let http_client = create_hyper_client(
        Duration::from_secs(config.pool_idle_timeout_secs),
        config.pool_max_idle_per_host,
    );
    let provider = GeminiProvider::new(
        http_client,
        config.provider_url()?,
        config.provider_key.clone(),
    );

    let executor = RetryExecutor::new(
        Arc::new(provider),
        Arc::new(config.cooldown_registry()),
        Arc::new(AdmissionGate::new(config.max_concurrent)),
        config.backoff_policy(),
    );
    let router = Arc::new(ModelFallbackRouter::new(executor, config.fallback_policy()));

    let credit_gate: Arc<dyn CreditGate> = Arc::new(NoOpCreditGate);

    let queue_settings = QueueSettings {
        credit_gate: Arc::clone(&credit_gate),
        ..config.queue_settings()
    };
    let job_queue = queue::connect(&queue_settings, Arc::clone(&router)).await;
    info!(backend = job_queue.backend(), "Job queue ready");
    {
        let job_queue = Arc::clone(&job_queue);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JOB_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = job_queue.evict_expired();
                debug!(removed, "Finished job sweep");
            }
        });
    }

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit()));
    {
        let rate_limiter = Arc::clone(&rate_limiter);
        let period = rate_limiter.config().window;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let removed = rate_limiter.prune();
                debug!(removed, "Rate window sweep");
            }
        });
    }

    let app_state = AppState::builder()
        .router(router)
        .queue(job_queue)
        .rate_limiter(rate_limiter)
        .credit_gate(credit_gate)
        .default_model(config.primary_model.clone())
        .trust_forwarded_for(config.trust_forwarded_for)
        .build();

    let mut serves = JoinSet::new();

    let prometheus_layer = if config.metrics {
        let (prometheus_layer, prometheus_handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        let metrics_router = build_metrics_router(prometheus_handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        serves.spawn(axum::serve(listener, metrics_router).into_future());
        info!("Metrics endpoint enabled on {}", bind_addr);
        Some(prometheus_layer)
    } else {
        info!("Metrics endpoint disabled");
        None
    };

    let mut app = build_router(app_state);
    if let Some(prometheus_layer) = prometheus_layer {
        app = app.layer(prometheus_layer);
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    serves.spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .into_future(),
    );
    info!("genqueue listening on {}", bind_addr);

    if let Some(result) = serves.join_next().await {
        result?.map_err(anyhow::Error::from)
    } else {
        error!("No server tasks were spawned");
        Err(anyhow::anyhow!("No server tasks were spawned"))
    }
}
