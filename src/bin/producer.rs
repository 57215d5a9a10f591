//! `mailbridge-producer`: tails one IMAP mailbox into the main stream.
//!
//! Wiring only — constructs the concrete adapters, threads them into
//! `ProducerPipeline::run`, and exposes the shared health/metrics surface.
//! Mirrors the teacher's binary entry points: parse CLI/env, load config,
//! init logging, build the pipeline, run until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{error, info};

use mailbridge::api::{self, health::HealthState, AppMetrics};
use mailbridge::core::cli::ProducerCli;
use mailbridge::core::config::AppConfig;
use mailbridge::core::constants::{
    DEFAULT_TOKEN_FILE, ENV_OAUTH_CLIENT_ID, ENV_OAUTH_CLIENT_SECRET, ENV_TOKEN_FILE,
};
use mailbridge::core::logging::init_logging;
use mailbridge::core::shutdown::ShutdownService;
use mailbridge::data::state::RedisMailboxStateStore;
use mailbridge::data::stream::{redis::RedisStreamStore, StreamStore};
use mailbridge::domain::breaker::CircuitBreakers;
use mailbridge::producer::oauth::OAuth2Manager;
use mailbridge::producer::ProducerPipeline;
use mailbridge::worker::recovery::ConnectionWatchdog;

fn build_state_pool(config: &AppConfig) -> anyhow::Result<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config::from_url(config.stream_store.redis_url());
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("building mailbox state redis pool")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ProducerCli::parse_args();

    let config = AppConfig::load(cli.config_file.as_deref())?;
    init_logging(config.logging.json);

    let username = match &cli.username {
        Some(u) => u.clone(),
        None => bail!("--username (or MAILBRIDGE_IMAP_USER) is required"),
    };

    let client_id = std::env::var(ENV_OAUTH_CLIENT_ID).context("MAILBRIDGE_OAUTH_CLIENT_ID not set")?;
    let client_secret =
        std::env::var(ENV_OAUTH_CLIENT_SECRET).context("MAILBRIDGE_OAUTH_CLIENT_SECRET not set")?;
    let token_file: PathBuf = std::env::var(ENV_TOKEN_FILE)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_TOKEN_FILE));

    let oauth = Arc::new(OAuth2Manager::new(cli.provider, client_id, client_secret, token_file)?);

    if cli.auth_setup {
        match oauth.authenticate(true).await {
            Ok(_) => {
                info!(token_file = %oauth.token_file().display(), "authorization complete, token cached");
                return Ok(());
            }
            Err(e) => {
                error!(error = %e, "authorization setup failed");
                return Err(e);
            }
        }
    }

    let store: Arc<dyn StreamStore> = Arc::new(RedisStreamStore::new(&config.stream_store.redis_url())?);
    let state_pool = build_state_pool(&config)?;
    let state_pool_for_close = state_pool.clone();
    let state_store = Arc::new(RedisMailboxStateStore::new(state_pool));
    let breakers = CircuitBreakers::new();
    let metrics = AppMetrics::new();
    let shutdown = ShutdownService::new(Duration::from_secs(30));
    shutdown.install_signal_handlers();

    let watchdog = Arc::new(ConnectionWatchdog::new(
        Arc::clone(&breakers),
        Duration::from_secs(config.recovery.check_interval_seconds),
        config.circuit_breaker.failure_threshold,
    ));
    {
        let store_for_check = Arc::clone(&store);
        watchdog.add_check("stream_store", move || {
            let store = Arc::clone(&store_for_check);
            async move { store.health_check().await.is_ok() }
        });
    }

    let health_state = HealthState {
        metrics: Arc::clone(&metrics),
        breakers: Arc::clone(&breakers),
        watchdog: Some(Arc::clone(&watchdog)),
    };
    let health_port = config.health.health_port;
    let health_handle = tokio::spawn(async move {
        let router = api::router(health_state);
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", health_port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to bind health server");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "health server stopped unexpectedly");
        }
    });
    shutdown.register_abort(5, "stop-health-endpoint", health_handle);

    let metrics_port = config.health.metrics_port;
    let metrics_for_server = Arc::clone(&metrics);
    let metrics_handle = tokio::spawn(async move {
        let router = api::metrics_router(metrics_for_server);
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", metrics_port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to bind metrics server");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "metrics server stopped unexpectedly");
        }
    });
    shutdown.register_abort(5, "stop-metrics-endpoint", metrics_handle);

    let running_flag = {
        let shutdown = Arc::clone(&shutdown);
        Arc::new(move || shutdown.is_running())
    };
    let watchdog_handle = Arc::clone(&watchdog).spawn(running_flag);
    shutdown.register_abort(15, "stop-watchdog", watchdog_handle);

    {
        let store_for_close = Arc::clone(&store);
        shutdown.register(30, "close-stream-store", move || {
            let store = Arc::clone(&store_for_close);
            async move { store.close().await; }
        });
    }
    {
        shutdown.register(35, "close-state-pool", move || {
            let pool = state_pool_for_close.clone();
            async move { pool.close(); }
        });
    }

    let mailbox = cli.mailbox.clone();
    let batch_size = cli.batch_size;
    let poll_interval = Duration::from_secs(cli.poll_interval.unwrap_or(config.imap.poll_interval_seconds));
    let dry_run = cli.dry_run;

    let mut pipeline = ProducerPipeline::new(
        config,
        username,
        cli.provider,
        store,
        state_store,
        oauth,
        breakers,
        Arc::clone(&shutdown),
        metrics,
    );

    pipeline.run(mailbox, batch_size, poll_interval, dry_run).await;
    shutdown.initiate().await;
    Ok(())
}
