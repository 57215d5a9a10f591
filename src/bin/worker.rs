//! `mailbridge-worker`: consumes the main stream as part of a consumer
//! group, plus a `dlq` subcommand for operator-facing DLQ inspection.
//!
//! Wiring only — mirrors `producer.rs`'s shape: parse CLI/env, load config,
//! init logging, build the pipeline, run until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::error;

use mailbridge::api::{self, health::HealthState, AppMetrics};
use mailbridge::core::cli::{DlqAction, WorkerCli, WorkerCommand};
use mailbridge::core::config::AppConfig;
use mailbridge::core::logging::init_logging;
use mailbridge::core::shutdown::ShutdownService;
use mailbridge::data::stream::{redis::RedisStreamStore, StreamStore};
use mailbridge::domain::breaker::CircuitBreakers;
use mailbridge::domain::idempotency::RedisIdempotencyFilter;
use mailbridge::domain::retry::RetryController;
use mailbridge::worker::dlq::DlqManager;
use mailbridge::worker::processor::NoopProcessor;
use mailbridge::worker::recovery::ConnectionWatchdog;
use mailbridge::worker::ConsumerPipeline;

fn build_idempotency_pool(config: &AppConfig) -> anyhow::Result<deadpool_redis::Pool> {
    let cfg = deadpool_redis::Config::from_url(config.stream_store.redis_url());
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("building idempotency redis pool")
}

async fn run_dlq_command(config: &AppConfig, store: Arc<dyn StreamStore>, action: DlqAction) -> anyhow::Result<()> {
    let dlq = DlqManager::new(
        store,
        config.stream_store.dlq_stream_name.clone(),
        config.stream_store.dlq_stream_maxlen,
    );

    match action {
        DlqAction::Peek { count } => {
            let entries = dlq.peek(count).await?;
            for entry in entries {
                println!("{} {:?}", entry.entry_id, entry.fields);
            }
        }
        DlqAction::Remove { entry_id } => {
            let removed = dlq.remove(&entry_id).await?;
            println!("removed {removed} entr{}", if removed == 1 { "y" } else { "ies" });
        }
        DlqAction::Reprocess { entry_id, target_stream } => {
            let target = target_stream.unwrap_or_else(|| config.stream_store.main_stream_name.clone());
            let new_id = dlq.reprocess(&entry_id, &target).await?;
            println!("reprocessed {entry_id} -> {target}:{new_id}");
        }
        DlqAction::Len => {
            println!("{}", dlq.len().await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = WorkerCli::parse_args();
    let config = AppConfig::load(cli.config_file.as_deref())?;
    init_logging(config.logging.json);

    let store: Arc<dyn StreamStore> = Arc::new(RedisStreamStore::new(&config.stream_store.redis_url())?);

    if let Some(WorkerCommand::Dlq { action }) = cli.command {
        return run_dlq_command(&config, store, action).await;
    }

    let idempotency_pool = build_idempotency_pool(&config)?;
    let idempotency_pool_for_close = idempotency_pool.clone();
    let idempotency = Arc::new(RedisIdempotencyFilter::new(
        idempotency_pool,
        mailbridge::core::constants::DEFAULT_IDEMPOTENCY_KEY,
        config.idempotency.ttl_seconds,
    ));
    let retry = Arc::new(RetryController::new(
        Duration::from_secs(config.retry.initial_backoff_seconds),
        Duration::from_secs(config.retry.max_backoff_seconds),
        mailbridge::core::constants::DEFAULT_BACKOFF_MULTIPLIER,
        config.retry.max_retry_attempts,
    ));

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
        shutdown.register(35, "close-idempotency-pool", move || {
            let pool = idempotency_pool_for_close.clone();
            async move { pool.close(); }
        });
    }

    let stream = cli.stream.clone().unwrap_or_else(|| config.stream_store.main_stream_name.clone());
    let group = cli.group.clone().unwrap_or_else(|| config.worker.consumer_group.clone());
    let consumer = cli.consumer.clone().unwrap_or_else(|| config.worker.consumer_name.clone());
    let batch_size = cli.batch_size.unwrap_or(config.worker.batch_size);
    let block_timeout_ms = cli.block_timeout.unwrap_or(config.worker.block_timeout_ms);

    let pipeline = ConsumerPipeline::new(
        config,
        stream,
        group,
        consumer,
        batch_size,
        block_timeout_ms,
        Arc::clone(&store),
        idempotency,
        retry,
        Arc::new(NoopProcessor),
        breakers,
        Arc::clone(&shutdown),
        metrics,
    );

    pipeline.initialize().await?;
    pipeline.run().await;
    shutdown.initiate().await;
    Ok(())
}
