//! Pulse analytics worker.
//!
//! Consumes telemetry events from the Redis stream, maintains the windowed
//! aggregates and prunes them on a fixed interval until SIGINT or SIGTERM.
//!
//! # Running
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 cargo run -p pulse-worker
//! ```

mod config;

use config::Config;
use pulse_core::environment::SystemClock;
use pulse_redis::{RedisAggregateStore, RedisEventLog};
use pulse_runtime::metrics::{MetricsServer, PrometheusGaugeSink};
use pulse_runtime::{EventProcessor, Pruner, StreamConsumer, Worker};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_worker=info,pulse_runtime=info,pulse_redis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Pulse analytics worker");

    let config = Config::from_env();
    info!(
        redis_url = %config.redis.url,
        stream = %config.stream.key,
        group = %config.stream.group,
        consumer = %config.stream.consumer_name,
        "Configuration loaded"
    );

    let mut metrics_server = MetricsServer::new(config.metrics_addr()?);
    metrics_server.start()?;

    let clock = Arc::new(SystemClock);

    info!("Connecting to event log...");
    let mut log_builder = RedisEventLog::builder().url(&config.redis.url);
    if let Some(max_len) = config.stream.max_len {
        log_builder = log_builder.max_len(max_len);
    }
    let log = Arc::new(log_builder.build().await?);
    info!("Event log connected");

    // Separate connection so blocking reads never delay aggregate writes.
    info!("Connecting to aggregate store...");
    let store = Arc::new(RedisAggregateStore::new(&config.redis.url).await?);
    info!("Aggregate store connected");

    let windows = config.window_config();
    let processor = EventProcessor::new(store.clone())
        .with_windows(windows)
        .with_score_update(config.score_update);
    let consumer = StreamConsumer::new(log, processor, config.consumer_config(), clock.clone());
    let pruner = Pruner::new(store, clock, Arc::new(PrometheusGaugeSink))
        .with_windows(windows)
        .with_config(config.pruner_config());

    let report = Worker::new(consumer, pruner)
        .with_shutdown_timeout(config.shutdown_timeout())
        .run(shutdown_signal())
        .await;

    if report.is_clean() {
        info!("Shutdown complete");
    } else {
        warn!(?report, "Shutdown completed with errors");
    }

    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
