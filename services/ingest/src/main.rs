//! TCP Ingest Service for the open sensor platform
//!
//! Accepts tick batches from field controllers and stores them in Redis.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/ingest, /etc/osp/ingest)
//! 2. Environment variables (prefixed with INGEST__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use backoff::{backoff::Backoff, ExponentialBackoff};
use osp_ingest::config::{IngestConfig, RetryConfig, ServiceConfig};
use osp_ingest::{listener, AssociationResolver, IngestListener, IngestPipeline};
use osp_storage::config::RedisConfig;
use osp_storage::{DirectoryStore, KvStore, OpLog, ReadingStore, RedisStore, TimeSeriesStore};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = IngestConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.service)?;

    info!(
        service = "osp-ingest",
        version = env!("CARGO_PKG_VERSION"),
        "Starting TCP ingest service"
    );

    // Validate configuration
    config.validate()?;
    let zone = config.decode.record_zone()?;

    init_metrics(config.service.metrics_port)?;

    let store: Arc<dyn KvStore> = Arc::new(connect_with_retry(&config.redis, &config.retry).await?);

    let timeseries = TimeSeriesStore::new(store.clone());
    // Controller links are only rendered by the query API
    let directory = DirectoryStore::new(store.clone(), timeseries.clone(), "");
    let resolver = AssociationResolver::new(directory, config.association.default_controller_id.clone());
    let pipeline = IngestPipeline::new(
        timeseries,
        resolver,
        ReadingStore::new(store.clone()),
        zone,
    );
    let oplog = OpLog::new(store, config.oplog.capacity);

    let socket = listener::bind(&config.listener)
        .await
        .with_context(|| {
            format!(
                "Failed to bind {}:{}",
                config.listener.host, config.listener.port
            )
        })?;

    let ingest = IngestListener::new(pipeline, oplog, &config.listener);
    let accept_handle = tokio::spawn({
        let ingest = ingest.clone();
        async move { ingest.run(socket).await }
    });

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    accept_handle.abort();

    let stats = ingest.stats();
    info!(
        connections_accepted = stats.connections_accepted,
        connections_discarded = stats.connections_discarded,
        bytes_received = stats.bytes_received,
        batches_processed = stats.batches_processed,
        batches_failed = stats.batches_failed,
        ticks_processed = stats.ticks_processed,
        "Final listener stats"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &ServiceConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Connect to Redis with exponential backoff retry.
async fn connect_with_retry(
    redis: &RedisConfig,
    retry: &RetryConfig,
) -> anyhow::Result<RedisStore> {
    let mut backoff = ExponentialBackoff {
        initial_interval: retry.base_delay(),
        max_interval: retry.max_delay(),
        max_elapsed_time: None,
        ..Default::default()
    };

    let mut attempts = 0u32;

    loop {
        match RedisStore::connect(redis).await {
            Ok(store) => {
                info!(attempts = attempts, "Connected to store");
                return Ok(store);
            }
            Err(e) => {
                attempts += 1;

                if retry.max_connect_attempts > 0 && attempts >= retry.max_connect_attempts {
                    error!(attempts = attempts, error = %e, "Giving up on store connection");
                    return Err(e).context("Failed to connect to Redis");
                }

                if let Some(delay) = backoff.next_backoff() {
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    backoff.reset();
                }
            }
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
