// ingestor: Validates, routes, and persists telemetry; extracts alarm
// signals for the alarm engine.

use clap::Parser;
use ingestor::batch::BatchWriter;
use ingestor::cache::SensorCache;
use ingestor::config;
use ingestor::dead_letter::PgDeadLetterSink;
use ingestor::ingest::{Ingestor, RedisChannelPublisher};
use ingestor::metrics::IngestMetrics;
use ingestor::store::PgTelemetryStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "MCS cloud ingestion service")]
struct Args {
    /// Path to the ingestor YAML config.
    #[arg(long, default_value = "/etc/mcs/ingestor.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "ingestor starting");

    let cfg = match config::load_config_from_path(std::path::Path::new(&args.config)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let pool = match PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: database connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let redis_manager = match redis::Client::open(cfg.redis_url.clone()) {
        Ok(client) => match redis::aio::ConnectionManager::new(client).await {
            Ok(manager) => manager,
            Err(e) => {
                eprintln!("FATAL: redis connection failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("FATAL: bad redis URL: {}", e);
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(IngestMetrics::new());

    let cache = SensorCache::new(
        pool.clone(),
        Some(redis_manager.clone()),
        cfg.sensor_cache_ttl_s,
        metrics.clone(),
    );
    match cache.warm().await {
        Ok(count) => info!(sensors = count, "ready"),
        Err(e) => {
            eprintln!("FATAL: sensor cache warm-up failed: {}", e);
            std::process::exit(1);
        }
    }

    let store = PgTelemetryStore::new(
        pool.clone(),
        Duration::from_secs(cfg.batch.insert_timeout_s),
    );
    let writer = Arc::new(BatchWriter::new(store, cfg.batch, metrics.clone()));
    let dlq = PgDeadLetterSink::new(pool.clone(), metrics.clone());
    let channels = RedisChannelPublisher::new(redis_manager);

    let ingestor = Arc::new(Ingestor::new(
        cache,
        writer.clone(),
        dlq,
        channels,
        metrics.clone(),
    ));

    // Flusher, metrics reporter, consumer.
    let flusher = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.run_flush_loop().await })
    };
    let reporter = {
        let metrics = metrics.clone();
        tokio::spawn(async move { metrics.run_report_loop().await })
    };
    let consumer = {
        let ingestor = ingestor.clone();
        let mqtt = cfg.mqtt.clone();
        tokio::spawn(async move { ingestor.run_consume_loop(&mqtt).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    // Drain order: stop intake, then final flush.
    consumer.abort();
    flusher.abort();
    reporter.abort();
    writer.close_drain().await;
    info!("ingestor stopped");
}
