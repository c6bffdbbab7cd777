// alarm-engine: Consumes alarm signals and manages the ISA-18.2
// lifecycle for every sensor in the site.

use alarm_engine::cascade::default_rules;
use alarm_engine::config;
use alarm_engine::engine::AlarmEngine;
use alarm_engine::fanout::RedisEventPublisher;
use alarm_engine::persistence::PgAlarmStore;
use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use mcs_proto::{AlarmSignal, ALARMS_INBOUND_CHANNEL};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(about = "MCS alarm engine")]
struct Args {
    /// Path to the engine YAML config.
    #[arg(long, default_value = "/etc/mcs/alarm-engine.yaml")]
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
    info!(version = env!("CARGO_PKG_VERSION"), "alarm engine starting");

    let cfg = match config::load_config_from_path(std::path::Path::new(&args.config)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let database_url = match &cfg.database_url {
        Some(url) => url.clone(),
        None => {
            eprintln!("FATAL: database_url is required");
            std::process::exit(1);
        }
    };
    let pool = match PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: database connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let redis_client = match redis::Client::open(cfg.redis_url.clone()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("FATAL: bad redis URL: {}", e);
            std::process::exit(1);
        }
    };
    let publisher_conn = match redis::aio::ConnectionManager::new(redis_client.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("FATAL: redis connection failed: {}", e);
            std::process::exit(1);
        }
    };

    let engine = Arc::new(
        match AlarmEngine::new(
            cfg.clone(),
            PgAlarmStore::new(pool),
            RedisEventPublisher::new(publisher_conn),
            default_rules(),
        ) {
            Ok(engine) => engine,
            Err(e) => {
                eprintln!("FATAL: cascade rule compile failed: {}", e);
                std::process::exit(1);
            }
        },
    );

    if let Err(e) = engine.load_state().await {
        eprintln!("FATAL: loading boot state failed: {}", e);
        std::process::exit(1);
    }

    // Background sweeps.
    let mut tasks = Vec::new();
    for task in [
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_shelve_monitor().await }
        }),
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_stale_sweep().await }
        }),
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_threshold_refresh().await }
        }),
        tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_stats_loop().await }
        }),
    ] {
        tasks.push(task);
    }

    // Inbound subscription with reconnect.
    let subscriber = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let epoch = Instant::now();
            loop {
                let mut pubsub = match redis_client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!(error = %e, "redis subscribe connection failed, retrying in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(ALARMS_INBOUND_CHANNEL).await {
                    warn!(error = %e, "channel subscribe failed, retrying in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
                info!(channel = ALARMS_INBOUND_CHANNEL, "subscribed to inbound signals");

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "unreadable channel message");
                            continue;
                        }
                    };
                    match serde_json::from_str::<AlarmSignal>(&payload) {
                        Ok(signal) => {
                            engine
                                .process_signal(
                                    &signal,
                                    Utc::now(),
                                    epoch.elapsed().as_secs_f64(),
                                )
                                .await;
                        }
                        Err(e) => warn!(error = %e, "malformed alarm signal"),
                    }
                }
                warn!("inbound subscription lost, reconnecting");
            }
        })
    };
    tasks.push(subscriber);

    info!("alarm engine running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    // Final state persist happens on every transition; just stop intake.
    for task in &tasks {
        task.abort();
    }
    let stats = engine.stats().await;
    info!(
        signals = stats.signals_processed,
        raised = stats.alarms_raised,
        cleared = stats.alarms_cleared,
        "alarm engine stopped"
    );
}
