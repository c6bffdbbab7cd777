// edge: Orchestrates the block's edge stack — adapter supervision, the
// store-and-forward buffer, the cloud bridge, heartbeats, and commands.

use clap::Parser;
use edge::bridge::{Bridge, MqttCloudPublisher};
use edge::commands::CommandHandler;
use edge::config;
use edge::storage::buffer::Buffer;
use mcs_proto::{command_response_topic, is_command_topic, CommandRequest};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(about = "MCS edge orchestrator")]
struct Args {
    /// Path to the edge YAML config.
    #[arg(long, default_value = "/etc/mcs/edge.yaml")]
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
    info!(version = env!("CARGO_PKG_VERSION"), "edge orchestrator starting");

    let cfg = match config::load_config_from_path(std::path::Path::new(&args.config)) {
        Ok(cfg) => {
            info!(site = %cfg.site_id, block = %cfg.block_id, edge = %cfg.edge_id, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let buffer = match Buffer::open(
        std::path::Path::new(&cfg.buffer.db_path),
        cfg.buffer.max_messages,
    ) {
        Ok(buffer) => {
            info!(depth = buffer.depth(), capacity = buffer.capacity(), "buffer opened");
            Arc::new(Mutex::new(buffer))
        }
        Err(e) => {
            eprintln!("FATAL: failed to open buffer: {}", e);
            std::process::exit(1);
        }
    };

    // ── Cloud client ──────────────────────────────────────────────────
    let cloud_connected = Arc::new(AtomicBool::new(false));
    let mut cloud_opts = MqttOptions::new(
        cfg.edge_id.clone(),
        cfg.cloud_mqtt.host.clone(),
        cfg.cloud_mqtt.port,
    );
    cloud_opts.set_keep_alive(Duration::from_secs(cfg.cloud_mqtt.keepalive_s));
    cloud_opts.set_clean_session(false); // persistent session for QoS 1
    if cfg.cloud_mqtt.tls {
        let ca = match std::fs::read(&cfg.cloud_mqtt.ca_cert) {
            Ok(ca) => ca,
            Err(e) => {
                eprintln!("FATAL: reading CA cert '{}': {}", cfg.cloud_mqtt.ca_cert, e);
                std::process::exit(1);
            }
        };
        let client_auth = match (
            std::fs::read(&cfg.cloud_mqtt.client_cert),
            std::fs::read(&cfg.cloud_mqtt.client_key),
        ) {
            (Ok(cert), Ok(key)) => Some((cert, key)),
            _ => {
                eprintln!("FATAL: reading client TLS material");
                std::process::exit(1);
            }
        };
        cloud_opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }
    let (cloud_client, mut cloud_event_loop) = AsyncClient::new(cloud_opts, 256);

    // ── Local client ──────────────────────────────────────────────────
    let mut local_opts = MqttOptions::new(
        format!("{}-intercept", cfg.edge_id),
        cfg.local_mqtt.host.clone(),
        cfg.local_mqtt.port,
    );
    local_opts.set_keep_alive(Duration::from_secs(60));
    let (local_client, mut local_event_loop) = AsyncClient::new(local_opts, 256);

    // ── Supervisor and bridge ─────────────────────────────────────────
    let supervisor = edge::supervisor::start(&cfg.adapters);
    let publisher = MqttCloudPublisher::new(
        cloud_client.clone(),
        cloud_connected.clone(),
        Duration::from_secs(cfg.cloud_mqtt.publish_timeout_s),
    );
    let bridge = Arc::new(Bridge::new(publisher, buffer.clone(), cloud_connected.clone()));
    let command_handler = Arc::new(CommandHandler::new(buffer.clone(), supervisor.clone()));

    // ── Cloud event loop: connectivity, commands ──────────────────────
    let command_topic_filter = mcs_proto::command_topic(&cfg.site_id, &cfg.block_id, "#");
    let response_topic = command_response_topic(&cfg.site_id, &cfg.block_id);
    {
        let cloud_client = cloud_client.clone();
        let cloud_connected = cloud_connected.clone();
        let command_handler = command_handler.clone();
        tokio::spawn(async move {
            loop {
                match cloud_event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("cloud broker connected");
                        cloud_connected.store(true, Ordering::SeqCst);
                        if let Err(e) = cloud_client
                            .subscribe(command_topic_filter.clone(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!(error = %e, "command subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic.ends_with("/command/response") {
                            continue; // our own responses echoed back
                        }
                        let request: CommandRequest = match serde_json::from_slice(&publish.payload)
                        {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "invalid command payload");
                                continue;
                            }
                        };
                        let response = command_handler.handle(&request).await;
                        match serde_json::to_vec(&response) {
                            Ok(bytes) => {
                                if let Err(e) = cloud_client
                                    .publish(
                                        response_topic.clone(),
                                        QoS::AtLeastOnce,
                                        false,
                                        bytes,
                                    )
                                    .await
                                {
                                    warn!(error = %e, "command response publish failed");
                                }
                            }
                            Err(e) => warn!(error = %e, "command response serialization failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if cloud_connected.swap(false, Ordering::SeqCst) {
                            warn!(error = %e, "cloud broker disconnected");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    // ── Local event loop: intercept adapter traffic ───────────────────
    {
        let local_client = local_client.clone();
        let bridge = bridge.clone();
        tokio::spawn(async move {
            loop {
                match local_event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("local broker connected, subscribing to microlink/#");
                        if let Err(e) =
                            local_client.subscribe("microlink/#", QoS::AtMostOnce).await
                        {
                            warn!(error = %e, "local subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if is_command_topic(&publish.topic) {
                            continue;
                        }
                        bridge
                            .route_local_message(
                                &publish.topic,
                                &publish.payload,
                                publish.qos as u8,
                                publish.retain,
                            )
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "local broker connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    // ── Replay and heartbeat loops ────────────────────────────────────
    let replay_task = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.run_replay_loop().await })
    };
    let heartbeat_task = {
        let bridge = bridge.clone();
        tokio::spawn(edge::heartbeat::run_heartbeat_loop(
            local_client.clone(),
            cfg.site_id.clone(),
            cfg.block_id.clone(),
            cfg.edge_id.clone(),
            cfg.heartbeat_interval_s,
            supervisor.clone(),
            buffer.clone(),
            cloud_connected.clone(),
            move || bridge.replay_active(),
        ))
    };

    info!("edge orchestrator running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    // Drain: stop intake loops, then make the buffer durable.
    replay_task.abort();
    heartbeat_task.abort();
    if let Err(e) = buffer.lock().expect("buffer lock poisoned").commit() {
        error!(error = %e, "final buffer commit failed");
    }
    info!(
        forwarded = bridge.stats.forwarded.load(Ordering::Relaxed),
        buffered = bridge.stats.buffered.load(Ordering::Relaxed),
        "edge orchestrator stopped"
    );
}
