// adapters: Reads field devices and publishes normalized telemetry and
// alarm edge events to the local broker.

use adapters::config::{self, PollGroup, Protocol};
use adapters::poll::{run_poll_group, DeviceRunner};
use adapters::publish::{AdapterPublisher, MqttBrokerPublisher};
use clap::Parser;
use rumqttc::{AsyncClient, MqttOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(about = "MCS protocol adapter process")]
struct Args {
    /// Path to the adapter YAML config.
    #[arg(long, default_value = "/etc/mcs/adapters.yaml")]
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

    info!(version = env!("CARGO_PKG_VERSION"), "adapters starting");

    let cfg = match config::load_config_from_path(std::path::Path::new(&args.config)) {
        Ok(cfg) => {
            info!(
                site = %cfg.site_id,
                block = %cfg.block_id,
                devices = cfg.devices.len(),
                points = cfg.devices.iter().map(|d| d.points.len()).sum::<usize>(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Local broker client; the event loop task owns reconnection.
    let mut mqtt_opts = MqttOptions::new(
        cfg.mqtt.client_id.clone(),
        cfg.mqtt.host.clone(),
        cfg.mqtt.port,
    );
    mqtt_opts.set_keep_alive(Duration::from_secs(cfg.mqtt.keepalive_s));
    let (client, mut event_loop) = AsyncClient::new(mqtt_opts, 64);
    tokio::spawn(async move {
        loop {
            match event_loop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "local broker connection error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let publisher = Arc::new(AdapterPublisher::new(
        MqttBrokerPublisher::new(client),
        &cfg.site_id,
        &cfg.block_id,
    ));

    let mut runners: Vec<Arc<Mutex<DeviceRunner>>> = Vec::new();
    for device in &cfg.devices {
        let reader: Box<dyn adapters::reader::PointReader> = match device.protocol {
            Protocol::ModbusTcp => Box::new(adapters::modbus::ModbusReader::new(device.clone())),
            Protocol::Snmp => Box::new(adapters::snmp::SnmpReader::new(device.clone())),
            Protocol::Bacnet => Box::new(adapters::bacnet::BacnetReader::new(device.clone())),
        };
        runners.push(Arc::new(Mutex::new(DeviceRunner::new(
            reader,
            device.points.clone(),
        ))));
    }

    // One shared monotonic epoch so debounce timers agree across groups.
    let epoch = Instant::now();
    let mut tasks = Vec::new();
    for group in PollGroup::ALL {
        let group_runners: Vec<_> = {
            let mut v = Vec::new();
            for runner in &runners {
                if runner.lock().await.has_points_in(group) {
                    v.push(runner.clone());
                }
            }
            v
        };
        if group_runners.is_empty() {
            continue;
        }
        let interval_ms = cfg.poll_groups.interval_ms(group);
        tasks.push(tokio::spawn(run_poll_group(
            group,
            interval_ms,
            group_runners,
            publisher.clone(),
            epoch,
        )));
    }

    if tasks.is_empty() {
        error!("no poll groups have points; nothing to do");
        std::process::exit(1);
    }
    info!(groups = tasks.len(), "polling started");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    for task in &tasks {
        task.abort();
    }
    for runner in &runners {
        runner.lock().await.close().await;
    }
    info!(
        published = publisher.published_count(),
        errors = publisher.error_count(),
        "adapters stopped"
    );
}
