//! Edge heartbeat.
//!
//! Every 30 seconds the orchestrator publishes a retained heartbeat to
//! `microlink/{site}/{block}/edge/heartbeat`: adapter status snapshots,
//! buffer depth and oldest timestamp, cloud connectivity, and host health.

use mcs_proto::{heartbeat_topic, BufferStats, HeartbeatPayload, SystemHealth};
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, System};
use tracing::{info, warn};

use crate::storage::buffer::Buffer;
use crate::supervisor::SupervisorHandle;

// ---------------------------------------------------------------------------
// Host sampling
// ---------------------------------------------------------------------------

/// Samples cpu/mem/disk/temperature through sysinfo.
pub struct HostSampler {
    system: System,
    disks: Disks,
    components: Components,
}

impl HostSampler {
    pub fn new() -> Self {
        HostSampler {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> SystemHealth {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);
        self.components.refresh(true);

        let cpu_pct = self.system.global_cpu_usage();
        let mem_pct = if self.system.total_memory() > 0 {
            self.system.used_memory() as f32 / self.system.total_memory() as f32 * 100.0
        } else {
            0.0
        };

        let disk_pct = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.list().first())
            .map(|d| {
                let total = d.total_space();
                if total > 0 {
                    (total - d.available_space()) as f32 / total as f32 * 100.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let temp_c = self
            .components
            .list()
            .iter()
            .filter_map(|c| c.temperature())
            .fold(0.0_f32, f32::max);

        SystemHealth {
            cpu_pct: round1(cpu_pct),
            mem_pct: round1(mem_pct),
            disk_pct: round1(disk_pct),
            temp_c: round1(temp_c),
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Heartbeat builder and loop
// ---------------------------------------------------------------------------

/// Assemble one heartbeat payload from the live parts.
pub fn build_heartbeat(
    edge_id: &str,
    started: Instant,
    supervisor: &SupervisorHandle,
    buffer: &Mutex<Buffer>,
    cloud_connected: bool,
    replay_active: bool,
    system: SystemHealth,
) -> HeartbeatPayload {
    let (depth, capacity, oldest_ts) = {
        let mut buffer = buffer.lock().expect("buffer lock poisoned");
        let oldest = buffer.oldest_ts().unwrap_or(None);
        (buffer.depth(), buffer.capacity(), oldest)
    };

    HeartbeatPayload {
        ts: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        edge_id: edge_id.to_owned(),
        uptime_s: started.elapsed().as_secs(),
        adapters: supervisor.statuses(),
        buffer: BufferStats {
            depth,
            capacity,
            oldest_ts,
            cloud_connected,
            replay_active,
        },
        system,
    }
}

/// Publish heartbeats at the configured interval until cancelled.
#[allow(clippy::too_many_arguments)]
pub async fn run_heartbeat_loop(
    client: AsyncClient,
    site_id: String,
    block_id: String,
    edge_id: String,
    interval_s: u64,
    supervisor: SupervisorHandle,
    buffer: Arc<Mutex<Buffer>>,
    cloud_connected: Arc<AtomicBool>,
    replay_active: impl Fn() -> bool,
) {
    let topic = heartbeat_topic(&site_id, &block_id);
    let started = Instant::now();
    let mut sampler = HostSampler::new();
    info!(interval_s, %topic, "heartbeat publisher started");

    loop {
        let system = sampler.sample();
        let payload = build_heartbeat(
            &edge_id,
            started,
            &supervisor,
            &buffer,
            cloud_connected.load(Ordering::SeqCst),
            replay_active(),
            system,
        );

        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(e) = client
                    .publish(topic.clone(), QoS::AtLeastOnce, true, bytes)
                    .await
                {
                    warn!(error = %e, "heartbeat publish failed");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat serialization failed"),
        }

        tokio::time::sleep(Duration::from_secs(interval_s)).await;
    }
}
