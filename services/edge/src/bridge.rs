//! Cloud bridge: forwards local broker traffic to the cloud broker and
//! falls back to the store-and-forward buffer while the link is down.
//!
//! The bridge owns two broker clients: a local subscriber at `microlink/#`
//! (command topics excluded) and a cloud publisher that also subscribes to
//! `command/#` on the cloud side.  A 10-second evaluation loop starts a
//! replay whenever the link is up, the buffer is non-empty, and no replay
//! is already running.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::replay::{replay_buffer, CloudPublishError, CloudPublisher};
use crate::storage::buffer::Buffer;

/// How often the bridge evaluates whether to start a replay.
pub const REPLAY_EVAL_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Cloud publisher over rumqttc
// ---------------------------------------------------------------------------

/// Cloud publisher backed by a rumqttc client.
///
/// The client runs with a persistent session; a publish accepted while the
/// link is up is retransmitted by the client on reconnect, so acceptance
/// is the ack boundary the replay engine deletes against.
pub struct MqttCloudPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    timeout: Duration,
}

impl MqttCloudPublisher {
    pub fn new(client: AsyncClient, connected: Arc<AtomicBool>, timeout: Duration) -> Self {
        MqttCloudPublisher {
            client,
            connected,
            timeout,
        }
    }
}

#[async_trait]
impl CloudPublisher for MqttCloudPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), CloudPublishError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CloudPublishError("cloud link down".to_owned()));
        }
        let qos = match qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        tokio::time::timeout(
            self.timeout,
            self.client.publish(topic, qos, retain, payload.to_vec()),
        )
        .await
        .map_err(|_| CloudPublishError("publish timed out".to_owned()))?
        .map_err(|e| CloudPublishError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Counters exposed through the heartbeat and logs.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub forwarded: AtomicU64,
    pub buffered: AtomicU64,
}

/// Routing core of the bridge.  Transport loops feed it local messages;
/// it forwards or buffers each one.
pub struct Bridge<P: CloudPublisher> {
    cloud: P,
    buffer: Arc<Mutex<Buffer>>,
    cloud_connected: Arc<AtomicBool>,
    replay_active: Arc<AtomicBool>,
    pub stats: BridgeStats,
}

impl<P: CloudPublisher> Bridge<P> {
    pub fn new(
        cloud: P,
        buffer: Arc<Mutex<Buffer>>,
        cloud_connected: Arc<AtomicBool>,
    ) -> Self {
        Bridge {
            cloud,
            buffer,
            cloud_connected,
            replay_active: Arc::new(AtomicBool::new(false)),
            stats: BridgeStats::default(),
        }
    }

    pub fn cloud_connected(&self) -> bool {
        self.cloud_connected.load(Ordering::SeqCst)
    }

    pub fn replay_active(&self) -> bool {
        self.replay_active.load(Ordering::SeqCst)
    }

    pub fn buffer(&self) -> &Arc<Mutex<Buffer>> {
        &self.buffer
    }

    /// Route one message from the local broker: forward to the cloud with
    /// the same topic, qos, and retained flag, or buffer it.
    ///
    /// Command topics flow cloud→edge and are never forwarded back up.
    pub async fn route_local_message(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) {
        if mcs_proto::is_command_topic(topic) {
            return;
        }

        if self.cloud_connected() {
            match self.cloud.publish(topic, payload, qos, retain).await {
                Ok(()) => {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    // Transient publish failure falls back to buffering.
                    debug!(error = %e, %topic, "cloud publish failed, buffering");
                }
            }
        }

        let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
        match buffer.append(topic, payload, qos, retain) {
            Ok(()) => {
                self.stats.buffered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, %topic, "buffer append failed, message lost"),
        }
    }

    /// One pass of the replay evaluation: start a replay if the link is up,
    /// there is backlog, and no replay is already in flight.
    pub async fn evaluate_replay(&self) {
        if !self.cloud_connected() {
            return;
        }
        let depth = self.buffer.lock().expect("buffer lock poisoned").depth();
        if depth == 0 {
            return;
        }
        // Process-wide guard: two replays must never run at once.
        if self
            .replay_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let connected = self.cloud_connected.clone();
        let outcome = replay_buffer(&self.buffer, &self.cloud, move || {
            connected.load(Ordering::SeqCst)
        })
        .await;
        self.replay_active.store(false, Ordering::SeqCst);

        if outcome.aborted {
            info!(
                replayed = outcome.replayed,
                remaining = outcome.remaining,
                "replay abandoned, backlog remains queued"
            );
        }
    }

    /// Run the periodic replay evaluation until cancelled.
    pub async fn run_replay_loop(&self) {
        loop {
            tokio::time::sleep(REPLAY_EVAL_INTERVAL).await;
            self.evaluate_replay().await;
        }
    }
}
