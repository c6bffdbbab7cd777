// mcs-test-utils: Shared recording fakes for the MCS integration suites.
//
// Every component takes its collaborators through traits; these are the
// in-memory implementations the end-to-end scenarios inject in place of
// brokers, redis, and the database.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use alarm_engine::fanout::{EventPublisher, PublishError};
use alarm_engine::persistence::{AlarmStore, StoreError as AlarmStoreError};
use alarm_engine::state::AlarmInstance;
use edge::replay::{CloudPublishError, CloudPublisher};
use ingestor::batch::{StoreError, TelemetryRow, TelemetryStore};
use ingestor::cache::{ResolveError, SensorResolver};
use ingestor::dead_letter::DeadLetterSink;
use ingestor::ingest::{ChannelError, ChannelPublisher};
use mcs_proto::{AlarmEventOut, AlarmSignal, Priority};

// ---------------------------------------------------------------------------
// Edge side
// ---------------------------------------------------------------------------

/// A cloud broker that records every acknowledged publish and can be
/// switched off to simulate a link drop.
#[derive(Default)]
pub struct RecordingCloud {
    pub up: AtomicBool,
    pub published: Mutex<Vec<(String, Vec<u8>, u8, bool)>>,
}

impl RecordingCloud {
    pub fn up() -> Self {
        let cloud = Self::default();
        cloud.up.store(true, Ordering::SeqCst);
        cloud
    }

    pub fn down() -> Self {
        Self::default()
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, ..)| t.clone())
            .collect()
    }
}

#[async_trait]
impl CloudPublisher for RecordingCloud {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), CloudPublishError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(CloudPublishError("link down".to_owned()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_owned(), payload.to_vec(), qos, retain));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ingestion side
// ---------------------------------------------------------------------------

/// Telemetry store backed by a vector.
#[derive(Default)]
pub struct MemTelemetryStore {
    pub rows: Mutex<Vec<TelemetryRow>>,
    pub failing: AtomicBool,
}

#[async_trait]
impl TelemetryStore for MemTelemetryStore {
    async fn insert_rows(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError("simulated db failure".to_owned()));
        }
        self.rows.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }
}

/// Resolver backed by a static `(site/block/subsystem/tag) → id` map.
#[derive(Default)]
pub struct MapResolver {
    sensors: std::collections::HashMap<String, i64>,
}

impl MapResolver {
    pub fn with(entries: &[(&str, i64)]) -> Self {
        MapResolver {
            sensors: entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), *v))
                .collect(),
        }
    }
}

#[async_trait]
impl SensorResolver for MapResolver {
    async fn resolve(
        &self,
        site: &str,
        block: &str,
        subsystem: &str,
        tag: &str,
    ) -> Result<Option<i64>, ResolveError> {
        Ok(self
            .sensors
            .get(&format!("{}/{}/{}/{}", site, block, subsystem, tag))
            .copied())
    }
}

/// DLQ that records rows instead of writing them.
#[derive(Default)]
pub struct MemDeadLetters {
    pub rows: Mutex<Vec<DeadLetterRow>>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterRow {
    pub topic: String,
    pub payload: String,
    pub category: &'static str,
    pub message: String,
}

#[async_trait]
impl DeadLetterSink for MemDeadLetters {
    async fn record(&self, topic: &str, payload: &str, category: &'static str, message: String) {
        self.rows.lock().unwrap().push(DeadLetterRow {
            topic: topic.to_owned(),
            payload: payload.to_owned(),
            category,
            message,
        });
    }
}

/// Pub/sub channel that records every message.
#[derive(Default)]
pub struct MemChannels {
    pub published: Mutex<Vec<(String, String)>>,
}

impl MemChannels {
    /// Messages published to one channel.
    pub fn on_channel(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl ChannelPublisher for MemChannels {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), ChannelError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_owned(), payload));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Alarm engine side
// ---------------------------------------------------------------------------

/// Alarm store recording saves and audit events; boot state is settable.
#[derive(Default)]
pub struct MemAlarmStore {
    pub saved: Mutex<Vec<AlarmInstance>>,
    pub events: Mutex<Vec<AuditEvent>>,
    pub boot_alarms: Mutex<Vec<AlarmInstance>>,
    pub boot_thresholds: Mutex<Vec<(i64, String, serde_json::Value)>>,
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub block_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl MemAlarmStore {
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn with_thresholds(sensor_id: i64, tag: &str, thresholds: serde_json::Value) -> Self {
        let store = Self::default();
        store
            .boot_thresholds
            .lock()
            .unwrap()
            .push((sensor_id, tag.to_owned(), thresholds));
        store
    }
}

#[async_trait]
impl AlarmStore for MemAlarmStore {
    async fn load_active_alarms(&self) -> Result<Vec<AlarmInstance>, AlarmStoreError> {
        Ok(self.boot_alarms.lock().unwrap().clone())
    }

    async fn load_thresholds(
        &self,
    ) -> Result<Vec<(i64, String, serde_json::Value)>, AlarmStoreError> {
        Ok(self.boot_thresholds.lock().unwrap().clone())
    }

    async fn save_alarm(&self, alarm: &AlarmInstance) -> Result<(), AlarmStoreError> {
        self.saved.lock().unwrap().push(alarm.clone());
        Ok(())
    }

    async fn log_event(
        &self,
        block_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), AlarmStoreError> {
        self.events.lock().unwrap().push(AuditEvent {
            block_id: block_id.to_owned(),
            event_type: event_type.to_owned(),
            payload,
        });
        Ok(())
    }
}

/// Outbound publisher recording every lifecycle event.
#[derive(Default)]
pub struct MemEvents {
    pub events: Mutex<Vec<AlarmEventOut>>,
}

impl MemEvents {
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemEvents {
    async fn publish(&self, event: &AlarmEventOut) -> Result<(), PublishError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A plausible inbound alarm signal.
pub fn make_signal(sensor_id: i64, subsystem: &str, tag: &str, value: f64) -> AlarmSignal {
    AlarmSignal {
        sensor_id,
        priority: Priority::P2,
        value,
        timestamp: "2027-01-15T10:30:00Z".to_owned(),
        site_id: "baldwinsville".to_owned(),
        block_id: "block-01".to_owned(),
        subsystem: subsystem.to_owned(),
        tag: tag.to_owned(),
    }
}

/// A telemetry payload JSON string with the given value and timestamp.
pub fn telemetry_json(ts: &str, value: f64, seq: u64) -> String {
    format!(r#"{{"ts":"{}","v":{},"q":"GOOD","alarm":null,"seq":{}}}"#, ts, value, seq)
}
