//! Local broker publication.
//!
//! Telemetry goes out QoS 0 retained (last-value semantics for new
//! subscribers); alarm edge events go out QoS 1 unretained.  A per-tag
//! monotonic sequence number is attached to telemetry so consumers can
//! detect drops.

use async_trait::async_trait;
use mcs_proto::{
    alarm_topic, telemetry_topic, AlarmAction, AlarmEventPayload, Priority, Quality,
    TelemetryPayload, ThresholdDirection,
};
use rumqttc::{AsyncClient, QoS};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broker publish failed: {0}")]
    Broker(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Delivery class for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    AtMostOnce,
    AtLeastOnce,
}

// ---------------------------------------------------------------------------
// BrokerPublisher
// ---------------------------------------------------------------------------

/// The one broker capability the adapter needs.  Tests inject a recording
/// implementation; production wraps a rumqttc client.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        delivery: Delivery,
        retain: bool,
    ) -> Result<(), PublishError>;
}

/// rumqttc-backed publisher.  The caller owns the event loop task.
pub struct MqttBrokerPublisher {
    client: AsyncClient,
}

impl MqttBrokerPublisher {
    pub fn new(client: AsyncClient) -> Self {
        MqttBrokerPublisher { client }
    }
}

#[async_trait]
impl BrokerPublisher for MqttBrokerPublisher {
    async fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        delivery: Delivery,
        retain: bool,
    ) -> Result<(), PublishError> {
        let qos = match delivery {
            Delivery::AtMostOnce => QoS::AtMostOnce,
            Delivery::AtLeastOnce => QoS::AtLeastOnce,
        };
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| PublishError::Broker(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// AdapterPublisher
// ---------------------------------------------------------------------------

/// Builds and publishes the adapter's two message families.
pub struct AdapterPublisher<B: BrokerPublisher> {
    broker: B,
    site_id: String,
    block_id: String,
    seq: Mutex<HashMap<String, u64>>,
    published: std::sync::atomic::AtomicU64,
    errors: std::sync::atomic::AtomicU64,
}

impl<B: BrokerPublisher> AdapterPublisher<B> {
    pub fn new(broker: B, site_id: &str, block_id: &str) -> Self {
        AdapterPublisher {
            broker,
            site_id: site_id.to_owned(),
            block_id: block_id.to_owned(),
            seq: Mutex::new(HashMap::new()),
            published: std::sync::atomic::AtomicU64::new(0),
            errors: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn next_seq(&self, tag: &str) -> u64 {
        let mut map = self.seq.lock().expect("seq lock poisoned");
        let entry = map.entry(tag.to_owned()).or_insert(0);
        let seq = *entry;
        *entry += 1;
        seq
    }

    fn now_ts() -> String {
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    /// Publish one telemetry reading (QoS 0, retained).
    pub async fn publish_telemetry(
        &self,
        subsystem: &str,
        tag: &str,
        value: f64,
        unit: &str,
        quality: Quality,
        alarm: Option<Priority>,
    ) {
        let payload = TelemetryPayload {
            ts: Self::now_ts(),
            v: value,
            u: if unit.is_empty() {
                None
            } else {
                Some(unit.to_owned())
            },
            q: quality,
            alarm: alarm.map(|p| p.as_str().to_owned()),
            seq: self.next_seq(tag),
        };

        let topic = telemetry_topic(&self.site_id, &self.block_id, subsystem, tag);
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(%topic, error = %e, "telemetry serialization failed");
                return;
            }
        };

        match self
            .broker
            .publish(topic.clone(), bytes, Delivery::AtMostOnce, true)
            .await
        {
            Ok(()) => {
                self.published
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                self.errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(%topic, error = %e, "telemetry publish failed");
            }
        }
    }

    /// Publish one alarm edge event (QoS 1, not retained).
    #[allow(clippy::too_many_arguments)]
    pub async fn publish_alarm(
        &self,
        subsystem: &str,
        tag: &str,
        priority: Priority,
        action: AlarmAction,
        value: f64,
        threshold: f64,
        direction: ThresholdDirection,
        description: String,
    ) {
        let ts = Self::now_ts();
        let alarm_id = format!(
            "{}-{}-{}",
            self.block_id,
            tag,
            chrono::Utc::now().timestamp_millis()
        );
        let payload = AlarmEventPayload {
            ts,
            alarm_id,
            action,
            priority,
            sensor_tag: tag.to_owned(),
            subsystem: subsystem.to_owned(),
            value,
            threshold,
            direction,
            description,
        };

        let topic = alarm_topic(&self.site_id, &self.block_id, priority);
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(%topic, error = %e, "alarm serialization failed");
                return;
            }
        };

        if let Err(e) = self
            .broker
            .publish(topic.clone(), bytes, Delivery::AtLeastOnce, false)
            .await
        {
            self.errors
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            warn!(%topic, error = %e, "alarm publish failed");
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records every publish for assertion.
    #[derive(Default)]
    struct RecordingBroker {
        messages: Arc<Mutex<Vec<(String, Vec<u8>, Delivery, bool)>>>,
    }

    #[async_trait]
    impl BrokerPublisher for RecordingBroker {
        async fn publish(
            &self,
            topic: String,
            payload: Vec<u8>,
            delivery: Delivery,
            retain: bool,
        ) -> Result<(), PublishError> {
            self.messages
                .lock()
                .unwrap()
                .push((topic, payload, delivery, retain));
            Ok(())
        }
    }

    #[tokio::test]
    async fn telemetry_is_qos0_retained_with_monotonic_seq() {
        let broker = RecordingBroker::default();
        let messages = broker.messages.clone();
        let publisher = AdapterPublisher::new(broker, "site", "block-01");

        publisher
            .publish_telemetry("thermal-l1", "TT-101", 21.5, "degC", Quality::Good, None)
            .await;
        publisher
            .publish_telemetry("thermal-l1", "TT-101", 21.6, "degC", Quality::Good, None)
            .await;
        publisher
            .publish_telemetry("thermal-l1", "TT-102", 30.0, "degC", Quality::Good, None)
            .await;

        let msgs = messages.lock().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].0, "microlink/site/block-01/thermal-l1/TT-101");
        assert_eq!(msgs[0].2, Delivery::AtMostOnce);
        assert!(msgs[0].3, "telemetry must be retained");

        let p0: TelemetryPayload = serde_json::from_slice(&msgs[0].1).unwrap();
        let p1: TelemetryPayload = serde_json::from_slice(&msgs[1].1).unwrap();
        let p2: TelemetryPayload = serde_json::from_slice(&msgs[2].1).unwrap();
        assert_eq!(p0.seq, 0);
        assert_eq!(p1.seq, 1);
        // Sequence is per tag.
        assert_eq!(p2.seq, 0);
        assert!(p0.validate().is_ok());
    }

    #[tokio::test]
    async fn alarms_are_qos1_unretained_on_the_priority_topic() {
        let broker = RecordingBroker::default();
        let messages = broker.messages.clone();
        let publisher = AdapterPublisher::new(broker, "site", "block-01");

        publisher
            .publish_alarm(
                "thermal-l1",
                "TT-101",
                Priority::P1,
                AlarmAction::Raised,
                61.0,
                60.0,
                ThresholdDirection::High,
                "supply temp HIGH".to_owned(),
            )
            .await;

        let msgs = messages.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, "microlink/site/block-01/alarms/P1");
        assert_eq!(msgs[0].2, Delivery::AtLeastOnce);
        assert!(!msgs[0].3, "alarm events are not retained");

        let evt: AlarmEventPayload = serde_json::from_slice(&msgs[0].1).unwrap();
        assert_eq!(evt.action, AlarmAction::Raised);
        assert!(evt.alarm_id.starts_with("block-01-TT-101-"));
    }
}
