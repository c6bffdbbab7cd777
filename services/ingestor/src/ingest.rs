//! The per-message ingestion pipeline and the broker consume loop.
//!
//! Steps, in contract order: topic parse, payload parse, sensor
//! resolution, telemetry enqueue, alarm-signal extraction.  Every reject
//! takes exactly one of three exits — a DLQ row, an overflow count, or a
//! telemetry row — and is never silently lost.

use async_trait::async_trait;
use mcs_proto::{
    dlq_categories, telemetry_channel, AlarmSignal, TelemetryPayload, TelemetryTopic,
    ALARMS_INBOUND_CHANNEL,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::batch::{BatchWriter, TelemetryRow, TelemetryStore};
use crate::cache::SensorResolver;
use crate::config::MqttConfig;
use crate::dead_letter::DeadLetterSink;
use crate::metrics::IngestMetrics;

// ---------------------------------------------------------------------------
// Channel publishing
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("channel publish failed: {0}")]
pub struct ChannelError(pub String);

/// Pub/sub fan-out capability: alarm signals and per-block live telemetry.
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), ChannelError>;
}

#[async_trait]
impl<T: ChannelPublisher + ?Sized> ChannelPublisher for std::sync::Arc<T> {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), ChannelError> {
        (**self).publish(channel, payload).await
    }
}

/// Redis-backed channel publisher.
pub struct RedisChannelPublisher {
    conn: redis::aio::ConnectionManager,
}

impl RedisChannelPublisher {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisChannelPublisher { conn }
    }
}

#[async_trait]
impl ChannelPublisher for RedisChannelPublisher {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), ChannelError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ChannelError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

pub struct Ingestor<R, ST, D, C>
where
    R: SensorResolver,
    ST: TelemetryStore,
    D: DeadLetterSink,
    C: ChannelPublisher,
{
    resolver: R,
    writer: Arc<BatchWriter<ST>>,
    dlq: D,
    channels: C,
    metrics: Arc<IngestMetrics>,
}

impl<R, ST, D, C> Ingestor<R, ST, D, C>
where
    R: SensorResolver,
    ST: TelemetryStore,
    D: DeadLetterSink,
    C: ChannelPublisher,
{
    pub fn new(
        resolver: R,
        writer: Arc<BatchWriter<ST>>,
        dlq: D,
        channels: C,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Ingestor {
            resolver,
            writer,
            dlq,
            channels,
            metrics,
        }
    }

    /// Process one broker message through the pipeline.
    pub async fn handle_message(&self, topic: &str, raw_payload: &[u8]) {
        IngestMetrics::incr(&self.metrics.received);
        let payload_text = String::from_utf8_lossy(raw_payload);

        // ── Step 1: topic ────────────────────────────────────────────
        let parsed_topic = match TelemetryTopic::parse(topic) {
            Ok(t) => t,
            Err(e) => {
                self.dlq
                    .record(topic, &payload_text, dlq_categories::TOPIC_ERROR, e.to_string())
                    .await;
                return;
            }
        };

        // ── Step 2: payload ──────────────────────────────────────────
        let payload: TelemetryPayload = match serde_json::from_slice(raw_payload) {
            Ok(p) => p,
            Err(e) => {
                self.dlq
                    .record(
                        topic,
                        &payload_text,
                        dlq_categories::PARSE_ERROR,
                        format!("payload failed JSON parse: {}", e),
                    )
                    .await;
                return;
            }
        };
        if let Err(e) = payload.validate() {
            // Non-finite values are a range problem, not a format problem;
            // they get their own DLQ category.
            let category = match e {
                mcs_proto::PayloadError::NonFiniteValue => dlq_categories::VALUE_ERROR,
                mcs_proto::PayloadError::BadTimestamp(_) => dlq_categories::PARSE_ERROR,
            };
            self.dlq
                .record(topic, &payload_text, category, e.to_string())
                .await;
            return;
        }
        // validate() guarantees the timestamp parses.
        let ts = match payload.timestamp_utc() {
            Some(ts) => ts,
            None => return,
        };

        // ── Step 3: sensor resolution ────────────────────────────────
        let sensor_id = match self
            .resolver
            .resolve(
                &parsed_topic.site,
                &parsed_topic.block,
                &parsed_topic.subsystem,
                &parsed_topic.tag,
            )
            .await
        {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.dlq
                    .record(
                        topic,
                        &payload_text,
                        dlq_categories::SENSOR_UNKNOWN,
                        format!(
                            "no sensor registered for {}/{}/{}/{}",
                            parsed_topic.site,
                            parsed_topic.block,
                            parsed_topic.subsystem,
                            parsed_topic.tag
                        ),
                    )
                    .await;
                return;
            }
            Err(e) => {
                self.dlq
                    .record(topic, &payload_text, dlq_categories::INTERNAL_ERROR, e.to_string())
                    .await;
                return;
            }
        };

        // ── Step 4: telemetry enqueue ────────────────────────────────
        let accepted = self.writer.enqueue(TelemetryRow {
            time: ts,
            sensor_id,
            value: payload.v,
            quality: payload.q.as_int(),
        });
        if !accepted {
            warn!(sensor_id, "backpressure, row dropped");
        } else {
            // Live fan-out for block subscribers; errors never propagate.
            let live = json!({
                "sensor_id": sensor_id,
                "site_id": parsed_topic.site,
                "block_id": parsed_topic.block,
                "subsystem": parsed_topic.subsystem,
                "tag": parsed_topic.tag,
                "ts": payload.ts,
                "v": payload.v,
                "q": payload.q,
            });
            if let Err(e) = self
                .channels
                .publish(&telemetry_channel(&parsed_topic.block), live.to_string())
                .await
            {
                warn!(error = %e, "live telemetry publish failed");
            }
        }

        // ── Step 5: alarm signal ─────────────────────────────────────
        if payload.has_invalid_alarm() {
            IngestMetrics::incr(&self.metrics.invalid_priority);
            warn!(sensor_id, alarm = ?payload.alarm, "invalid alarm priority ignored");
            return;
        }
        if let Some(priority) = payload.alarm_priority() {
            let signal = AlarmSignal {
                sensor_id,
                priority,
                value: payload.v,
                timestamp: payload.ts.clone(),
                site_id: parsed_topic.site.clone(),
                block_id: parsed_topic.block.clone(),
                subsystem: parsed_topic.subsystem.clone(),
                tag: parsed_topic.tag.clone(),
            };
            match serde_json::to_string(&signal) {
                Ok(json) => match self.channels.publish(ALARMS_INBOUND_CHANNEL, json).await {
                    Ok(()) => IngestMetrics::incr(&self.metrics.alarms_published),
                    Err(e) => warn!(error = %e, sensor_id, "alarm signal publish failed"),
                },
                Err(e) => warn!(error = %e, "alarm signal serialization failed"),
            }
        }
    }

    /// Broker consume loop with reconnect.  Runs until cancelled.
    pub async fn run_consume_loop(&self, mqtt: &MqttConfig) {
        loop {
            let mut opts = MqttOptions::new(mqtt.client_id.clone(), mqtt.host.clone(), mqtt.port);
            opts.set_keep_alive(Duration::from_secs(60));
            if let (Some(user), Some(pass)) = (&mqtt.username, &mqtt.password) {
                opts.set_credentials(user.clone(), pass.clone());
            }
            let (client, mut event_loop) = AsyncClient::new(opts, 1024);

            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(host = %mqtt.host, topic = %mqtt.topic_root, "broker connected");
                        if let Err(e) = client
                            .subscribe(mqtt.topic_root.clone(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!(error = %e, "subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_message(&publish.topic, &publish.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "broker connection lost, reconnecting in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        break;
                    }
                }
            }
        }
    }
}
