//! Outbound event fan-out.
//!
//! Every lifecycle event is published as a structured JSON string on the
//! outbound channel.  Delivery is the transport's at-most-once; consumers
//! apply their own [`mcs_proto::SubscriberFilter`] after receiving the
//! raw channel.  Publishers never block on slow consumers.

use async_trait::async_trait;
use mcs_proto::{AlarmEventOut, ALARMS_OUTBOUND_CHANNEL};

#[derive(Debug, thiserror::Error)]
#[error("event publish failed: {0}")]
pub struct PublishError(pub String);

/// Outbound channel capability.  Tests inject a recording publisher.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &AlarmEventOut) -> Result<(), PublishError>;
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for std::sync::Arc<T> {
    async fn publish(&self, event: &AlarmEventOut) -> Result<(), PublishError> {
        (**self).publish(event).await
    }
}

/// Redis-backed publisher for the outbound alarm channel.
pub struct RedisEventPublisher {
    conn: redis::aio::ConnectionManager,
}

impl RedisEventPublisher {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisEventPublisher { conn }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, event: &AlarmEventOut) -> Result<(), PublishError> {
        let json = serde_json::to_string(event).map_err(|e| PublishError(e.to_string()))?;
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(ALARMS_OUTBOUND_CHANNEL)
            .arg(json)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| PublishError(e.to_string()))
    }
}
