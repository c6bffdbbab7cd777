//! Dead-letter queue.
//!
//! Every message the ingestor cannot accept becomes one append-only row.
//! Writes are fire-and-forget: a DLQ failure is logged, never raised into
//! the hot path.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use crate::metrics::IngestMetrics;

/// Truncation limits for oversized rejects.
const MAX_PAYLOAD_CHARS: usize = 4000;
const MAX_MESSAGE_CHARS: usize = 1000;

/// Where rejected messages go.  Tests inject a recording sink.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, topic: &str, payload: &str, category: &'static str, message: String);
}

#[async_trait]
impl<T: DeadLetterSink + ?Sized> DeadLetterSink for std::sync::Arc<T> {
    async fn record(&self, topic: &str, payload: &str, category: &'static str, message: String) {
        (**self).record(topic, payload, category, message).await;
    }
}

pub struct PgDeadLetterSink {
    pool: PgPool,
    metrics: Arc<IngestMetrics>,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool, metrics: Arc<IngestMetrics>) -> Self {
        PgDeadLetterSink { pool, metrics }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn record(&self, topic: &str, payload: &str, category: &'static str, message: String) {
        let payload = truncate(payload, MAX_PAYLOAD_CHARS);
        let message = truncate(&message, MAX_MESSAGE_CHARS);

        let result = sqlx::query(
            r#"INSERT INTO dead_letter_queue
                   (received_at, mqtt_topic, raw_payload, error_category, error_message)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(chrono::Utc::now())
        .bind(topic)
        .bind(payload)
        .bind(category)
        .bind(&message)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => IngestMetrics::incr(&self.metrics.dlq_rows),
            Err(e) => error!(error = %e, %topic, category, "dead letter write failed"),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
