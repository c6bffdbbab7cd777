//! Batch writer: accumulates telemetry rows and bulk-inserts them.
//!
//! Producers append under a short critical section; a single flusher task
//! drains the buffer on either trigger (row count or age).  The flush
//! snapshot is detached from the live batch before the DB round-trip, so
//! appends continue while the insert is in flight.
//!
//! A failed flush returns its rows to the front of the buffer; if that
//! would exceed the high-water mark, the oldest overflow is dropped and
//! counted.  A row is written, returned, or counted — never silently
//! lost.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::metrics::IngestMetrics;

// ---------------------------------------------------------------------------
// Row and store
// ---------------------------------------------------------------------------

/// Single telemetry point ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRow {
    pub time: chrono::DateTime<chrono::Utc>,
    pub sensor_id: i64,
    pub value: f64,
    /// 0=GOOD, 1=UNCERTAIN, 2=BAD.
    pub quality: i16,
}

#[derive(Debug, thiserror::Error)]
#[error("telemetry store error: {0}")]
pub struct StoreError(pub String);

/// Bulk-insert capability of the storage backend.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_rows(&self, rows: &[TelemetryRow]) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: TelemetryStore + ?Sized> TelemetryStore for std::sync::Arc<T> {
    async fn insert_rows(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        (**self).insert_rows(rows).await
    }
}

// ---------------------------------------------------------------------------
// BatchWriter
// ---------------------------------------------------------------------------

pub struct BatchWriter<S: TelemetryStore> {
    store: S,
    buffer: Mutex<Vec<TelemetryRow>>,
    cfg: BatchConfig,
    metrics: Arc<IngestMetrics>,
    flush_wanted: Notify,
}

impl<S: TelemetryStore> BatchWriter<S> {
    pub fn new(store: S, cfg: BatchConfig, metrics: Arc<IngestMetrics>) -> Self {
        BatchWriter {
            store,
            buffer: Mutex::new(Vec::new()),
            cfg,
            metrics,
            flush_wanted: Notify::new(),
        }
    }

    /// Append a row.  Returns false when the row was dropped at the
    /// high-water mark (counted as overflow).
    pub fn enqueue(&self, row: TelemetryRow) -> bool {
        let len = {
            let mut buffer = self.buffer.lock().expect("batch lock poisoned");
            if buffer.len() >= self.cfg.max_pending {
                drop(buffer);
                IngestMetrics::incr(&self.metrics.rows_dropped);
                return false;
            }
            buffer.push(row);
            buffer.len()
        };
        if len >= self.cfg.size {
            self.flush_wanted.notify_one();
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().expect("batch lock poisoned").len()
    }

    /// Take everything currently buffered and bulk-insert it.
    pub async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().expect("batch lock poisoned");
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };
        let batch_len = batch.len();

        let started = Instant::now();
        match self.store.insert_rows(&batch).await {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.metrics
                    .rows_written
                    .fetch_add(batch_len as u64, Ordering::Relaxed);
                IngestMetrics::incr(&self.metrics.flushes);
                if elapsed_ms > 500.0 {
                    warn!(rows = batch_len, elapsed_ms = elapsed_ms as u64, "slow flush");
                } else {
                    debug!(rows = batch_len, elapsed_ms, "flushed");
                }
            }
            Err(e) => {
                IngestMetrics::incr(&self.metrics.flush_errors);
                warn!(error = %e, rows = batch_len, "flush failed, rows returned to buffer");

                let mut buffer = self.buffer.lock().expect("batch lock poisoned");
                let mut restored = batch;
                restored.append(&mut buffer);
                // Trim to the high-water mark, dropping oldest first.
                if restored.len() > self.cfg.max_pending {
                    let overflow = restored.len() - self.cfg.max_pending;
                    restored.drain(..overflow);
                    self.metrics
                        .rows_dropped
                        .fetch_add(overflow as u64, Ordering::Relaxed);
                }
                *buffer = restored;
            }
        }
    }

    /// Run the flusher until cancelled: flush when signalled by a full
    /// batch or when the age trigger fires.
    pub async fn run_flush_loop(&self) {
        let interval = Duration::from_millis(self.cfg.flush_interval_ms);
        loop {
            tokio::select! {
                () = self.flush_wanted.notified() => {}
                () = tokio::time::sleep(interval) => {}
            }
            self.flush().await;
        }
    }

    /// Final drain during shutdown.
    pub async fn close_drain(&self) {
        self.flush().await;
    }
}
