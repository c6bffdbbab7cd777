//! Ingestion counters, reported on a fixed cadence through the log.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Process-wide counters.  All access is relaxed; these are monitoring
/// figures, not invariants.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub received: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_dropped: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub dlq_rows: AtomicU64,
    pub alarms_published: AtomicU64,
    pub invalid_priority: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn report(&self) {
        info!(
            received = self.received.load(Ordering::Relaxed),
            rows_written = self.rows_written.load(Ordering::Relaxed),
            rows_dropped = self.rows_dropped.load(Ordering::Relaxed),
            flushes = self.flushes.load(Ordering::Relaxed),
            flush_errors = self.flush_errors.load(Ordering::Relaxed),
            cache_hit_rate = format!("{:.4}", self.cache_hit_rate()),
            dlq_rows = self.dlq_rows.load(Ordering::Relaxed),
            alarms_published = self.alarms_published.load(Ordering::Relaxed),
            invalid_priority = self.invalid_priority.load(Ordering::Relaxed),
            "ingest stats"
        );
    }

    /// Log the counters every 5 seconds until cancelled.
    pub async fn run_report_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.report();
        }
    }
}
