//! The capability set every protocol adapter implements, plus shared
//! connection bookkeeping: metrics, online/offline tracking, and backoff.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::PointMapping;

/// A device is considered offline after this many consecutive failed reads.
pub const OFFLINE_AFTER_ERRORS: u32 = 5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("not connected")]
    NotConnected,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("decode error: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// A successful point read.
///
/// `value` is `None` when the read succeeded but produced nothing to
/// publish yet — the first sample of an SNMP counter mapping, which is
/// recorded internally with UNCERTAIN quality and no rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: Option<f64>,
}

impl Reading {
    pub fn value(v: f64) -> Self {
        Reading { value: Some(v) }
    }

    pub fn pending() -> Self {
        Reading { value: None }
    }
}

// ---------------------------------------------------------------------------
// PointReader
// ---------------------------------------------------------------------------

/// The capability set of a protocol adapter: connect, read one point,
/// close, report metrics.
///
/// Implementations own their transport (TCP stream, UDP socket) and any
/// protocol-private state (counter history, COV caches).
#[async_trait]
pub trait PointReader: Send {
    /// Device name from config (for logging and status reporting).
    fn name(&self) -> &str;

    /// Establish the transport.  Called at startup and again by the poll
    /// loop after connection loss; implementations must be re-entrant.
    async fn connect(&mut self) -> Result<(), ReadError>;

    /// Read one point mapping and return the scaled engineering value.
    async fn read_point(&mut self, point: &PointMapping) -> Result<Reading, ReadError>;

    /// Tear down the transport.
    async fn close(&mut self);

    /// Snapshot of runtime metrics.
    fn metrics(&self) -> DeviceMetricsSnapshot;
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Runtime metrics for one device, kept by each reader.
#[derive(Debug, Default)]
pub struct DeviceMetrics {
    reads_total: u64,
    errors_total: u64,
    consecutive_errors: u32,
    latency_samples: Vec<f64>,
    last_read_ts: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMetricsSnapshot {
    pub reads_total: u64,
    pub errors_total: u64,
    pub consecutive_errors: u32,
    pub avg_latency_ms: f64,
    pub last_read_ts: Option<String>,
    pub online: bool,
}

impl DeviceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&mut self, latency_ms: f64) {
        self.reads_total += 1;
        self.consecutive_errors = 0;
        self.last_read_ts = Some(chrono::Utc::now().to_rfc3339());
        self.latency_samples.push(latency_ms);
        if self.latency_samples.len() > 100 {
            let excess = self.latency_samples.len() - 100;
            self.latency_samples.drain(..excess);
        }
    }

    pub fn record_error(&mut self) {
        self.errors_total += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
    }

    /// Online = at least one successful read, and fewer than
    /// [`OFFLINE_AFTER_ERRORS`] consecutive failures since.
    pub fn online(&self) -> bool {
        self.reads_total > 0 && self.consecutive_errors < OFFLINE_AFTER_ERRORS
    }

    pub fn snapshot(&self) -> DeviceMetricsSnapshot {
        let avg = if self.latency_samples.is_empty() {
            0.0
        } else {
            self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64
        };
        DeviceMetricsSnapshot {
            reads_total: self.reads_total,
            errors_total: self.errors_total,
            consecutive_errors: self.consecutive_errors,
            avg_latency_ms: (avg * 10.0).round() / 10.0,
            last_read_ts: self.last_read_ts.clone(),
            online: self.online(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect backoff: 1 s doubling up to a 60 s cap.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff {
            current: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }

    /// The delay to sleep before the next attempt; doubles on each call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Call after a successful connect.
    pub fn reset(&mut self) {
        self.current = Duration::from_secs(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
