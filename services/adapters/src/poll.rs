//! Poll group runner.
//!
//! One cooperative task per poll group.  Each cycle reads every point in
//! the group across all devices, evaluates thresholds on good readings,
//! detects alarm edges, publishes, and sleeps for the remainder of the
//! interval.  An overrun logs a warning but never skips reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::alarm_eval::{edge_description, ActiveBand, BandEvaluator, EdgeDetector};
use crate::config::{PointMapping, PollGroup};
use crate::publish::{AdapterPublisher, BrokerPublisher};
use crate::reader::{Backoff, DeviceMetricsSnapshot, PointReader, Reading};
use mcs_proto::Quality;

// ---------------------------------------------------------------------------
// DeviceRunner
// ---------------------------------------------------------------------------

/// One device's reader plus the per-tag evaluation state that survives
/// across cycles.
pub struct DeviceRunner {
    reader: Box<dyn PointReader>,
    points: Vec<PointMapping>,
    evaluators: HashMap<String, BandEvaluator>,
    edges: EdgeDetector,
    backoff: Backoff,
    connected: bool,
    retry_at: Option<Instant>,
}

impl DeviceRunner {
    pub fn new(reader: Box<dyn PointReader>, points: Vec<PointMapping>) -> Self {
        DeviceRunner {
            reader,
            points,
            evaluators: HashMap::new(),
            edges: EdgeDetector::new(),
            backoff: Backoff::new(),
            connected: false,
            retry_at: None,
        }
    }

    pub fn name(&self) -> &str {
        self.reader.name()
    }

    pub fn metrics(&self) -> DeviceMetricsSnapshot {
        self.reader.metrics()
    }

    pub fn has_points_in(&self, group: PollGroup) -> bool {
        self.points.iter().any(|p| p.poll_group == group)
    }

    /// Attempt a (re)connect when due; respects the backoff schedule.
    async fn ensure_connected(&mut self) -> bool {
        if self.connected {
            return true;
        }
        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return false;
            }
        }
        match self.reader.connect().await {
            Ok(()) => {
                self.connected = true;
                self.retry_at = None;
                self.backoff.reset();
                info!(device = %self.reader.name(), "device connected");
                true
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                self.retry_at = Some(Instant::now() + delay);
                warn!(device = %self.reader.name(), error = %e, retry_in_s = delay.as_secs(),
                    "device connect failed");
                false
            }
        }
    }

    /// Poll every point of this device in `group` once.
    ///
    /// `now_s` is the monotonic timestamp used for threshold debounce.
    pub async fn poll_group<B: BrokerPublisher>(
        &mut self,
        group: PollGroup,
        publisher: &AdapterPublisher<B>,
        now_s: f64,
    ) {
        let online = self.ensure_connected().await;

        let points: Vec<PointMapping> = self
            .points
            .iter()
            .filter(|p| p.poll_group == group)
            .cloned()
            .collect();

        for point in points {
            if !online {
                // Device unreachable: BAD quality with a zero value that is
                // distinguishable from a good zero by the quality flag.
                publisher
                    .publish_telemetry(
                        &point.subsystem,
                        &point.tag,
                        0.0,
                        &point.unit,
                        Quality::Bad,
                        None,
                    )
                    .await;
                continue;
            }

            match self.reader.read_point(&point).await {
                Ok(Reading { value: Some(value) }) => {
                    self.publish_reading(&point, value, publisher, now_s).await;
                }
                Ok(Reading { value: None }) => {
                    // Nothing publishable yet (counter first sample).
                }
                Err(e) => {
                    warn!(device = %self.reader.name(), tag = %point.tag, error = %e,
                        "point read failed");
                    if matches!(
                        e,
                        crate::reader::ReadError::Io(_)
                            | crate::reader::ReadError::Timeout(_)
                            | crate::reader::ReadError::NotConnected
                    ) {
                        self.connected = false;
                    }
                    publisher
                        .publish_telemetry(
                            &point.subsystem,
                            &point.tag,
                            0.0,
                            &point.unit,
                            Quality::Bad,
                            None,
                        )
                        .await;
                }
            }
        }
    }

    async fn publish_reading<B: BrokerPublisher>(
        &mut self,
        point: &PointMapping,
        value: f64,
        publisher: &AdapterPublisher<B>,
        now_s: f64,
    ) {
        let quality = if value < point.range_min || value > point.range_max {
            Quality::Uncertain
        } else {
            Quality::Good
        };

        // Thresholds apply to good readings only; a bad or implausible
        // value must not raise or clear a source alarm.
        let band: Option<ActiveBand> = if quality == Quality::Good && !point.thresholds.is_empty() {
            self.evaluators
                .entry(point.tag.clone())
                .or_default()
                .evaluate(&point.thresholds, value, now_s)
        } else {
            None
        };

        publisher
            .publish_telemetry(
                &point.subsystem,
                &point.tag,
                value,
                &point.unit,
                quality,
                band.map(|b| b.priority),
            )
            .await;

        if quality != Quality::Good {
            return;
        }

        if let Some(edge) = self.edges.observe(&point.tag, band.map(|b| b.priority)) {
            let description = edge_description(point, edge.action, value, band.as_ref());
            let (threshold, direction) = match band {
                Some(b) => (b.threshold, b.direction),
                None => (0.0, mcs_proto::ThresholdDirection::High),
            };
            publisher
                .publish_alarm(
                    &point.subsystem,
                    &point.tag,
                    edge.priority,
                    edge.action,
                    value,
                    threshold,
                    direction,
                    description,
                )
                .await;
        }
    }

    pub async fn close(&mut self) {
        self.reader.close().await;
        self.connected = false;
    }
}

// ---------------------------------------------------------------------------
// Group loop
// ---------------------------------------------------------------------------

/// Run one poll group until cancelled.
///
/// `epoch` anchors the monotonic clock shared by all groups so per-tag
/// debounce timers agree across them.
pub async fn run_poll_group<B: BrokerPublisher>(
    group: PollGroup,
    interval_ms: u64,
    runners: Vec<Arc<Mutex<DeviceRunner>>>,
    publisher: Arc<AdapterPublisher<B>>,
    epoch: Instant,
) {
    let interval = Duration::from_millis(interval_ms);
    info!(group = group.as_str(), interval_ms, "poll group started");

    loop {
        let cycle_start = Instant::now();

        for runner in &runners {
            let mut runner = runner.lock().await;
            let now_s = epoch.elapsed().as_secs_f64();
            runner.poll_group(group, &publisher, now_s).await;
        }

        let elapsed = cycle_start.elapsed();
        if elapsed > interval {
            warn!(
                group = group.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms,
                "poll cycle overran its interval"
            );
            // Next cycle starts immediately; reads are never skipped.
        } else {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}
