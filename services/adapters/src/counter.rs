//! SNMP counter rate computation.
//!
//! Counter OIDs report a monotonically increasing raw count; the published
//! value is the rate `delta / elapsed_seconds × counter_scale`.  A negative
//! delta is a 32-bit counter wrap and is corrected by adding 2^32.

use std::collections::HashMap;

const WRAP_32: f64 = 4_294_967_296.0; // 2^32

/// Tracks the previous raw sample per tag and computes rates.
#[derive(Debug, Default)]
pub struct CounterTracker {
    last: HashMap<String, (f64, f64)>, // tag → (sample time s, raw value)
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw counter sample at monotonic time `now_s` and return the
    /// computed rate.
    ///
    /// Returns `None` for the first sample of a tag (no delta yet) and for
    /// zero-elapsed samples.
    pub fn observe(&mut self, tag: &str, raw: f64, scale: f64, now_s: f64) -> Option<f64> {
        let prev = self.last.insert(tag.to_owned(), (now_s, raw));
        let (prev_t, prev_raw) = prev?;

        let elapsed = now_s - prev_t;
        if elapsed <= 0.0 {
            return None;
        }

        let mut delta = raw - prev_raw;
        if delta < 0.0 {
            // 32-bit counter wrapped
            delta += WRAP_32;
        }

        Some(round4(delta / elapsed * scale))
    }

    /// Forget a tag's history (e.g. after a device reconnect where the
    /// counter may have reset).
    pub fn reset(&mut self, tag: &str) {
        self.last.remove(tag);
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
