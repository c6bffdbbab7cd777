//! Alarm flood handling.
//!
//! If more than `flood_threshold_count` alarms raise for a single block
//! within `flood_threshold_seconds`, the engine emits one flood event and
//! suppresses subsequent P2/P3 raises in that block until the rate drops.
//! P0 and P1 are never flood-suppressed.

use chrono::{DateTime, Duration, Utc};
use mcs_proto::Priority;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// What to do with a raise attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodDecision {
    /// Proceed normally.
    Allow,
    /// Threshold just crossed: emit one flood event, then proceed.
    FloodStarted,
    /// Block is flooding and the priority is suppressible: drop it.
    Suppress,
}

#[derive(Debug, Default)]
struct BlockWindow {
    raises: VecDeque<DateTime<Utc>>,
    flooding: bool,
}

/// Per-block sliding-window flood detector.
#[derive(Debug)]
pub struct FloodDetector {
    threshold_count: usize,
    window: Duration,
    blocks: HashMap<String, BlockWindow>,
    flood_events: u64,
}

impl FloodDetector {
    pub fn new(threshold_count: usize, window_seconds: i64) -> Self {
        FloodDetector {
            threshold_count,
            window: Duration::seconds(window_seconds),
            blocks: HashMap::new(),
            flood_events: 0,
        }
    }

    pub fn flood_event_count(&self) -> u64 {
        self.flood_events
    }

    pub fn is_flooding(&self, block: &str) -> bool {
        self.blocks.get(block).is_some_and(|w| w.flooding)
    }

    /// Record a raise attempt for `block` at `now` and decide its fate.
    pub fn on_raise(&mut self, block: &str, priority: Priority, now: DateTime<Utc>) -> FloodDecision {
        let window = self.window;
        let state = self.blocks.entry(block.to_owned()).or_default();

        // Expire entries older than the window.
        while state
            .raises
            .front()
            .is_some_and(|&t| now - t > window)
        {
            state.raises.pop_front();
        }

        let was_flooding = state.flooding;
        let in_window = state.raises.len();
        let over = in_window >= self.threshold_count;

        if over {
            if !was_flooding {
                state.flooding = true;
                self.flood_events += 1;
                warn!(
                    block,
                    raises_in_window = in_window,
                    "alarm flood detected"
                );
                state.raises.push_back(now);
                return FloodDecision::FloodStarted;
            }
            // Critical alarms always get through.
            if matches!(priority, Priority::P0 | Priority::P1) {
                state.raises.push_back(now);
                return FloodDecision::Allow;
            }
            return FloodDecision::Suppress;
        }

        if was_flooding {
            state.flooding = false;
        }
        state.raises.push_back(now);
        FloodDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn below_threshold_everything_flows() {
        let mut d = FloodDetector::new(20, 60);
        for i in 0..19 {
            assert_eq!(d.on_raise("block-01", Priority::P3, t(i)), FloodDecision::Allow);
        }
        assert!(!d.is_flooding("block-01"));
    }

    #[test]
    fn crossing_the_threshold_emits_one_flood_event() {
        let mut d = FloodDetector::new(20, 60);
        for i in 0..20 {
            d.on_raise("block-01", Priority::P3, t(i));
        }
        assert_eq!(
            d.on_raise("block-01", Priority::P3, t(20)),
            FloodDecision::FloodStarted
        );
        assert!(d.is_flooding("block-01"));
        assert_eq!(d.flood_event_count(), 1);

        // Subsequent P2/P3 are suppressed, not re-announced.
        assert_eq!(
            d.on_raise("block-01", Priority::P2, t(21)),
            FloodDecision::Suppress
        );
        assert_eq!(d.flood_event_count(), 1);
    }

    #[test]
    fn p0_and_p1_are_never_flood_suppressed() {
        let mut d = FloodDetector::new(5, 60);
        for i in 0..6 {
            d.on_raise("block-01", Priority::P3, t(i));
        }
        assert!(d.is_flooding("block-01"));
        assert_eq!(d.on_raise("block-01", Priority::P0, t(7)), FloodDecision::Allow);
        assert_eq!(d.on_raise("block-01", Priority::P1, t(8)), FloodDecision::Allow);
        assert_eq!(d.on_raise("block-01", Priority::P2, t(9)), FloodDecision::Suppress);
    }

    #[test]
    fn flood_subsides_when_the_window_drains() {
        let mut d = FloodDetector::new(5, 60);
        for i in 0..6 {
            d.on_raise("block-01", Priority::P3, t(i));
        }
        assert!(d.is_flooding("block-01"));

        // 2 minutes later the window is empty again.
        assert_eq!(
            d.on_raise("block-01", Priority::P3, t(180)),
            FloodDecision::Allow
        );
        assert!(!d.is_flooding("block-01"));
    }

    #[test]
    fn blocks_flood_independently() {
        let mut d = FloodDetector::new(5, 60);
        for i in 0..6 {
            d.on_raise("block-01", Priority::P3, t(i));
        }
        d.on_raise("block-01", Priority::P3, t(7));
        assert!(d.is_flooding("block-01"));
        assert_eq!(
            d.on_raise("block-02", Priority::P3, t(8)),
            FloodDecision::Allow
        );
        assert!(!d.is_flooding("block-02"));
    }
}
