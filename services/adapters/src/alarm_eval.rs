//! Source-side alarm evaluation: band crossing with debounce, and
//! raise/escalate/clear edge detection.
//!
//! The adapter only decides whether a band is crossed right now; deadband
//! hysteresis on clearing is the alarm engine's job downstream.

use crate::config::{BandLevel, PointMapping, ThresholdBand};
use mcs_proto::{AlarmAction, Priority, ThresholdDirection};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Band evaluation with debounce
// ---------------------------------------------------------------------------

/// The band a value is currently in, after debounce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveBand {
    pub level: BandLevel,
    pub priority: Priority,
    pub threshold: f64,
    pub direction: ThresholdDirection,
}

/// Per-point band evaluator.
///
/// Tracks, per band, when the value first crossed it (monotonic seconds).
/// A band becomes active once it has been continuously crossed for its
/// `delay_s`; re-entering the normal side resets the timer.
#[derive(Debug, Default)]
pub struct BandEvaluator {
    first_crossed: HashMap<BandLevel, f64>,
}

impl BandEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `value` against the point's bands at monotonic time `now_s`.
    ///
    /// Returns the highest-priority band currently active, if any.
    pub fn evaluate(
        &mut self,
        bands: &[ThresholdBand],
        value: f64,
        now_s: f64,
    ) -> Option<ActiveBand> {
        let mut best: Option<ActiveBand> = None;

        for band in bands {
            let crossed = if band.level.is_high() {
                value > band.value
            } else {
                value < band.value
            };

            if !crossed {
                self.first_crossed.remove(&band.level);
                continue;
            }

            let since = *self.first_crossed.entry(band.level).or_insert(now_s);
            if band.delay_s > 0.0 && (now_s - since) < band.delay_s {
                // Still inside the debounce window.
                continue;
            }

            let candidate = ActiveBand {
                level: band.level,
                priority: band.priority,
                threshold: band.value,
                direction: if band.level.is_high() {
                    ThresholdDirection::High
                } else {
                    ThresholdDirection::Low
                },
            };
            match best {
                Some(b) if b.priority <= candidate.priority => {}
                _ => best = Some(candidate),
            }
        }

        best
    }
}

// ---------------------------------------------------------------------------
// Edge detection
// ---------------------------------------------------------------------------

/// An edge-detected alarm transition for a tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmEdge {
    pub action: AlarmAction,
    /// For RAISED/ESCALATED: the new priority.  For CLEARED: the priority
    /// the tag was emitting before it cleared.
    pub priority: Priority,
}

/// Tracks the currently-emitting priority per tag and reports transitions.
#[derive(Debug, Default)]
pub struct EdgeDetector {
    current: HashMap<String, Priority>,
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest evaluation for `tag` and report the transition:
    /// none→p = RAISED, p→q (p≠q) = ESCALATED, p→none = CLEARED.
    pub fn observe(&mut self, tag: &str, new: Option<Priority>) -> Option<AlarmEdge> {
        let prev = match new {
            Some(p) => self.current.insert(tag.to_owned(), p),
            None => self.current.remove(tag),
        };

        match (prev, new) {
            (None, Some(p)) => Some(AlarmEdge {
                action: AlarmAction::Raised,
                priority: p,
            }),
            (Some(p), Some(q)) if p != q => Some(AlarmEdge {
                action: AlarmAction::Escalated,
                priority: q,
            }),
            (Some(p), None) => Some(AlarmEdge {
                action: AlarmAction::Cleared,
                priority: p,
            }),
            _ => None,
        }
    }
}

/// Build the human-readable description for an alarm edge event.
pub fn edge_description(
    point: &PointMapping,
    action: AlarmAction,
    value: f64,
    band: Option<&ActiveBand>,
) -> String {
    let name = if point.description.is_empty() {
        &point.tag
    } else {
        &point.description
    };
    match (action, band) {
        (AlarmAction::Cleared, _) => {
            format!("{} returned to normal — {}{}", name, value, point.unit)
        }
        (_, Some(b)) => {
            let verb = match b.direction {
                ThresholdDirection::High => "exceeds",
                _ => "below",
            };
            format!(
                "{} {} — {}{} {} {} limit {}{}",
                name,
                b.direction.as_str(),
                value,
                point.unit,
                verb,
                b.priority,
                b.threshold,
                point.unit
            )
        }
        (_, None) => format!("{} in alarm — {}{}", name, value, point.unit),
    }
}
