//! Threshold evaluation with debounce and clearing deadband.
//!
//! Thresholds live in the sensor registry as a JSON object keyed by band
//! level:
//!
//! ```json
//! { "HH": {"value": 60.0, "priority": "P0", "delay_s": 0},
//!   "H":  {"value": 55.0, "priority": "P2", "delay_s": 30},
//!   "L":  {"value": 10.0, "priority": "P2", "delay_s": 30},
//!   "LL": {"value": 5.0,  "priority": "P0", "delay_s": 0} }
//! ```
//!
//! Raising: HIGH bands alarm when `v > threshold`, LOW bands when
//! `v < threshold`, after the band has been continuously crossed for its
//! `delay_s`.  Clearing applies the deadband: a HIGH alarm holds until
//! `v < T(1-d)`, a LOW alarm until `v > T(1+d)`.

use mcs_proto::{Priority, ThresholdDirection};
use std::collections::HashMap;
use tracing::{info, warn};

const LEVELS: [&str; 4] = ["HH", "H", "L", "LL"];

/// Single threshold band on a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdDef {
    pub level: String,
    pub value: f64,
    pub priority: Priority,
    pub delay_s: f64,
    pub direction: ThresholdDirection,
}

/// All bands for one sensor, with per-band debounce state.
#[derive(Debug, Clone)]
pub struct SensorThresholds {
    pub sensor_id: i64,
    pub tag: String,
    pub thresholds: Vec<ThresholdDef>,
    debounce: HashMap<String, f64>, // level → first crossed at (monotonic s)
}

impl SensorThresholds {
    pub fn new(sensor_id: i64, tag: String, thresholds: Vec<ThresholdDef>) -> Self {
        SensorThresholds {
            sensor_id,
            tag,
            thresholds,
            debounce: HashMap::new(),
        }
    }

    /// Evaluate `value` against every band at monotonic time `now_s`.
    ///
    /// Returns `(band, in_alarm)` per band; `in_alarm` accounts for the
    /// debounce delay but not the clearing deadband (the engine applies
    /// that only when deciding to clear).
    pub fn evaluate(&mut self, value: f64, now_s: f64) -> Vec<(ThresholdDef, bool)> {
        let mut results = Vec::with_capacity(self.thresholds.len());

        for band in &self.thresholds {
            let crossed = match band.direction {
                ThresholdDirection::High => value > band.value,
                _ => value < band.value,
            };

            let in_alarm = if crossed {
                if band.delay_s > 0.0 {
                    let since = *self.debounce.entry(band.level.clone()).or_insert(now_s);
                    (now_s - since) >= band.delay_s
                } else {
                    true
                }
            } else {
                self.debounce.remove(&band.level);
                false
            };

            results.push((band.clone(), in_alarm));
        }
        results
    }

    /// Has the value returned far enough past the band for a clear?
    pub fn check_clear_with_deadband(value: f64, band: &ThresholdDef, deadband_percent: f64) -> bool {
        let frac = deadband_percent / 100.0;
        match band.direction {
            ThresholdDirection::High => value < band.value * (1.0 - frac),
            _ => value > band.value * (1.0 + frac),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory registry of sensor thresholds, loaded from the registry
/// table at startup and refreshed on a cadence.
#[derive(Debug, Default)]
pub struct ThresholdRegistry {
    sensors: HashMap<i64, SensorThresholds>,
}

impl ThresholdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `(sensor_id, tag, thresholds_json)` rows.  Returns the
    /// number of sensors with at least one usable band.
    ///
    /// A percent deadband is numerically unstable around zero, so any
    /// band with `|value| < 1.0` gets a startup warning.
    pub fn load_from_rows(
        &mut self,
        rows: Vec<(i64, String, serde_json::Value)>,
        deadband_percent: f64,
    ) -> usize {
        let mut loaded = HashMap::new();

        for (sensor_id, tag, json) in rows {
            let object = match json.as_object() {
                Some(o) => o,
                None => {
                    warn!(sensor_id, %tag, "threshold config is not an object, skipped");
                    continue;
                }
            };

            let mut thresholds = Vec::new();
            for (level, band) in object {
                if !LEVELS.contains(&level.as_str()) {
                    warn!(sensor_id, %tag, level, "unknown threshold level, skipped");
                    continue;
                }
                let value = match band.get("value").and_then(|v| v.as_f64()) {
                    Some(v) => v,
                    None => {
                        warn!(sensor_id, %tag, level, "threshold band has no numeric value");
                        continue;
                    }
                };
                let priority = band
                    .get("priority")
                    .and_then(|p| p.as_str())
                    .and_then(Priority::parse)
                    .unwrap_or(Priority::P2);
                let delay_s = band.get("delay_s").and_then(|d| d.as_f64()).unwrap_or(0.0);
                let direction = if level == "HH" || level == "H" {
                    ThresholdDirection::High
                } else {
                    ThresholdDirection::Low
                };

                if value.abs() < 1.0 && deadband_percent > 0.0 {
                    warn!(
                        sensor_id,
                        %tag,
                        level,
                        value,
                        deadband_percent,
                        "percent deadband is unstable for near-zero thresholds"
                    );
                }

                thresholds.push(ThresholdDef {
                    level: level.clone(),
                    value,
                    priority,
                    delay_s,
                    direction,
                });
            }

            if !thresholds.is_empty() {
                loaded.insert(sensor_id, SensorThresholds::new(sensor_id, tag, thresholds));
            }
        }

        let count = loaded.len();
        self.sensors = loaded;
        info!(sensors = count, "threshold registry loaded");
        count
    }

    pub fn get_mut(&mut self, sensor_id: i64) -> Option<&mut SensorThresholds> {
        self.sensors.get_mut(&sensor_id)
    }

    pub fn contains(&self, sensor_id: i64) -> bool {
        self.sensors.contains_key(&sensor_id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with(json: serde_json::Value) -> ThresholdRegistry {
        let mut registry = ThresholdRegistry::new();
        registry.load_from_rows(vec![(1, "TT-101".to_owned(), json)], 2.0);
        registry
    }

    #[test]
    fn bands_load_with_derived_directions() {
        let mut registry = registry_with(json!({
            "HH": {"value": 60.0, "priority": "P0"},
            "H":  {"value": 55.0, "priority": "P2", "delay_s": 30},
            "L":  {"value": 10.0, "priority": "P2"},
            "LL": {"value": 5.0,  "priority": "P0"},
        }));
        assert_eq!(registry.len(), 1);
        let sensor = registry.get_mut(1).unwrap();
        assert_eq!(sensor.thresholds.len(), 4);
        let hh = sensor.thresholds.iter().find(|t| t.level == "HH").unwrap();
        assert_eq!(hh.direction, ThresholdDirection::High);
        let ll = sensor.thresholds.iter().find(|t| t.level == "LL").unwrap();
        assert_eq!(ll.direction, ThresholdDirection::Low);
    }

    #[test]
    fn unknown_levels_and_bad_bands_are_skipped() {
        let mut registry = registry_with(json!({
            "H": {"value": 55.0},
            "MID": {"value": 30.0},
            "L": {"priority": "P1"},
        }));
        let sensor = registry.get_mut(1).unwrap();
        assert_eq!(sensor.thresholds.len(), 1);
        assert_eq!(sensor.thresholds[0].level, "H");
        // Missing priority defaults to P2.
        assert_eq!(sensor.thresholds[0].priority, Priority::P2);
    }

    #[test]
    fn high_band_alarms_above_the_value() {
        let mut registry = registry_with(json!({"H": {"value": 50.0, "priority": "P2"}}));
        let sensor = registry.get_mut(1).unwrap();
        let results = sensor.evaluate(52.0, 0.0);
        assert!(results[0].1);
        let results = sensor.evaluate(45.0, 1.0);
        assert!(!results[0].1);
    }

    #[test]
    fn debounce_defers_the_alarm_and_resets_on_return() {
        let mut registry =
            registry_with(json!({"H": {"value": 50.0, "priority": "P2", "delay_s": 10}}));
        let sensor = registry.get_mut(1).unwrap();

        assert!(!sensor.evaluate(52.0, 0.0)[0].1);
        assert!(!sensor.evaluate(52.0, 9.0)[0].1);
        assert!(sensor.evaluate(52.0, 10.0)[0].1);

        // Dip back inside: timer resets.
        assert!(!sensor.evaluate(49.0, 11.0)[0].1);
        assert!(!sensor.evaluate(52.0, 12.0)[0].1);
        assert!(sensor.evaluate(52.0, 22.0)[0].1);
    }

    #[test]
    fn deadband_law_holds_for_high_bands() {
        let band = ThresholdDef {
            level: "H".to_owned(),
            value: 50.0,
            priority: Priority::P2,
            delay_s: 0.0,
            direction: ThresholdDirection::High,
        };
        // Clear point is 50 × 0.98 = 49.
        assert!(!SensorThresholds::check_clear_with_deadband(50.5, &band, 2.0));
        assert!(!SensorThresholds::check_clear_with_deadband(49.0, &band, 2.0));
        assert!(SensorThresholds::check_clear_with_deadband(48.9, &band, 2.0));
    }

    #[test]
    fn deadband_law_holds_for_low_bands() {
        let band = ThresholdDef {
            level: "L".to_owned(),
            value: 10.0,
            priority: Priority::P2,
            delay_s: 0.0,
            direction: ThresholdDirection::Low,
        };
        // Clear point is 10 × 1.02 = 10.2.
        assert!(!SensorThresholds::check_clear_with_deadband(10.1, &band, 2.0));
        assert!(SensorThresholds::check_clear_with_deadband(10.3, &band, 2.0));
    }
}
