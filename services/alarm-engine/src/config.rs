//! Alarm engine configuration.
//!
//! Tuning knobs with ISA-18.2-informed defaults, loadable from a YAML
//! document; every field is optional and falls back to the default.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Shelving
    pub max_shelve_duration_hours: f64,
    pub default_shelve_duration_hours: f64,
    pub shelve_requires_reason: bool,
    /// Cadence of the shelve-expiry sweep.
    pub shelve_check_interval_s: u64,

    /// Deadband (hysteresis) on clearing, as a percent of the threshold.
    pub deadband_percent: f64,

    // Flood handling
    pub flood_threshold_count: usize,
    pub flood_threshold_seconds: i64,

    /// ISA-18.2 target standing alarm rate per operator hour.
    pub target_alarms_per_operator_hour: u64,

    /// Auto-clear alarms with no new readings for this long.
    pub stale_alarm_timeout_minutes: i64,

    /// Threshold registry refresh cadence.
    pub threshold_refresh_s: u64,

    // Connectivity (unused by the pure core; wired in main)
    pub database_url: Option<String>,
    pub redis_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_shelve_duration_hours: 24.0,
            default_shelve_duration_hours: 8.0,
            shelve_requires_reason: true,
            shelve_check_interval_s: 300,
            deadband_percent: 2.0,
            flood_threshold_count: 20,
            flood_threshold_seconds: 60,
            target_alarms_per_operator_hour: 6,
            stale_alarm_timeout_minutes: 30,
            threshold_refresh_s: 300,
            database_url: None,
            redis_url: "redis://localhost:6379/0".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    max_shelve_duration_hours: Option<f64>,
    default_shelve_duration_hours: Option<f64>,
    shelve_requires_reason: Option<bool>,
    shelve_check_interval_s: Option<u64>,
    deadband_percent: Option<f64>,
    flood_threshold_count: Option<usize>,
    flood_threshold_seconds: Option<i64>,
    target_alarms_per_operator_hour: Option<u64>,
    stale_alarm_timeout_minutes: Option<i64>,
    threshold_refresh_s: Option<u64>,
    database_url: Option<String>,
    redis_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

pub fn load_config_from_path(path: &Path) -> Result<EngineConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&yaml)
}

pub fn load_config_from_str(yaml: &str) -> Result<EngineConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = EngineConfig::default();

    let config = EngineConfig {
        max_shelve_duration_hours: raw
            .max_shelve_duration_hours
            .unwrap_or(defaults.max_shelve_duration_hours),
        default_shelve_duration_hours: raw
            .default_shelve_duration_hours
            .unwrap_or(defaults.default_shelve_duration_hours),
        shelve_requires_reason: raw
            .shelve_requires_reason
            .unwrap_or(defaults.shelve_requires_reason),
        shelve_check_interval_s: raw
            .shelve_check_interval_s
            .unwrap_or(defaults.shelve_check_interval_s),
        deadband_percent: raw.deadband_percent.unwrap_or(defaults.deadband_percent),
        flood_threshold_count: raw
            .flood_threshold_count
            .unwrap_or(defaults.flood_threshold_count),
        flood_threshold_seconds: raw
            .flood_threshold_seconds
            .unwrap_or(defaults.flood_threshold_seconds),
        target_alarms_per_operator_hour: raw
            .target_alarms_per_operator_hour
            .unwrap_or(defaults.target_alarms_per_operator_hour),
        stale_alarm_timeout_minutes: raw
            .stale_alarm_timeout_minutes
            .unwrap_or(defaults.stale_alarm_timeout_minutes),
        threshold_refresh_s: raw.threshold_refresh_s.unwrap_or(defaults.threshold_refresh_s),
        database_url: raw.database_url,
        redis_url: raw.redis_url.unwrap_or(defaults.redis_url),
    };

    if config.deadband_percent < 0.0 || config.deadband_percent >= 100.0 {
        return Err(ConfigError::InvalidValue(format!(
            "deadband_percent {} out of range [0, 100)",
            config.deadband_percent
        )));
    }
    if config.max_shelve_duration_hours <= 0.0 {
        return Err(ConfigError::InvalidValue(
            "max_shelve_duration_hours must be positive".to_owned(),
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_means_defaults() {
        let cfg = load_config_from_str("{}").unwrap();
        assert!((cfg.deadband_percent - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.flood_threshold_count, 20);
        assert_eq!(cfg.flood_threshold_seconds, 60);
        assert_eq!(cfg.stale_alarm_timeout_minutes, 30);
        assert!(cfg.shelve_requires_reason);
    }

    #[test]
    fn overrides_apply() {
        let cfg = load_config_from_str("deadband_percent: 5.0\nflood_threshold_count: 10\n").unwrap();
        assert!((cfg.deadband_percent - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.flood_threshold_count, 10);
    }

    #[test]
    fn out_of_range_deadband_is_rejected() {
        assert!(load_config_from_str("deadband_percent: 250.0").is_err());
        assert!(load_config_from_str("deadband_percent: -1.0").is_err());
    }
}
