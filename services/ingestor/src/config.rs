//! Ingestor configuration loading.
//!
//! One YAML document per site instance: broker endpoint, database and
//! redis URLs, and the batch-writer tuning knobs.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub site_id: String,
    pub mqtt: MqttConfig,
    pub database_url: String,
    pub redis_url: String,
    pub batch: BatchConfig,
    pub sensor_cache_ttl_s: u64,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_root: String,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Flush when the batch reaches this many rows.
    pub size: usize,
    /// ...or when the oldest row has waited this long.
    pub flush_interval_ms: u64,
    /// High-water mark: rows beyond this are dropped and counted.
    pub max_pending: usize,
    /// DB statement timeout for a bulk insert.
    pub insert_timeout_s: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            size: 5000,
            flush_interval_ms: 1000,
            max_pending: 50_000,
            insert_timeout_s: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    site_id: Option<String>,
    mqtt: Option<RawMqtt>,
    database_url: Option<String>,
    redis_url: Option<String>,
    batch: Option<RawBatch>,
    sensor_cache_ttl_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawMqtt {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    topic_root: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    size: Option<usize>,
    flush_interval_ms: Option<u64>,
    max_pending: Option<usize>,
    insert_timeout_s: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

pub fn load_config_from_path(path: &Path) -> Result<IngestorConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&yaml)
}

pub fn load_config_from_str(yaml: &str) -> Result<IngestorConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let site_id = raw
        .site_id
        .ok_or_else(|| ConfigError::MissingField("site_id".to_owned()))?;
    let database_url = raw
        .database_url
        .ok_or_else(|| ConfigError::MissingField("database_url".to_owned()))?;
    let redis_url = raw
        .redis_url
        .unwrap_or_else(|| "redis://localhost:6379/0".to_owned());

    let mqtt = match raw.mqtt {
        Some(m) => MqttConfig {
            host: m.host.unwrap_or_else(|| "localhost".to_owned()),
            port: m.port.unwrap_or(1883),
            client_id: m
                .client_id
                .unwrap_or_else(|| format!("ingestor-{}", site_id)),
            username: m.username,
            password: m.password,
            topic_root: m.topic_root.unwrap_or_else(|| "microlink/#".to_owned()),
        },
        None => MqttConfig {
            host: "localhost".to_owned(),
            port: 1883,
            client_id: format!("ingestor-{}", site_id),
            username: None,
            password: None,
            topic_root: "microlink/#".to_owned(),
        },
    };

    let defaults = BatchConfig::default();
    let batch = match raw.batch {
        Some(b) => BatchConfig {
            size: b.size.unwrap_or(defaults.size),
            flush_interval_ms: b.flush_interval_ms.unwrap_or(defaults.flush_interval_ms),
            max_pending: b.max_pending.unwrap_or(defaults.max_pending),
            insert_timeout_s: b.insert_timeout_s.unwrap_or(defaults.insert_timeout_s),
        },
        None => defaults,
    };
    if batch.size == 0 || batch.max_pending < batch.size {
        return Err(ConfigError::InvalidValue(
            "batch.size must be positive and no larger than batch.max_pending".to_owned(),
        ));
    }

    Ok(IngestorConfig {
        site_id,
        mqtt,
        database_url,
        redis_url,
        batch,
        sensor_cache_ttl_s: raw.sensor_cache_ttl_s.unwrap_or(300),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = load_config_from_str(
            "site_id: baldwinsville\ndatabase_url: postgres://mcs@db/mcs\n",
        )
        .unwrap();
        assert_eq!(cfg.mqtt.client_id, "ingestor-baldwinsville");
        assert_eq!(cfg.mqtt.topic_root, "microlink/#");
        assert_eq!(cfg.batch.size, 5000);
        assert_eq!(cfg.batch.max_pending, 50_000);
        assert_eq!(cfg.sensor_cache_ttl_s, 300);
    }

    #[test]
    fn database_url_is_required() {
        let err = load_config_from_str("site_id: s\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "database_url"));
    }

    #[test]
    fn high_water_below_batch_size_is_rejected() {
        let err = load_config_from_str(
            "site_id: s\ndatabase_url: postgres://x\nbatch:\n  size: 100\n  max_pending: 50\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
