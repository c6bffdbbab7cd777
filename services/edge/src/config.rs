//! Edge orchestrator configuration loading.
//!
//! One YAML document per edge controller: both broker endpoints, TLS
//! material for the cloud side, the buffer location and capacity, and the
//! adapter processes to supervise.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub site_id: String,
    pub block_id: String,
    pub edge_id: String,
    pub local_mqtt: LocalMqttConfig,
    pub cloud_mqtt: CloudMqttConfig,
    pub buffer: BufferConfig,
    pub heartbeat_interval_s: u64,
    pub adapters: BTreeMap<String, AdapterProcessConfig>,
}

#[derive(Debug, Clone)]
pub struct LocalMqttConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CloudMqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
    pub keepalive_s: u64,
    pub publish_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub db_path: String,
    pub max_messages: u64,
}

/// One supervised adapter subprocess.
#[derive(Debug, Clone)]
pub struct AdapterProcessConfig {
    pub command: Vec<String>,
    pub max_restarts: u32,
}

// ---------------------------------------------------------------------------
// Raw YAML types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    site_id: Option<String>,
    block_id: Option<String>,
    edge_id: Option<String>,
    local_mqtt: Option<RawLocalMqtt>,
    cloud_mqtt: Option<RawCloudMqtt>,
    buffer: Option<RawBuffer>,
    heartbeat: Option<RawHeartbeat>,
    adapters: Option<BTreeMap<String, RawAdapterProcess>>,
}

#[derive(Debug, Deserialize)]
struct RawLocalMqtt {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawCloudMqtt {
    host: Option<String>,
    port: Option<u16>,
    tls: Option<bool>,
    ca_cert: Option<String>,
    client_cert: Option<String>,
    client_key: Option<String>,
    keepalive: Option<u64>,
    publish_timeout_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBuffer {
    db_path: Option<String>,
    max_messages: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeat {
    interval_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAdapterProcess {
    cmd: Option<Vec<String>>,
    max_restarts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

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

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<EdgeConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&yaml)
}

pub fn load_config_from_str(yaml: &str) -> Result<EdgeConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let site_id = raw
        .site_id
        .ok_or_else(|| ConfigError::MissingField("site_id".to_owned()))?;
    let block_id = raw
        .block_id
        .ok_or_else(|| ConfigError::MissingField("block_id".to_owned()))?;
    let edge_id = raw
        .edge_id
        .unwrap_or_else(|| format!("edge-{}-{}", site_id, block_id));

    let local_mqtt = match raw.local_mqtt {
        Some(l) => LocalMqttConfig {
            host: l.host.unwrap_or_else(|| "localhost".to_owned()),
            port: l.port.unwrap_or(1883),
        },
        None => LocalMqttConfig {
            host: "localhost".to_owned(),
            port: 1883,
        },
    };

    let raw_cloud = raw
        .cloud_mqtt
        .ok_or_else(|| ConfigError::MissingField("cloud_mqtt".to_owned()))?;
    let cloud_mqtt = CloudMqttConfig {
        host: raw_cloud
            .host
            .ok_or_else(|| ConfigError::MissingField("cloud_mqtt.host".to_owned()))?,
        port: raw_cloud.port.unwrap_or(8883),
        tls: raw_cloud.tls.unwrap_or(true),
        ca_cert: raw_cloud
            .ca_cert
            .unwrap_or_else(|| "/etc/mcs/certs/ca.pem".to_owned()),
        client_cert: raw_cloud
            .client_cert
            .unwrap_or_else(|| "/etc/mcs/certs/edge.pem".to_owned()),
        client_key: raw_cloud
            .client_key
            .unwrap_or_else(|| "/etc/mcs/certs/edge.key".to_owned()),
        keepalive_s: raw_cloud.keepalive.unwrap_or(60),
        publish_timeout_s: raw_cloud.publish_timeout_s.unwrap_or(10),
    };

    let buffer = match raw.buffer {
        Some(b) => BufferConfig {
            db_path: b
                .db_path
                .unwrap_or_else(|| "/var/lib/mcs/message_buffer.db".to_owned()),
            max_messages: b.max_messages.unwrap_or(5_000_000),
        },
        None => BufferConfig {
            db_path: "/var/lib/mcs/message_buffer.db".to_owned(),
            max_messages: 5_000_000,
        },
    };
    if buffer.max_messages == 0 {
        return Err(ConfigError::InvalidValue(
            "buffer.max_messages must be positive".to_owned(),
        ));
    }

    let heartbeat_interval_s = raw.heartbeat.and_then(|h| h.interval_s).unwrap_or(30);

    let mut adapters = BTreeMap::new();
    if let Some(raw_adapters) = raw.adapters {
        for (name, a) in raw_adapters {
            let command = a
                .cmd
                .ok_or_else(|| ConfigError::MissingField(format!("adapters.{}.cmd", name)))?;
            if command.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "adapters.{}.cmd must not be empty",
                    name
                )));
            }
            adapters.insert(
                name,
                AdapterProcessConfig {
                    command,
                    max_restarts: a.max_restarts.unwrap_or(10),
                },
            );
        }
    }

    Ok(EdgeConfig {
        site_id,
        block_id,
        edge_id,
        local_mqtt,
        cloud_mqtt,
        buffer,
        heartbeat_interval_s,
        adapters,
    })
}
