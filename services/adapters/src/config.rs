//! Adapter configuration loading.
//!
//! One YAML document per adapter process enumerating the local broker,
//! poll-group intervals, and every device with its point mappings.
//!
//! # Required fields
//! - `site_id`, `block_id`
//! - At least one `devices:` entry, each with `protocol` and at least one
//!   point mapping
//!
//! Poll-group intervals and broker settings have defaults applied here, so
//! a minimal config only names the site, block, and devices.

use mcs_proto::Priority;
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level adapter configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub site_id: String,
    pub block_id: String,
    pub mqtt: MqttConfig,
    pub poll_groups: PollGroups,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_s: u64,
}

/// The four canonical poll groups and their intervals in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct PollGroups {
    pub safety_ms: u64,
    pub fast_ms: u64,
    pub normal_ms: u64,
    pub slow_ms: u64,
}

impl PollGroups {
    pub fn interval_ms(&self, group: PollGroup) -> u64 {
        match group {
            PollGroup::Safety => self.safety_ms,
            PollGroup::Fast => self.fast_ms,
            PollGroup::Normal => self.normal_ms,
            PollGroup::Slow => self.slow_ms,
        }
    }
}

impl Default for PollGroups {
    fn default() -> Self {
        PollGroups {
            safety_ms: 1000,
            fast_ms: 2000,
            normal_ms: 5000,
            slow_ms: 30000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollGroup {
    Safety,
    Fast,
    Normal,
    Slow,
}

impl PollGroup {
    pub const ALL: [PollGroup; 4] = [
        PollGroup::Safety,
        PollGroup::Fast,
        PollGroup::Normal,
        PollGroup::Slow,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safety" => Some(PollGroup::Safety),
            "fast" => Some(PollGroup::Fast),
            "normal" => Some(PollGroup::Normal),
            "slow" => Some(PollGroup::Slow),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PollGroup::Safety => "safety",
            PollGroup::Fast => "fast",
            PollGroup::Normal => "normal",
            PollGroup::Slow => "slow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    ModbusTcp,
    Snmp,
    Bacnet,
}

/// Register pair ordering for multi-register Modbus values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// AB CD — Modbus default, MSW first.
    #[default]
    Big,
    /// DC BA — full little-endian.
    Little,
    /// CD AB — big-endian bytes, words swapped.
    BigWordSwap,
    /// BA DC — little-endian bytes, words swapped.
    LittleWordSwap,
}

impl ByteOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "big" => Some(ByteOrder::Big),
            "little" => Some(ByteOrder::Little),
            "big_word_swap" => Some(ByteOrder::BigWordSwap),
            "little_word_swap" => Some(ByteOrder::LittleWordSwap),
            _ => None,
        }
    }
}

/// Modbus register data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
}

impl RegisterType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UINT16" => Some(RegisterType::Uint16),
            "INT16" => Some(RegisterType::Int16),
            "UINT32" => Some(RegisterType::Uint32),
            "INT32" => Some(RegisterType::Int32),
            "FLOAT32" => Some(RegisterType::Float32),
            _ => None,
        }
    }

    /// How many 16-bit registers this type occupies.
    pub fn register_count(self) -> u16 {
        match self {
            RegisterType::Uint16 | RegisterType::Int16 => 1,
            _ => 2,
        }
    }
}

/// SNMP primitive → double mapping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpType {
    Float,
    Int,
    Bool,
    Counter,
}

impl SnmpType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float" => Some(SnmpType::Float),
            "int" => Some(SnmpType::Int),
            "bool" => Some(SnmpType::Bool),
            "counter" => Some(SnmpType::Counter),
            _ => None,
        }
    }
}

/// BACnet object kinds the adapter reads present-value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacnetObject {
    AnalogInput,
    AnalogValue,
    BinaryInput,
    BinaryValue,
}

impl BacnetObject {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AI" => Some(BacnetObject::AnalogInput),
            "AV" => Some(BacnetObject::AnalogValue),
            "BI" => Some(BacnetObject::BinaryInput),
            "BV" => Some(BacnetObject::BinaryValue),
            _ => None,
        }
    }

    /// BACnet object-type enumeration value.
    pub fn type_id(self) -> u16 {
        match self {
            BacnetObject::AnalogInput => 0,
            BacnetObject::AnalogValue => 2,
            BacnetObject::BinaryInput => 3,
            BacnetObject::BinaryValue => 5,
        }
    }
}

/// Protocol-specific address material for one point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointAddress {
    Modbus {
        register: u32,
        data_type: RegisterType,
    },
    Snmp {
        oid: String,
        data_type: SnmpType,
        counter_scale: f64,
    },
    Bacnet {
        object: BacnetObject,
        instance: u32,
        use_cov: bool,
        cov_lifetime_s: u32,
    },
}

/// A single threshold band on a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdBand {
    pub level: BandLevel,
    pub value: f64,
    pub priority: Priority,
    pub delay_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BandLevel {
    HighHigh,
    High,
    Low,
    LowLow,
}

impl BandLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HH" => Some(BandLevel::HighHigh),
            "H" => Some(BandLevel::High),
            "L" => Some(BandLevel::Low),
            "LL" => Some(BandLevel::LowLow),
            _ => None,
        }
    }

    pub fn is_high(self) -> bool {
        matches!(self, BandLevel::HighHigh | BandLevel::High)
    }
}

/// A device point mapping: one physical reading → one telemetry tag.
#[derive(Debug, Clone, PartialEq)]
pub struct PointMapping {
    pub tag: String,
    pub description: String,
    pub subsystem: String,
    pub unit: String,
    pub scale: f64,
    pub offset: f64,
    pub range_min: f64,
    pub range_max: f64,
    pub poll_group: PollGroup,
    pub thresholds: Vec<ThresholdBand>,
    pub address: PointAddress,
}

/// A single field device and its point list.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Modbus unit/slave id.
    pub unit_id: u8,
    /// SNMP community string.
    pub community: String,
    pub byte_order: ByteOrder,
    pub timeout_s: f64,
    pub points: Vec<PointMapping>,
}

// ---------------------------------------------------------------------------
// Raw YAML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    site_id: Option<String>,
    block_id: Option<String>,
    mqtt: Option<RawMqtt>,
    polling_groups: Option<RawPollGroups>,
    devices: Option<Vec<RawDevice>>,
}

#[derive(Debug, Deserialize)]
struct RawMqtt {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    keepalive: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPollGroups {
    safety: Option<u64>,
    fast: Option<u64>,
    normal: Option<u64>,
    slow: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    name: Option<String>,
    protocol: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
    community: Option<String>,
    byte_order: Option<String>,
    timeout_s: Option<f64>,
    points: Option<Vec<RawPoint>>,
}

#[derive(Debug, Deserialize)]
struct RawPoint {
    tag: Option<String>,
    description: Option<String>,
    subsystem: Option<String>,
    unit: Option<String>,
    data_type: Option<String>,
    scale: Option<f64>,
    offset: Option<f64>,
    range_min: Option<f64>,
    range_max: Option<f64>,
    poll_group: Option<String>,
    alarm_thresholds: Option<std::collections::BTreeMap<String, RawBand>>,
    // Protocol-specific address material.
    register: Option<u32>,
    oid: Option<String>,
    counter_scale: Option<f64>,
    object: Option<String>,
    instance: Option<u32>,
    use_cov: Option<bool>,
    cov_lifetime_s: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawBand {
    value: Option<f64>,
    priority: Option<String>,
    delay_s: Option<f64>,
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

/// Load adapter config from a YAML file.
pub fn load_config_from_path(path: &Path) -> Result<AdapterConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&yaml)
}

/// Load adapter config from a YAML string.
pub fn load_config_from_str(yaml: &str) -> Result<AdapterConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let site_id = raw
        .site_id
        .ok_or_else(|| ConfigError::MissingField("site_id".to_owned()))?;
    let block_id = raw
        .block_id
        .ok_or_else(|| ConfigError::MissingField("block_id".to_owned()))?;

    let mqtt = match raw.mqtt {
        Some(m) => MqttConfig {
            host: m.host.unwrap_or_else(|| "localhost".to_owned()),
            port: m.port.unwrap_or(1883),
            client_id: m
                .client_id
                .unwrap_or_else(|| format!("adapter-{}-{}", site_id, block_id)),
            keepalive_s: m.keepalive.unwrap_or(60),
        },
        None => MqttConfig {
            host: "localhost".to_owned(),
            port: 1883,
            client_id: format!("adapter-{}-{}", site_id, block_id),
            keepalive_s: 60,
        },
    };

    let defaults = PollGroups::default();
    let poll_groups = match raw.polling_groups {
        Some(p) => PollGroups {
            safety_ms: p.safety.unwrap_or(defaults.safety_ms),
            fast_ms: p.fast.unwrap_or(defaults.fast_ms),
            normal_ms: p.normal.unwrap_or(defaults.normal_ms),
            slow_ms: p.slow.unwrap_or(defaults.slow_ms),
        },
        None => defaults,
    };

    let raw_devices = raw
        .devices
        .ok_or_else(|| ConfigError::MissingField("devices".to_owned()))?;
    if raw_devices.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one devices entry is required".to_owned(),
        ));
    }

    let mut devices = Vec::with_capacity(raw_devices.len());
    for (i, d) in raw_devices.into_iter().enumerate() {
        devices.push(validate_device(i, d)?);
    }

    Ok(AdapterConfig {
        site_id,
        block_id,
        mqtt,
        poll_groups,
        devices,
    })
}

fn validate_device(i: usize, d: RawDevice) -> Result<DeviceConfig, ConfigError> {
    let name = d
        .name
        .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].name", i)))?;
    let protocol_str = d
        .protocol
        .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].protocol", i)))?;
    let protocol = match protocol_str.as_str() {
        "modbus-tcp" => Protocol::ModbusTcp,
        "snmp" => Protocol::Snmp,
        "bacnet" => Protocol::Bacnet,
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "devices[{}].protocol '{}' (expected modbus-tcp, snmp, or bacnet)",
                i, other
            )))
        }
    };

    let host = d
        .host
        .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].host", i)))?;
    let port = d.port.unwrap_or(match protocol {
        Protocol::ModbusTcp => 502,
        Protocol::Snmp => 161,
        Protocol::Bacnet => 47808,
    });
    let timeout_s = d.timeout_s.unwrap_or(match protocol {
        Protocol::ModbusTcp => 3.0,
        Protocol::Snmp => 5.0,
        Protocol::Bacnet => 10.0,
    });

    let byte_order = match d.byte_order {
        Some(s) => ByteOrder::parse(&s).ok_or_else(|| {
            ConfigError::InvalidValue(format!("devices[{}].byte_order '{}'", i, s))
        })?,
        None => ByteOrder::Big,
    };

    let raw_points = d
        .points
        .ok_or_else(|| ConfigError::MissingField(format!("devices[{}].points", i)))?;
    if raw_points.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "devices[{}] has no point mappings",
            i
        )));
    }

    let mut points = Vec::with_capacity(raw_points.len());
    for (j, p) in raw_points.into_iter().enumerate() {
        points.push(validate_point(&name, protocol, i, j, p)?);
    }

    Ok(DeviceConfig {
        name,
        protocol,
        host,
        port,
        unit_id: d.unit_id.unwrap_or(1),
        community: d.community.unwrap_or_else(|| "public".to_owned()),
        byte_order,
        timeout_s,
        points,
    })
}

fn validate_point(
    device: &str,
    protocol: Protocol,
    i: usize,
    j: usize,
    p: RawPoint,
) -> Result<PointMapping, ConfigError> {
    let at = |field: &str| format!("devices[{}].points[{}].{}", i, j, field);

    let tag = p.tag.ok_or_else(|| ConfigError::MissingField(at("tag")))?;
    let subsystem = p
        .subsystem
        .ok_or_else(|| ConfigError::MissingField(at("subsystem")))?;
    if !mcs_proto::is_valid_subsystem(&subsystem) {
        return Err(ConfigError::InvalidValue(format!(
            "{}: unknown subsystem '{}'",
            at("subsystem"),
            subsystem
        )));
    }

    let address = match protocol {
        Protocol::ModbusTcp => {
            let register = p
                .register
                .ok_or_else(|| ConfigError::MissingField(at("register")))?;
            let ty_str = p.data_type.unwrap_or_else(|| "FLOAT32".to_owned());
            let data_type = RegisterType::parse(&ty_str).ok_or_else(|| {
                ConfigError::InvalidValue(format!("{}: '{}'", at("data_type"), ty_str))
            })?;
            PointAddress::Modbus {
                register,
                data_type,
            }
        }
        Protocol::Snmp => {
            let oid = p.oid.ok_or_else(|| ConfigError::MissingField(at("oid")))?;
            let ty_str = p.data_type.unwrap_or_else(|| "float".to_owned());
            let data_type = SnmpType::parse(&ty_str).ok_or_else(|| {
                ConfigError::InvalidValue(format!("{}: '{}'", at("data_type"), ty_str))
            })?;
            PointAddress::Snmp {
                oid,
                data_type,
                counter_scale: p.counter_scale.unwrap_or(1.0),
            }
        }
        Protocol::Bacnet => {
            let obj_str = p
                .object
                .ok_or_else(|| ConfigError::MissingField(at("object")))?;
            let object = BacnetObject::parse(&obj_str).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "{}: '{}' (expected AI, AV, BI, or BV)",
                    at("object"),
                    obj_str
                ))
            })?;
            let instance = p
                .instance
                .ok_or_else(|| ConfigError::MissingField(at("instance")))?;
            PointAddress::Bacnet {
                object,
                instance,
                use_cov: p.use_cov.unwrap_or(false),
                cov_lifetime_s: p.cov_lifetime_s.unwrap_or(300),
            }
        }
    };

    let poll_group = match p.poll_group {
        Some(s) => PollGroup::parse(&s).ok_or_else(|| {
            ConfigError::InvalidValue(format!("{}: '{}'", at("poll_group"), s))
        })?,
        None => PollGroup::Normal,
    };

    let mut thresholds = Vec::new();
    if let Some(raw_bands) = p.alarm_thresholds {
        for (level_str, band) in raw_bands {
            let level = BandLevel::parse(&level_str).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "{}: unknown band level '{}' on {}/{}",
                    at("alarm_thresholds"),
                    level_str,
                    device,
                    tag
                ))
            })?;
            let value = band
                .value
                .ok_or_else(|| ConfigError::MissingField(format!("{}.{}.value", at("alarm_thresholds"), level_str)))?;
            let priority_str = band.priority.unwrap_or_else(|| "P2".to_owned());
            let priority = Priority::parse(&priority_str).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "{}.{}.priority '{}'",
                    at("alarm_thresholds"),
                    level_str,
                    priority_str
                ))
            })?;
            thresholds.push(ThresholdBand {
                level,
                value,
                priority,
                delay_s: band.delay_s.unwrap_or(0.0),
            });
        }
    }

    Ok(PointMapping {
        tag,
        description: p.description.unwrap_or_default(),
        subsystem,
        unit: p.unit.unwrap_or_default(),
        scale: p.scale.unwrap_or(1.0),
        offset: p.offset.unwrap_or(0.0),
        range_min: p.range_min.unwrap_or(-1e9),
        range_max: p.range_max.unwrap_or(1e9),
        poll_group,
        thresholds,
        address,
    })
}
