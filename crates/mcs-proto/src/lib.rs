// mcs-proto: MCS wire contracts and serialization.
//
// Everything that crosses a broker topic or a pub/sub channel is defined
// here: topic grammar, telemetry payloads, alarm events, heartbeats,
// commands, and the channel message types exchanged between the ingestor
// and the alarm engine.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

/// Measurement quality flag.
///
/// Serialized as `"GOOD" | "UNCERTAIN" | "BAD"` on the wire; stored as a
/// small integer (0/1/2) in the telemetry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    #[default]
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    /// Storage encoding: 0=GOOD, 1=UNCERTAIN, 2=BAD.
    pub fn as_int(self) -> i16 {
        match self {
            Quality::Good => 0,
            Quality::Uncertain => 1,
            Quality::Bad => 2,
        }
    }

    pub fn from_int(v: i16) -> Option<Self> {
        match v {
            0 => Some(Quality::Good),
            1 => Some(Quality::Uncertain),
            2 => Some(Quality::Bad),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Alarm priority, P0 (critical) through P3 (informational).
///
/// Ordering follows severity: `P0 < P1 < P2 < P3`, so `P0` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P0" => Some(Priority::P0),
            "P1" => Some(Priority::P1),
            "P2" => Some(Priority::P2),
            "P3" => Some(Priority::P3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Alarm edge actions and threshold direction
// ---------------------------------------------------------------------------

/// Edge-detected alarm transition published by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmAction {
    Raised,
    Escalated,
    Cleared,
}

/// Which side of a threshold an alarm fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThresholdDirection {
    High,
    Low,
    Bool,
}

impl ThresholdDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdDirection::High => "HIGH",
            ThresholdDirection::Low => "LOW",
            ThresholdDirection::Bool => "BOOL",
        }
    }
}

// ---------------------------------------------------------------------------
// Topic grammar
// ---------------------------------------------------------------------------

/// The closed set of valid subsystem segments.
pub const SUBSYSTEMS: [&str; 10] = [
    "electrical",
    "thermal-l1",
    "thermal-l2",
    "thermal-l3",
    "thermal-reject",
    "thermal-safety",
    "environmental",
    "network",
    "security",
    "host-bms",
];

pub fn is_valid_subsystem(s: &str) -> bool {
    SUBSYSTEMS.contains(&s)
}

fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

fn is_tag(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Why a topic failed to parse.  `UnknownSubsystem` means the shape was
/// fine but the subsystem segment is not in the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    BadShape,
    UnknownSubsystem(String),
}

impl std::fmt::Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicError::BadShape => write!(
                f,
                "topic does not match microlink/{{site}}/{{block}}/{{subsystem}}/{{tag}}"
            ),
            TopicError::UnknownSubsystem(s) => write!(f, "unknown subsystem '{}'", s),
        }
    }
}

impl std::error::Error for TopicError {}

/// A parsed telemetry topic `microlink/{site}/{block}/{subsystem}/{tag}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TelemetryTopic {
    pub site: String,
    pub block: String,
    pub subsystem: String,
    pub tag: String,
}

impl TelemetryTopic {
    /// Parse a topic string against the telemetry contract.
    ///
    /// Character classes: `[a-z0-9_-]+` for site/block/subsystem,
    /// `[A-Za-z0-9_-]+` for the tag.  The subsystem must be in the closed
    /// set; anything else is a `TopicError`.
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        let mut parts = topic.split('/');
        let (root, site, block, subsystem, tag) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(r), Some(s), Some(b), Some(sub), Some(t), None) => (r, s, b, sub, t),
            _ => return Err(TopicError::BadShape),
        };

        if root != "microlink" || !is_slug(site) || !is_slug(block) || !is_slug(subsystem) || !is_tag(tag) {
            return Err(TopicError::BadShape);
        }
        if !is_valid_subsystem(subsystem) {
            return Err(TopicError::UnknownSubsystem(subsystem.to_owned()));
        }

        Ok(TelemetryTopic {
            site: site.to_owned(),
            block: block.to_owned(),
            subsystem: subsystem.to_owned(),
            tag: tag.to_owned(),
        })
    }

    pub fn to_topic_string(&self) -> String {
        telemetry_topic(&self.site, &self.block, &self.subsystem, &self.tag)
    }
}

/// Build a telemetry topic string.
pub fn telemetry_topic(site: &str, block: &str, subsystem: &str, tag: &str) -> String {
    format!("microlink/{}/{}/{}/{}", site, block, subsystem, tag)
}

/// Build an alarm event topic string.
pub fn alarm_topic(site: &str, block: &str, priority: Priority) -> String {
    format!("microlink/{}/{}/alarms/{}", site, block, priority)
}

/// Build the retained edge heartbeat topic.
pub fn heartbeat_topic(site: &str, block: &str) -> String {
    format!("microlink/{}/{}/edge/heartbeat", site, block)
}

/// Build a command topic for a given command kind.
pub fn command_topic(site: &str, block: &str, kind: &str) -> String {
    format!("microlink/{}/{}/command/{}", site, block, kind)
}

/// Build the command response topic.
pub fn command_response_topic(site: &str, block: &str) -> String {
    format!("microlink/{}/{}/command/response", site, block)
}

/// True if a topic belongs to the command family (these flow cloud→edge and
/// must not be forwarded back up by the bridge).
pub fn is_command_topic(topic: &str) -> bool {
    topic.contains("/command/")
}

// ---------------------------------------------------------------------------
// Telemetry payload
// ---------------------------------------------------------------------------

/// Telemetry message payload.
///
/// ```json
/// { "ts": "2026-02-21T10:30:00.000Z", "v": 45.2, "u": "degC",
///   "q": "GOOD", "alarm": null, "seq": 812 }
/// ```
///
/// `q` defaults to GOOD and `alarm` to null when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// ISO-8601 timestamp with timezone.
    pub ts: String,
    /// Measured value; must be finite.
    pub v: f64,
    /// Engineering unit, optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(default)]
    pub q: Quality,
    /// Alarm rider: the priority of a band crossing observed at source.
    ///
    /// Kept as a raw string so an unknown priority does not reject the
    /// message — the telemetry is still valid; consumers count the bad
    /// rider and move on.  Use [`TelemetryPayload::alarm_priority`].
    #[serde(default)]
    pub alarm: Option<String>,
    /// Per-tag monotonic sequence number for drop detection.
    #[serde(default)]
    pub seq: u64,
}

/// Why a telemetry payload failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    NonFiniteValue,
    BadTimestamp(String),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::NonFiniteValue => write!(f, "value is NaN or infinite"),
            PayloadError::BadTimestamp(ts) => write!(f, "timestamp '{}' is not ISO-8601 with timezone", ts),
        }
    }
}

impl std::error::Error for PayloadError {}

impl TelemetryPayload {
    /// Validate the contract beyond what serde enforces: `v` finite, `ts`
    /// parsable as an RFC 3339 instant with timezone.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if !self.v.is_finite() {
            return Err(PayloadError::NonFiniteValue);
        }
        if chrono::DateTime::parse_from_rfc3339(&self.ts).is_err() {
            return Err(PayloadError::BadTimestamp(self.ts.clone()));
        }
        Ok(())
    }

    /// Parse the `ts` field into a UTC instant.  Call `validate` first.
    pub fn timestamp_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    /// The alarm rider as a typed priority, if present and valid.
    pub fn alarm_priority(&self) -> Option<Priority> {
        self.alarm.as_deref().and_then(Priority::parse)
    }

    /// True when the rider is present but not one of P0..P3.
    pub fn has_invalid_alarm(&self) -> bool {
        matches!(&self.alarm, Some(s) if Priority::parse(s).is_none())
    }
}

// ---------------------------------------------------------------------------
// Alarm event payload (adapter → broker)
// ---------------------------------------------------------------------------

/// Alarm edge event published by adapters to
/// `microlink/{site}/{block}/alarms/{priority}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEventPayload {
    pub ts: String,
    pub alarm_id: String,
    pub action: AlarmAction,
    pub priority: Priority,
    pub sensor_tag: String,
    pub subsystem: String,
    pub value: f64,
    pub threshold: f64,
    pub direction: ThresholdDirection,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Heartbeat payload (edge orchestrator → broker, retained)
// ---------------------------------------------------------------------------

/// Status snapshot for one supervised adapter process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub status: String,
    pub pid: Option<u32>,
    pub restarts: u32,
}

/// Store-and-forward buffer snapshot carried in the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub depth: u64,
    pub capacity: u64,
    pub oldest_ts: Option<String>,
    pub cloud_connected: bool,
    pub replay_active: bool,
}

/// Edge host health sampled for the heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub disk_pct: f32,
    pub temp_c: f32,
}

/// Retained heartbeat published every 30 s to
/// `microlink/{site}/{block}/edge/heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ts: String,
    pub edge_id: String,
    pub uptime_s: u64,
    pub adapters: std::collections::BTreeMap<String, AdapterStatus>,
    pub buffer: BufferStats,
    pub system: SystemHealth,
}

// ---------------------------------------------------------------------------
// Commands (cloud → edge)
// ---------------------------------------------------------------------------

/// A cloud-originated command delivered on
/// `microlink/{site}/{block}/command/{kind}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub cmd: String,
    pub request_id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Accepted,
    Rejected,
    Error,
}

/// Response posted to `microlink/{site}/{block}/command/response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ts: String,
    pub request_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Alarm channel messages (ingestor → engine → subscribers)
// ---------------------------------------------------------------------------

/// Channel key for alarm signals flowing into the engine.
pub const ALARMS_INBOUND_CHANNEL: &str = "mcs:alarms:inbound";

/// Channel key for alarm lifecycle events flowing out to subscribers.
pub const ALARMS_OUTBOUND_CHANNEL: &str = "mcs:alarms:outbound";

/// Per-block live telemetry channel key.
pub fn telemetry_channel(block: &str) -> String {
    format!("mcs:telemetry:{}", block)
}

/// An alarm observation extracted by the ingestor: the measurement crossed
/// a band at source.  Not an alarm in itself — the engine owns lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSignal {
    pub sensor_id: i64,
    pub priority: Priority,
    pub value: f64,
    pub timestamp: String,
    pub site_id: String,
    pub block_id: String,
    pub subsystem: String,
    pub tag: String,
}

/// Full alarm-instance snapshot carried on the outbound channel and
/// returned by operator actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmSnapshot {
    pub sensor_id: i64,
    pub priority: Priority,
    pub state: String,
    pub site_id: String,
    pub block_id: String,
    pub subsystem: String,
    pub tag: String,
    pub value_at_raise: Option<f64>,
    pub value_at_clear: Option<f64>,
    pub threshold_value: Option<f64>,
    pub threshold_direction: Option<ThresholdDirection>,
    pub raised_at: Option<String>,
    pub acked_at: Option<String>,
    pub acked_by: Option<String>,
    pub cleared_at: Option<String>,
    pub shelved_at: Option<String>,
    pub shelved_by: Option<String>,
    pub shelved_until: Option<String>,
    pub shelve_reason: Option<String>,
    pub suppressed_by_sensor_id: Option<i64>,
    pub transition_count: u64,
    pub last_value: Option<f64>,
    pub last_seen: Option<String>,
}

/// Lifecycle event published on `mcs:alarms:outbound`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEventOut {
    pub event: String,
    pub alarm: AlarmSnapshot,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Subscriber filtering
// ---------------------------------------------------------------------------

/// Optional block and minimum-priority filter applied by subscribers on
/// the client side after receiving the raw channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberFilter {
    pub block: Option<String>,
    pub min_priority: Option<Priority>,
}

impl SubscriberFilter {
    /// True if the event passes this filter.  `min_priority = P2` admits
    /// P0, P1, and P2 (severity ordering: P0 sorts lowest).
    pub fn matches(&self, event: &AlarmEventOut) -> bool {
        if let Some(block) = &self.block {
            if event.alarm.block_id != *block {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if event.alarm.priority > min {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Dead-letter categories
// ---------------------------------------------------------------------------

/// Frozen dead-letter error categories.
pub mod dlq_categories {
    pub const TOPIC_ERROR: &str = "TOPIC_ERROR";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const SENSOR_UNKNOWN: &str = "SENSOR_UNKNOWN";
    pub const VALUE_ERROR: &str = "VALUE_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}
