//! ISA-18.2 alarm state machine.
//!
//! One [`AlarmInstance`] per sensor, carrying the full lifecycle: raise,
//! acknowledge, return-to-normal, shelve, cascade suppression.  Every
//! method returns a [`Transition`] so the engine knows whether to
//! persist, audit, and publish.
//!
//! ```text
//!   CLEARED --raise-->  ACTIVE
//!   ACTIVE  --ack-->    ACKED
//!   ACTIVE  --clear--> RTN_UNACK
//!   ACKED   --clear--> CLEARED
//!   RTN_UNACK --ack--> CLEARED
//!   (ACTIVE|ACKED|RTN_UNACK|SUPPRESSED) --shelve--> SHELVED
//!   SHELVED --unshelve--> CLEARED
//!   (ACTIVE|ACKED) --cascade suppress--> SUPPRESSED
//!   SUPPRESSED --cascade release--> CLEARED
//! ```

use chrono::{DateTime, Duration, Utc};
use mcs_proto::{AlarmSnapshot, Priority, ThresholdDirection};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// States and transition results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Cleared,
    Active,
    Acked,
    RtnUnack,
    Shelved,
    Suppressed,
}

impl AlarmState {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmState::Cleared => "CLEARED",
            AlarmState::Active => "ACTIVE",
            AlarmState::Acked => "ACKED",
            AlarmState::RtnUnack => "RTN_UNACK",
            AlarmState::Shelved => "SHELVED",
            AlarmState::Suppressed => "SUPPRESSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLEARED" => Some(AlarmState::Cleared),
            "ACTIVE" => Some(AlarmState::Active),
            "ACKED" => Some(AlarmState::Acked),
            "RTN_UNACK" => Some(AlarmState::RtnUnack),
            "SHELVED" => Some(AlarmState::Shelved),
            "SUPPRESSED" => Some(AlarmState::Suppressed),
            _ => None,
        }
    }
}

/// Outcome of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed; persist, audit, publish.
    Ok,
    /// Input accepted but no state change (value update, repeated ack).
    NoChange,
    /// Input not legal in the current state.
    Invalid,
}

/// Why a shelve request was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShelveError {
    #[error("shelve requires a reason")]
    ReasonRequired,
    #[error("cannot shelve an alarm in state {0}")]
    InvalidState(&'static str),
}

/// A successful shelve, noting whether the duration was clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShelveOutcome {
    pub clamped: bool,
    pub effective_hours: f64,
}

// ---------------------------------------------------------------------------
// AlarmInstance
// ---------------------------------------------------------------------------

/// A single alarm's mutable lifecycle object.
///
/// Invariant: the engine holds at most one non-CLEARED instance per
/// sensor; a future excursion after CLEARED starts a fresh instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmInstance {
    pub sensor_id: i64,
    pub priority: Priority,
    pub state: AlarmState,

    pub site_id: String,
    pub block_id: String,
    pub subsystem: String,
    pub tag: String,

    pub value_at_raise: Option<f64>,
    pub value_at_clear: Option<f64>,
    pub threshold_value: Option<f64>,
    pub threshold_direction: Option<ThresholdDirection>,

    pub raised_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub acked_by: Option<String>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub shelved_at: Option<DateTime<Utc>>,
    pub shelved_by: Option<String>,
    pub shelved_until: Option<DateTime<Utc>>,
    pub shelve_reason: Option<String>,
    pub suppressed_by_sensor_id: Option<i64>,

    pub transition_count: u64,
    pub last_value: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl AlarmInstance {
    pub fn new(
        sensor_id: i64,
        priority: Priority,
        site_id: &str,
        block_id: &str,
        subsystem: &str,
        tag: &str,
    ) -> Self {
        AlarmInstance {
            sensor_id,
            priority,
            state: AlarmState::Cleared,
            site_id: site_id.to_owned(),
            block_id: block_id.to_owned(),
            subsystem: subsystem.to_owned(),
            tag: tag.to_owned(),
            value_at_raise: None,
            value_at_clear: None,
            threshold_value: None,
            threshold_direction: None,
            raised_at: None,
            acked_at: None,
            acked_by: None,
            cleared_at: None,
            shelved_at: None,
            shelved_by: None,
            shelved_until: None,
            shelve_reason: None,
            suppressed_by_sensor_id: None,
            transition_count: 0,
            last_value: None,
            last_seen: None,
        }
    }

    fn touch(&mut self, value: f64, now: DateTime<Utc>) {
        self.last_value = Some(value);
        self.last_seen = Some(now);
    }

    /// Transition to ACTIVE.  Valid from CLEARED and RTN_UNACK; alarming
    /// states just record the value.
    pub fn raise(
        &mut self,
        value: f64,
        now: DateTime<Utc>,
        threshold: Option<f64>,
        direction: Option<ThresholdDirection>,
    ) -> Transition {
        self.touch(value, now);
        match self.state {
            AlarmState::Active | AlarmState::Acked | AlarmState::Shelved | AlarmState::Suppressed => {
                Transition::NoChange
            }
            AlarmState::Cleared | AlarmState::RtnUnack => {
                self.state = AlarmState::Active;
                self.value_at_raise = Some(value);
                self.raised_at = Some(now);
                self.cleared_at = None;
                self.acked_at = None;
                self.acked_by = None;
                self.threshold_value = threshold;
                self.threshold_direction = direction;
                self.transition_count += 1;
                info!(
                    sensor_id = self.sensor_id,
                    tag = %self.tag,
                    priority = %self.priority,
                    value,
                    "alarm raised"
                );
                Transition::Ok
            }
        }
    }

    /// Operator acknowledgement.  ACTIVE → ACKED; RTN_UNACK → CLEARED.
    pub fn acknowledge(&mut self, operator: &str, now: DateTime<Utc>) -> Transition {
        match self.state {
            AlarmState::Active => {
                self.state = AlarmState::Acked;
                self.acked_at = Some(now);
                self.acked_by = Some(operator.to_owned());
                self.transition_count += 1;
                info!(sensor_id = self.sensor_id, operator, "alarm acknowledged");
                Transition::Ok
            }
            AlarmState::RtnUnack => {
                self.state = AlarmState::Cleared;
                self.acked_at = Some(now);
                self.acked_by = Some(operator.to_owned());
                self.transition_count += 1;
                info!(sensor_id = self.sensor_id, operator, "alarm acknowledged and cleared");
                Transition::Ok
            }
            _ => {
                debug!(sensor_id = self.sensor_id, state = self.state.as_str(), "ack ignored");
                Transition::NoChange
            }
        }
    }

    /// The value has returned to normal (deadband already applied by the
    /// caller).  ACKED → CLEARED; ACTIVE → RTN_UNACK.
    pub fn clear_condition(&mut self, value: f64, now: DateTime<Utc>) -> Transition {
        self.touch(value, now);
        match self.state {
            AlarmState::Acked => {
                self.state = AlarmState::Cleared;
                self.value_at_clear = Some(value);
                self.cleared_at = Some(now);
                self.transition_count += 1;
                info!(sensor_id = self.sensor_id, "alarm cleared");
                Transition::Ok
            }
            AlarmState::Active => {
                self.state = AlarmState::RtnUnack;
                self.value_at_clear = Some(value);
                self.cleared_at = Some(now);
                self.transition_count += 1;
                info!(sensor_id = self.sensor_id, "alarm returned to normal, awaiting ack");
                Transition::Ok
            }
            _ => Transition::NoChange,
        }
    }

    /// Operator shelve.  Duration is clamped to the configured maximum;
    /// a reason is required when the config says so.
    pub fn shelve(
        &mut self,
        operator: &str,
        reason: &str,
        duration_hours: f64,
        now: DateTime<Utc>,
        config: &EngineConfig,
    ) -> Result<ShelveOutcome, ShelveError> {
        match self.state {
            AlarmState::Cleared => return Err(ShelveError::InvalidState("CLEARED")),
            AlarmState::Shelved => return Err(ShelveError::InvalidState("SHELVED")),
            _ => {}
        }
        if config.shelve_requires_reason && reason.trim().is_empty() {
            warn!(sensor_id = self.sensor_id, "shelve rejected, reason required");
            return Err(ShelveError::ReasonRequired);
        }

        let requested = if duration_hours > 0.0 {
            duration_hours
        } else {
            config.default_shelve_duration_hours
        };
        let clamped = requested > config.max_shelve_duration_hours;
        let effective = requested.min(config.max_shelve_duration_hours);

        self.state = AlarmState::Shelved;
        self.shelved_at = Some(now);
        self.shelved_by = Some(operator.to_owned());
        self.shelved_until = Some(now + Duration::seconds((effective * 3600.0) as i64));
        self.shelve_reason = Some(reason.to_owned());
        self.transition_count += 1;

        info!(
            sensor_id = self.sensor_id,
            operator,
            hours = effective,
            clamped,
            "alarm shelved"
        );
        Ok(ShelveOutcome {
            clamped,
            effective_hours: effective,
        })
    }

    /// Unshelve — timer expiry or manual.  Lands in CLEARED; the engine
    /// re-evaluates on the next matching signal.
    pub fn unshelve(&mut self, _now: DateTime<Utc>) -> Transition {
        if self.state != AlarmState::Shelved {
            return Transition::NoChange;
        }
        self.state = AlarmState::Cleared;
        self.shelved_at = None;
        self.shelved_by = None;
        self.shelved_until = None;
        self.shelve_reason = None;
        self.transition_count += 1;
        info!(sensor_id = self.sensor_id, "alarm unshelved");
        Transition::Ok
    }

    /// Cascade suppression.  Valid from ACTIVE and ACKED.
    pub fn suppress(&mut self, cause_sensor_id: i64, _now: DateTime<Utc>) -> Transition {
        match self.state {
            AlarmState::Active | AlarmState::Acked => {
                let prev = self.state;
                self.state = AlarmState::Suppressed;
                self.suppressed_by_sensor_id = Some(cause_sensor_id);
                self.transition_count += 1;
                info!(
                    sensor_id = self.sensor_id,
                    was = prev.as_str(),
                    cause = cause_sensor_id,
                    "alarm suppressed by cascade"
                );
                Transition::Ok
            }
            _ => Transition::NoChange,
        }
    }

    /// Cascade release when the cause clears.  Lands in CLEARED; the
    /// engine re-evaluates on the next matching signal rather than
    /// re-raising on the spot.
    pub fn release_suppression(&mut self, _now: DateTime<Utc>) -> Transition {
        if self.state != AlarmState::Suppressed {
            return Transition::NoChange;
        }
        self.state = AlarmState::Cleared;
        self.suppressed_by_sensor_id = None;
        self.transition_count += 1;
        info!(sensor_id = self.sensor_id, "cascade suppression released");
        Transition::Ok
    }

    /// Force-clear an alarm whose sensor went quiet (stale sweep).
    /// Valid from ACTIVE and ACKED.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Transition {
        match self.state {
            AlarmState::Active | AlarmState::Acked => {
                self.state = AlarmState::Cleared;
                self.cleared_at = Some(now);
                self.transition_count += 1;
                warn!(
                    sensor_id = self.sensor_id,
                    tag = %self.tag,
                    "stale alarm force-cleared"
                );
                Transition::Ok
            }
            _ => Transition::NoChange,
        }
    }

    /// Standing = demanding operator attention right now.
    pub fn is_standing(&self) -> bool {
        matches!(self.state, AlarmState::Active | AlarmState::RtnUnack)
    }

    /// Wire/API snapshot.
    pub fn snapshot(&self) -> AlarmSnapshot {
        let fmt = |t: &Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339());
        AlarmSnapshot {
            sensor_id: self.sensor_id,
            priority: self.priority,
            state: self.state.as_str().to_owned(),
            site_id: self.site_id.clone(),
            block_id: self.block_id.clone(),
            subsystem: self.subsystem.clone(),
            tag: self.tag.clone(),
            value_at_raise: self.value_at_raise,
            value_at_clear: self.value_at_clear,
            threshold_value: self.threshold_value,
            threshold_direction: self.threshold_direction,
            raised_at: fmt(&self.raised_at),
            acked_at: fmt(&self.acked_at),
            acked_by: self.acked_by.clone(),
            cleared_at: fmt(&self.cleared_at),
            shelved_at: fmt(&self.shelved_at),
            shelved_by: self.shelved_by.clone(),
            shelved_until: fmt(&self.shelved_until),
            shelve_reason: self.shelve_reason.clone(),
            suppressed_by_sensor_id: self.suppressed_by_sensor_id,
            transition_count: self.transition_count,
            last_value: self.last_value,
            last_seen: fmt(&self.last_seen),
        }
    }
}
