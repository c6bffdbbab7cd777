//! Cascade suppression.
//!
//! When a root-cause alarm fires (pump trip, mains loss, leak detection),
//! downstream effect alarms are suppressed so operators see the cause,
//! not the flood of consequences.  Rules are compiled once at startup;
//! tag patterns are anchored full matches.

use regex::Regex;
use std::collections::HashMap;
use tracing::info;

use crate::state::{AlarmInstance, AlarmState, Transition};

/// One suppression relationship, as configured.
#[derive(Debug, Clone)]
pub struct CascadeRule {
    pub cause_tag_pattern: String,
    pub cause_subsystem: String,
    pub effect_tag_patterns: Vec<String>,
    pub effect_subsystems: Vec<String>,
    pub description: String,
}

/// Default rules for a 1 MW block.
pub fn default_rules() -> Vec<CascadeRule> {
    vec![
        CascadeRule {
            cause_tag_pattern: r"ML-PUMP-[AB]-SPEED".to_owned(),
            cause_subsystem: "thermal-l2".to_owned(),
            effect_tag_patterns: vec![
                r"ML-FLOW".to_owned(),
                r"PHX-01-.*".to_owned(),
                r"HOST-FLOW".to_owned(),
            ],
            effect_subsystems: vec!["thermal-l2".to_owned(), "thermal-l3".to_owned()],
            description: "Primary pump trip suppresses downstream flow and heat exchanger alarms"
                .to_owned(),
        },
        CascadeRule {
            cause_tag_pattern: r"CDU-\d{2}-PUMP-SPEED".to_owned(),
            cause_subsystem: "thermal-l1".to_owned(),
            effect_tag_patterns: vec![
                r"CDU-\d{2}-FLOW".to_owned(),
                r"CDU-\d{2}-P-DIFF".to_owned(),
                r"RK-\d{2}-T-OUT".to_owned(),
            ],
            effect_subsystems: vec!["thermal-l1".to_owned()],
            description: "CDU pump trip suppresses CDU flow, pressure, and rack outlet temp alarms"
                .to_owned(),
        },
        CascadeRule {
            cause_tag_pattern: r"V-MSB-L[123]".to_owned(),
            cause_subsystem: "electrical".to_owned(),
            effect_tag_patterns: vec![r"UPS-\d{2}-.*".to_owned(), r"P-MSB-TOTAL".to_owned()],
            effect_subsystems: vec!["electrical".to_owned()],
            description: "Mains voltage loss suppresses UPS and power meter alarms".to_owned(),
        },
        CascadeRule {
            cause_tag_pattern: r"LSH-0[12]-LEAK-.*".to_owned(),
            cause_subsystem: "thermal-safety".to_owned(),
            effect_tag_patterns: vec![r".*-FLOW".to_owned(), r".*-P-.*".to_owned()],
            effect_subsystems: vec![
                "thermal-l1".to_owned(),
                "thermal-l2".to_owned(),
                "thermal-l3".to_owned(),
            ],
            description: "Leak detection suppresses flow and pressure alarms".to_owned(),
        },
        CascadeRule {
            cause_tag_pattern: r"WAN-.*|VPN-STATUS".to_owned(),
            cause_subsystem: "network".to_owned(),
            effect_tag_patterns: vec![r"SW-\d{2}-.*".to_owned()],
            effect_subsystems: vec!["network".to_owned()],
            description: "WAN/VPN loss suppresses switch alarms (unreachable, not failed)"
                .to_owned(),
        },
    ]
}

struct CompiledRule {
    rule: CascadeRule,
    cause: Regex,
    effects: Vec<Regex>,
}

#[derive(Debug, thiserror::Error)]
#[error("bad cascade pattern '{pattern}': {source}")]
pub struct RuleCompileError {
    pattern: String,
    source: regex::Error,
}

fn anchored(pattern: &str) -> Result<Regex, RuleCompileError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| RuleCompileError {
        pattern: pattern.to_owned(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// CascadeEngine
// ---------------------------------------------------------------------------

pub struct CascadeEngine {
    rules: Vec<CompiledRule>,
    suppressions: u64,
    releases: u64,
}

impl CascadeEngine {
    /// Compile the rule set.  Done once at startup, outside the hot path.
    pub fn new(rules: Vec<CascadeRule>) -> Result<Self, RuleCompileError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let cause = anchored(&rule.cause_tag_pattern)?;
            let effects = rule
                .effect_tag_patterns
                .iter()
                .map(|p| anchored(p))
                .collect::<Result<Vec<_>, _>>()?;
            compiled.push(CompiledRule {
                rule,
                cause,
                effects,
            });
        }
        Ok(CascadeEngine {
            rules: compiled,
            suppressions: 0,
            releases: 0,
        })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn suppression_count(&self) -> u64 {
        self.suppressions
    }

    /// A raised cause suppresses every matching non-CLEARED,
    /// non-SUPPRESSED effect alarm.  Returns the suppressed sensor ids.
    pub fn on_alarm_raised(
        &mut self,
        cause_sensor_id: i64,
        cause_subsystem: &str,
        cause_tag: &str,
        now: chrono::DateTime<chrono::Utc>,
        alarms: &mut HashMap<i64, AlarmInstance>,
    ) -> Vec<i64> {
        let mut suppressed = Vec::new();

        for compiled in &self.rules {
            if cause_subsystem != compiled.rule.cause_subsystem {
                continue;
            }
            if !compiled.cause.is_match(cause_tag) {
                continue;
            }

            for (sensor_id, alarm) in alarms.iter_mut() {
                if *sensor_id == cause_sensor_id {
                    continue;
                }
                if matches!(alarm.state, AlarmState::Cleared | AlarmState::Suppressed) {
                    continue;
                }
                if !compiled
                    .rule
                    .effect_subsystems
                    .iter()
                    .any(|s| s == &alarm.subsystem)
                {
                    continue;
                }
                if compiled.effects.iter().any(|re| re.is_match(&alarm.tag)) {
                    if alarm.suppress(cause_sensor_id, now) == Transition::Ok {
                        suppressed.push(*sensor_id);
                        self.suppressions += 1;
                    }
                }
            }
        }

        if !suppressed.is_empty() {
            info!(
                cause = cause_tag,
                subsystem = cause_subsystem,
                count = suppressed.len(),
                "cascade suppressed downstream alarms"
            );
        }
        suppressed
    }

    /// A cleared cause releases every alarm it suppressed.  Returns the
    /// released sensor ids; the engine re-evaluates them on their next
    /// signal rather than re-raising here.
    pub fn on_alarm_cleared(
        &mut self,
        cause_sensor_id: i64,
        now: chrono::DateTime<chrono::Utc>,
        alarms: &mut HashMap<i64, AlarmInstance>,
    ) -> Vec<i64> {
        let mut released = Vec::new();

        for (sensor_id, alarm) in alarms.iter_mut() {
            if alarm.state != AlarmState::Suppressed {
                continue;
            }
            if alarm.suppressed_by_sensor_id != Some(cause_sensor_id) {
                continue;
            }
            if alarm.release_suppression(now) == Transition::Ok {
                released.push(*sensor_id);
                self.releases += 1;
            }
        }

        if !released.is_empty() {
            info!(
                cause = cause_sensor_id,
                count = released.len(),
                "cascade released suppressed alarms for re-evaluation"
            );
        }
        released
    }

    /// Would a new alarm on `(subsystem, tag)` be an effect of a cause
    /// that is already ACTIVE or ACKED?  Returns that cause's sensor id.
    pub fn would_be_suppressed(
        &self,
        subsystem: &str,
        tag: &str,
        alarms: &HashMap<i64, AlarmInstance>,
    ) -> Option<i64> {
        for compiled in &self.rules {
            if !compiled
                .rule
                .effect_subsystems
                .iter()
                .any(|s| s == subsystem)
            {
                continue;
            }
            if !compiled.effects.iter().any(|re| re.is_match(tag)) {
                continue;
            }

            for alarm in alarms.values() {
                if !matches!(alarm.state, AlarmState::Active | AlarmState::Acked) {
                    continue;
                }
                if alarm.subsystem != compiled.rule.cause_subsystem {
                    continue;
                }
                if compiled.cause.is_match(&alarm.tag) {
                    return Some(alarm.sensor_id);
                }
            }
        }
        None
    }
}
