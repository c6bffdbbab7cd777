//! The alarm engine proper.
//!
//! Consumes alarm signals from the inbound channel, owns the alarm-state
//! map, and emits lifecycle events on the outbound channel.  All
//! transitions for a sensor are serialized through the alarm map's mutex;
//! cascade scans traverse the map under the same lock.

use chrono::{DateTime, Duration, Utc};
use mcs_proto::{AlarmEventOut, AlarmSignal, AlarmSnapshot, Priority, ThresholdDirection};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cascade::{CascadeEngine, CascadeRule, RuleCompileError};
use crate::config::EngineConfig;
use crate::fanout::EventPublisher;
use crate::flood::{FloodDecision, FloodDetector};
use crate::persistence::AlarmStore;
use crate::state::{AlarmInstance, AlarmState, ShelveError, Transition};
use crate::threshold::{SensorThresholds, ThresholdDef, ThresholdRegistry};

// ---------------------------------------------------------------------------
// Operator API types
// ---------------------------------------------------------------------------

/// Why an operator action did not change anything.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperatorError {
    #[error("no alarm instance for this sensor")]
    NotFound,
    /// The action does not apply in the current state; callers surface a
    /// no-op response carrying that state.
    #[error("action does not apply in state {current_state}")]
    InvalidTransition { current_state: String },
    #[error("shelve requires a reason")]
    ShelveRequiresReason,
}

/// Result of a shelve: the updated instance, and whether the requested
/// duration was clamped to the configured maximum.
#[derive(Debug, Clone, PartialEq)]
pub struct ShelveResult {
    pub alarm: AlarmSnapshot,
    pub duration_clamped: bool,
}

/// Filters for the in-memory alarm list.
#[derive(Debug, Clone, Default)]
pub struct AlarmFilters {
    pub block_id: Option<String>,
    pub priority: Option<Priority>,
    pub state: Option<String>,
}

/// Counters for the stats loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub signals_processed: u64,
    pub alarms_raised: u64,
    pub alarms_cleared: u64,
    pub active_count: usize,
    pub standing_count: usize,
    pub suppressed_count: usize,
    pub shelved_count: usize,
    pub flood_events: u64,
}

// ---------------------------------------------------------------------------
// AlarmEngine
// ---------------------------------------------------------------------------

pub struct AlarmEngine<S: AlarmStore, P: EventPublisher> {
    config: EngineConfig,
    store: S,
    publisher: P,
    alarms: Mutex<HashMap<i64, AlarmInstance>>,
    thresholds: Mutex<ThresholdRegistry>,
    cascade: Mutex<CascadeEngine>,
    flood: Mutex<FloodDetector>,
    raise_times: Mutex<VecDeque<DateTime<Utc>>>,
    signals_processed: AtomicU64,
    alarms_raised: AtomicU64,
    alarms_cleared: AtomicU64,
}

impl<S: AlarmStore, P: EventPublisher> AlarmEngine<S, P> {
    pub fn new(
        config: EngineConfig,
        store: S,
        publisher: P,
        rules: Vec<CascadeRule>,
    ) -> Result<Self, RuleCompileError> {
        let flood = FloodDetector::new(config.flood_threshold_count, config.flood_threshold_seconds);
        Ok(AlarmEngine {
            cascade: Mutex::new(CascadeEngine::new(rules)?),
            flood: Mutex::new(flood),
            config,
            store,
            publisher,
            alarms: Mutex::new(HashMap::new()),
            thresholds: Mutex::new(ThresholdRegistry::new()),
            raise_times: Mutex::new(VecDeque::new()),
            signals_processed: AtomicU64::new(0),
            alarms_raised: AtomicU64::new(0),
            alarms_cleared: AtomicU64::new(0),
        })
    }

    /// Boot: load all non-CLEARED alarms and the threshold configs.
    pub async fn load_state(&self) -> Result<(), crate::persistence::StoreError> {
        let loaded = self.store.load_active_alarms().await?;
        let count = loaded.len();
        {
            let mut alarms = self.alarms.lock().await;
            *alarms = loaded.into_iter().map(|a| (a.sensor_id, a)).collect();
        }

        let rows = self.store.load_thresholds().await?;
        let threshold_count = self
            .thresholds
            .lock()
            .await
            .load_from_rows(rows, self.config.deadband_percent);

        info!(
            active_alarms = count,
            threshold_configs = threshold_count,
            "engine state loaded"
        );
        Ok(())
    }

    /// Refresh threshold configs from the registry (periodic).
    pub async fn refresh_thresholds(&self) {
        match self.store.load_thresholds().await {
            Ok(rows) => {
                self.thresholds
                    .lock()
                    .await
                    .load_from_rows(rows, self.config.deadband_percent);
            }
            Err(e) => error!(error = %e, "threshold refresh failed"),
        }
    }

    // ── Signal processing ───────────────────────────────────────────────

    /// Process one inbound signal.
    ///
    /// `now_mono_s` drives the per-band debounce; `now` stamps the
    /// transitions.
    pub async fn process_signal(&self, signal: &AlarmSignal, now: DateTime<Utc>, now_mono_s: f64) {
        self.signals_processed.fetch_add(1, Ordering::Relaxed);

        let evaluations: Option<Vec<(ThresholdDef, bool)>> = {
            let mut registry = self.thresholds.lock().await;
            registry
                .get_mut(signal.sensor_id)
                .map(|sensor| sensor.evaluate(signal.value, now_mono_s))
        };

        match evaluations {
            Some(evals) => {
                // Highest-priority band currently in alarm wins.
                let active = evals
                    .iter()
                    .filter(|(_, in_alarm)| *in_alarm)
                    .map(|(band, _)| band)
                    .min_by_key(|band| band.priority)
                    .cloned();
                match active {
                    Some(band) => {
                        self.handle_alarm_condition(
                            signal,
                            band.priority,
                            Some(band.value),
                            Some(band.direction),
                            now,
                        )
                        .await;
                    }
                    None => self.handle_clear_condition(signal, &evals, now).await,
                }
            }
            // No threshold config: trust the signal's priority verbatim.
            None => {
                self.handle_alarm_condition(signal, signal.priority, None, None, now)
                    .await;
            }
        }
    }

    async fn handle_alarm_condition(
        &self,
        signal: &AlarmSignal,
        priority: Priority,
        threshold: Option<f64>,
        direction: Option<ThresholdDirection>,
        now: DateTime<Utc>,
    ) {
        let mut alarms = self.alarms.lock().await;

        // Already alarming (or hidden): just record the observation.
        if let Some(alarm) = alarms.get_mut(&signal.sensor_id) {
            if alarm.state != AlarmState::Cleared && alarm.state != AlarmState::RtnUnack {
                alarm.raise(signal.value, now, threshold, direction);
                return;
            }
        }

        // Flood control gates new raises; critical priorities always pass.
        let decision = self
            .flood
            .lock()
            .await
            .on_raise(&signal.block_id, priority, now);
        if decision == FloodDecision::Suppress {
            return;
        }

        let mut alarm = match alarms.remove(&signal.sensor_id) {
            Some(existing) if existing.state == AlarmState::RtnUnack => existing,
            _ => AlarmInstance::new(
                signal.sensor_id,
                priority,
                &signal.site_id,
                &signal.block_id,
                &signal.subsystem,
                &signal.tag,
            ),
        };

        // Would an already-active cause swallow this alarm?  Checked
        // before the raise so the instance can be suppressed atomically.
        let suppressor = self
            .cascade
            .lock()
            .await
            .would_be_suppressed(&signal.subsystem, &signal.tag, &alarms);

        if alarm.raise(signal.value, now, threshold, direction) != Transition::Ok {
            alarms.insert(signal.sensor_id, alarm);
            return;
        }
        self.alarms_raised.fetch_add(1, Ordering::Relaxed);
        self.record_raise_time(now).await;

        alarms.insert(signal.sensor_id, alarm);
        let snapshot = alarms[&signal.sensor_id].snapshot();
        self.persist(&alarms[&signal.sensor_id]).await;
        self.audit(
            &signal.block_id,
            "alarm_raised",
            json!({
                "sensor_id": signal.sensor_id,
                "value": signal.value,
                "threshold": threshold,
                "direction": direction.map(|d| d.as_str()),
            }),
        )
        .await;
        self.publish_event("alarm_raised", snapshot.clone()).await;

        if decision == FloodDecision::FloodStarted {
            self.publish_event("alarm_flood", snapshot).await;
            self.audit(
                &signal.block_id,
                "alarm_flood",
                json!({ "block_id": signal.block_id }),
            )
            .await;
        }

        if let Some(cause) = suppressor {
            // Raise audit fires first, then the suppression.
            let alarm = alarms
                .get_mut(&signal.sensor_id)
                .expect("alarm inserted above");
            if alarm.suppress(cause, now) == Transition::Ok {
                let snapshot = alarm.snapshot();
                self.persist(&alarms[&signal.sensor_id]).await;
                self.audit(
                    &signal.block_id,
                    "alarm_suppressed",
                    json!({ "sensor_id": signal.sensor_id, "suppressed_by_sensor_id": cause }),
                )
                .await;
                self.publish_event("alarm_suppressed", snapshot).await;
            }
            return;
        }

        // This alarm may itself be a cascade cause.
        let suppressed_ids = self.cascade.lock().await.on_alarm_raised(
            signal.sensor_id,
            &signal.subsystem,
            &signal.tag,
            now,
            &mut alarms,
        );
        for id in suppressed_ids {
            let snapshot = alarms[&id].snapshot();
            let block_id = snapshot.block_id.clone();
            self.persist(&alarms[&id]).await;
            self.audit(
                &block_id,
                "alarm_suppressed",
                json!({ "sensor_id": id, "suppressed_by_sensor_id": signal.sensor_id }),
            )
            .await;
            self.publish_event("alarm_suppressed", snapshot).await;
        }
    }

    async fn handle_clear_condition(
        &self,
        signal: &AlarmSignal,
        evaluations: &[(ThresholdDef, bool)],
        now: DateTime<Utc>,
    ) {
        let mut alarms = self.alarms.lock().await;
        let Some(alarm) = alarms.get_mut(&signal.sensor_id) else {
            return;
        };

        match alarm.state {
            AlarmState::Cleared => return,
            AlarmState::Shelved | AlarmState::Suppressed | AlarmState::RtnUnack => {
                alarm.last_value = Some(signal.value);
                alarm.last_seen = Some(now);
                return;
            }
            AlarmState::Active | AlarmState::Acked => {}
        }

        // Deadband applies to clearing: hold until the value is past the
        // clear point of the band this alarm was raised on.
        let band = evaluations
            .iter()
            .map(|(band, _)| band)
            .find(|band| {
                alarm.threshold_value == Some(band.value)
                    && alarm.threshold_direction == Some(band.direction)
            })
            .or_else(|| evaluations.first().map(|(band, _)| band));
        if let Some(band) = band {
            if !SensorThresholds::check_clear_with_deadband(
                signal.value,
                band,
                self.config.deadband_percent,
            ) {
                alarm.last_value = Some(signal.value);
                alarm.last_seen = Some(now);
                return;
            }
        }

        if alarm.clear_condition(signal.value, now) != Transition::Ok {
            return;
        }
        self.alarms_cleared.fetch_add(1, Ordering::Relaxed);

        let snapshot = alarm.snapshot();
        let fully_cleared = alarm.state == AlarmState::Cleared;
        let event_type = if fully_cleared {
            "alarm_cleared"
        } else {
            "alarm_rtn_unack"
        };
        self.persist(&alarms[&signal.sensor_id]).await;
        self.audit(
            &signal.block_id,
            event_type,
            json!({ "sensor_id": signal.sensor_id, "value": signal.value }),
        )
        .await;
        self.publish_event(event_type, snapshot).await;

        if fully_cleared {
            self.release_cascade_effects(signal.sensor_id, now, &mut alarms)
                .await;
        }
    }

    /// Release every alarm suppressed by `cause` (which just cleared).
    async fn release_cascade_effects(
        &self,
        cause: i64,
        now: DateTime<Utc>,
        alarms: &mut HashMap<i64, AlarmInstance>,
    ) {
        let released = self
            .cascade
            .lock()
            .await
            .on_alarm_cleared(cause, now, alarms);
        for id in released {
            let snapshot = alarms[&id].snapshot();
            let block_id = snapshot.block_id.clone();
            self.persist(&alarms[&id]).await;
            self.audit(
                &block_id,
                "alarm_unsuppressed",
                json!({ "sensor_id": id, "was_suppressed_by": cause }),
            )
            .await;
            self.publish_event("alarm_unsuppressed", snapshot).await;
        }
    }

    // ── Operator actions ────────────────────────────────────────────────

    /// Filtered view of the in-memory instances, severity first.
    pub async fn list(&self, filters: &AlarmFilters) -> Vec<AlarmSnapshot> {
        let alarms = self.alarms.lock().await;
        let mut results: Vec<AlarmSnapshot> = alarms
            .values()
            .filter(|a| a.state != AlarmState::Cleared)
            .filter(|a| {
                filters
                    .block_id
                    .as_ref()
                    .is_none_or(|b| &a.block_id == b)
            })
            .filter(|a| filters.priority.is_none_or(|p| a.priority == p))
            .filter(|a| {
                filters
                    .state
                    .as_ref()
                    .is_none_or(|s| a.state.as_str() == s)
            })
            .map(AlarmInstance::snapshot)
            .collect();
        results.sort_by(|a, b| {
            (a.priority, &a.raised_at).cmp(&(b.priority, &b.raised_at))
        });
        results
    }

    pub async fn acknowledge(
        &self,
        sensor_id: i64,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<AlarmSnapshot, OperatorError> {
        let mut alarms = self.alarms.lock().await;
        let alarm = alarms.get_mut(&sensor_id).ok_or(OperatorError::NotFound)?;

        if alarm.acknowledge(operator, now) != Transition::Ok {
            return Err(OperatorError::InvalidTransition {
                current_state: alarm.state.as_str().to_owned(),
            });
        }

        let snapshot = alarm.snapshot();
        let fully_cleared = alarm.state == AlarmState::Cleared;
        let block_id = alarm.block_id.clone();
        self.persist(&alarms[&sensor_id]).await;
        self.audit(
            &block_id,
            "alarm_acked",
            json!({ "sensor_id": sensor_id, "operator": operator }),
        )
        .await;
        self.publish_event("alarm_acked", snapshot.clone()).await;

        // An ack from RTN_UNACK fully clears, which can release a cascade.
        if fully_cleared {
            self.release_cascade_effects(sensor_id, now, &mut alarms).await;
        }
        Ok(snapshot)
    }

    pub async fn shelve(
        &self,
        sensor_id: i64,
        operator: &str,
        reason: &str,
        duration_hours: f64,
        now: DateTime<Utc>,
    ) -> Result<ShelveResult, OperatorError> {
        let mut alarms = self.alarms.lock().await;
        let alarm = alarms.get_mut(&sensor_id).ok_or(OperatorError::NotFound)?;

        let outcome = match alarm.shelve(operator, reason, duration_hours, now, &self.config) {
            Ok(outcome) => outcome,
            Err(ShelveError::ReasonRequired) => return Err(OperatorError::ShelveRequiresReason),
            Err(ShelveError::InvalidState(state)) => {
                return Err(OperatorError::InvalidTransition {
                    current_state: state.to_owned(),
                })
            }
        };

        let snapshot = alarm.snapshot();
        let block_id = alarm.block_id.clone();
        self.persist(&alarms[&sensor_id]).await;
        self.audit(
            &block_id,
            "alarm_shelved",
            json!({
                "sensor_id": sensor_id,
                "operator": operator,
                "reason": reason,
                "duration_hours": outcome.effective_hours,
                "duration_clamped": outcome.clamped,
            }),
        )
        .await;
        self.publish_event("alarm_shelved", snapshot.clone()).await;

        Ok(ShelveResult {
            alarm: snapshot,
            duration_clamped: outcome.clamped,
        })
    }

    pub async fn unshelve(
        &self,
        sensor_id: i64,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Result<AlarmSnapshot, OperatorError> {
        let mut alarms = self.alarms.lock().await;
        let alarm = alarms.get_mut(&sensor_id).ok_or(OperatorError::NotFound)?;

        if alarm.unshelve(now) != Transition::Ok {
            return Err(OperatorError::InvalidTransition {
                current_state: alarm.state.as_str().to_owned(),
            });
        }

        let snapshot = alarm.snapshot();
        let block_id = alarm.block_id.clone();
        self.persist(&alarms[&sensor_id]).await;
        self.audit(
            &block_id,
            "alarm_unshelved",
            json!({ "sensor_id": sensor_id, "reason": "manual", "operator": operator }),
        )
        .await;
        self.publish_event("alarm_unshelved", snapshot.clone()).await;
        Ok(snapshot)
    }

    // ── Background sweeps ───────────────────────────────────────────────

    /// Unshelve every instance whose shelve deadline has passed.
    pub async fn expire_shelves(&self, now: DateTime<Utc>) -> usize {
        let mut alarms = self.alarms.lock().await;
        let expired: Vec<i64> = alarms
            .values()
            .filter(|a| {
                a.state == AlarmState::Shelved && a.shelved_until.is_some_and(|until| until < now)
            })
            .map(|a| a.sensor_id)
            .collect();

        for sensor_id in &expired {
            let alarm = alarms.get_mut(sensor_id).expect("id collected above");
            if alarm.unshelve(now) != Transition::Ok {
                continue;
            }
            let snapshot = alarm.snapshot();
            let block_id = alarm.block_id.clone();
            self.persist(&alarms[sensor_id]).await;
            self.audit(
                &block_id,
                "alarm_unshelved",
                json!({ "sensor_id": sensor_id, "reason": "timer_expired" }),
            )
            .await;
            self.publish_event("alarm_unshelved", snapshot).await;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "shelve monitor unshelved alarms");
        }
        expired.len()
    }

    /// Force-clear ACTIVE/ACKED instances with no readings past the
    /// staleness timeout.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let timeout = Duration::minutes(self.config.stale_alarm_timeout_minutes);
        let mut alarms = self.alarms.lock().await;
        let stale: Vec<i64> = alarms
            .values()
            .filter(|a| matches!(a.state, AlarmState::Active | AlarmState::Acked))
            .filter(|a| a.last_seen.is_none_or(|seen| now - seen > timeout))
            .map(|a| a.sensor_id)
            .collect();

        for sensor_id in &stale {
            let alarm = alarms.get_mut(sensor_id).expect("id collected above");
            if alarm.expire_stale(now) != Transition::Ok {
                continue;
            }
            let snapshot = alarm.snapshot();
            let block_id = alarm.block_id.clone();
            self.persist(&alarms[sensor_id]).await;
            self.audit(
                &block_id,
                "alarm_cleared",
                json!({
                    "sensor_id": sensor_id,
                    "reason": "stale_timeout",
                    "timeout_minutes": self.config.stale_alarm_timeout_minutes,
                }),
            )
            .await;
            self.publish_event("alarm_cleared", snapshot).await;
            self.release_cascade_effects(*sensor_id, now, &mut alarms).await;
        }
        stale.len()
    }

    pub async fn run_shelve_monitor(&self) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.shelve_check_interval_s,
            ))
            .await;
            self.expire_shelves(Utc::now()).await;
        }
    }

    pub async fn run_stale_sweep(&self) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            self.sweep_stale(Utc::now()).await;
        }
    }

    pub async fn run_threshold_refresh(&self) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(self.config.threshold_refresh_s))
                .await;
            self.refresh_thresholds().await;
        }
    }

    /// Log engine counters every 30 s, with the ISA-18.2 rate warning.
    pub async fn run_stats_loop(&self) {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            let stats = self.stats().await;
            let hourly_rate = self.hourly_raise_rate(Utc::now()).await;
            info!(
                signals = stats.signals_processed,
                raised = stats.alarms_raised,
                cleared = stats.alarms_cleared,
                standing = stats.standing_count,
                suppressed = stats.suppressed_count,
                shelved = stats.shelved_count,
                rate_per_hour = hourly_rate,
                "engine stats"
            );
            if hourly_rate > self.config.target_alarms_per_operator_hour * 2 {
                warn!(
                    rate_per_hour = hourly_rate,
                    target = self.config.target_alarms_per_operator_hour,
                    "alarm rate exceeds twice the per-operator target"
                );
            }
        }
    }

    pub async fn stats(&self) -> EngineStats {
        let alarms = self.alarms.lock().await;
        EngineStats {
            signals_processed: self.signals_processed.load(Ordering::Relaxed),
            alarms_raised: self.alarms_raised.load(Ordering::Relaxed),
            alarms_cleared: self.alarms_cleared.load(Ordering::Relaxed),
            active_count: alarms.len(),
            standing_count: alarms.values().filter(|a| a.is_standing()).count(),
            suppressed_count: alarms
                .values()
                .filter(|a| a.state == AlarmState::Suppressed)
                .count(),
            shelved_count: alarms
                .values()
                .filter(|a| a.state == AlarmState::Shelved)
                .count(),
            flood_events: self.flood.lock().await.flood_event_count(),
        }
    }

    async fn record_raise_time(&self, now: DateTime<Utc>) {
        let mut times = self.raise_times.lock().await;
        times.push_back(now);
        while times.front().is_some_and(|&t| now - t > Duration::hours(1)) {
            times.pop_front();
        }
    }

    async fn hourly_raise_rate(&self, now: DateTime<Utc>) -> u64 {
        let mut times = self.raise_times.lock().await;
        while times.front().is_some_and(|&t| now - t > Duration::hours(1)) {
            times.pop_front();
        }
        times.len() as u64
    }

    // ── Persistence and publication helpers ─────────────────────────────

    async fn persist(&self, alarm: &AlarmInstance) {
        if let Err(e) = self.store.save_alarm(alarm).await {
            error!(sensor_id = alarm.sensor_id, error = %e, "alarm persist failed");
        }
    }

    async fn audit(&self, block_id: &str, event_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.store.log_event(block_id, event_type, payload).await {
            error!(block_id, event_type, error = %e, "audit event write failed");
        }
    }

    async fn publish_event(&self, event: &str, alarm: AlarmSnapshot) {
        let out = AlarmEventOut {
            event: event.to_owned(),
            alarm,
            timestamp: Utc::now().to_rfc3339(),
        };
        if let Err(e) = self.publisher.publish(&out).await {
            // Fan-out is at-most-once; consumers see state via later events.
            warn!(event, error = %e, "outbound event publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::default_rules;
    use crate::persistence::StoreError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    // Recording fakes --------------------------------------------------

    #[derive(Default)]
    struct MemStore {
        saved: StdMutex<Vec<AlarmInstance>>,
        events: StdMutex<Vec<(String, String, serde_json::Value)>>,
        boot_alarms: StdMutex<Vec<AlarmInstance>>,
        boot_thresholds: StdMutex<Vec<(i64, String, serde_json::Value)>>,
    }

    #[async_trait]
    impl AlarmStore for MemStore {
        async fn load_active_alarms(&self) -> Result<Vec<AlarmInstance>, StoreError> {
            Ok(self.boot_alarms.lock().unwrap().clone())
        }

        async fn load_thresholds(
            &self,
        ) -> Result<Vec<(i64, String, serde_json::Value)>, StoreError> {
            Ok(self.boot_thresholds.lock().unwrap().clone())
        }

        async fn save_alarm(&self, alarm: &AlarmInstance) -> Result<(), StoreError> {
            self.saved.lock().unwrap().push(alarm.clone());
            Ok(())
        }

        async fn log_event(
            &self,
            block_id: &str,
            event_type: &str,
            payload: serde_json::Value,
        ) -> Result<(), StoreError> {
            self.events
                .lock()
                .unwrap()
                .push((block_id.to_owned(), event_type.to_owned(), payload));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemPublisher {
        events: StdMutex<Vec<AlarmEventOut>>,
    }

    #[async_trait]
    impl EventPublisher for MemPublisher {
        async fn publish(&self, event: &AlarmEventOut) -> Result<(), crate::fanout::PublishError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    // Helpers ----------------------------------------------------------

    fn t(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000 + seconds, 0).unwrap()
    }

    fn signal(sensor_id: i64, value: f64) -> AlarmSignal {
        signal_in("thermal-l1", "TT-101", sensor_id, value)
    }

    fn signal_in(subsystem: &str, tag: &str, sensor_id: i64, value: f64) -> AlarmSignal {
        AlarmSignal {
            sensor_id,
            priority: Priority::P2,
            value,
            timestamp: "2027-01-15T10:30:00Z".to_owned(),
            site_id: "site".to_owned(),
            block_id: "block-01".to_owned(),
            subsystem: subsystem.to_owned(),
            tag: tag.to_owned(),
        }
    }

    fn engine() -> AlarmEngine<MemStore, MemPublisher> {
        AlarmEngine::new(
            EngineConfig::default(),
            MemStore::default(),
            MemPublisher::default(),
            default_rules(),
        )
        .unwrap()
    }

    async fn engine_with_thresholds(json: serde_json::Value) -> AlarmEngine<MemStore, MemPublisher> {
        let eng = engine();
        eng.store
            .boot_thresholds
            .lock()
            .unwrap()
            .push((1, "TT-101".to_owned(), json));
        eng.load_state().await.unwrap();
        eng
    }

    fn event_types(eng: &AlarmEngine<MemStore, MemPublisher>) -> Vec<String> {
        eng.store
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t, _)| t.clone())
            .collect()
    }

    // Threshold lifecycle (raise with debounce, deadband, rtn, ack) ----

    #[tokio::test]
    async fn threshold_lifecycle_with_debounce_and_deadband() {
        let eng = engine_with_thresholds(serde_json::json!({
            "H": {"value": 50.0, "priority": "P2", "delay_s": 10}
        }))
        .await;

        // Below the band: nothing.
        eng.process_signal(&signal(1, 45.0), t(0), 0.0).await;
        assert!(eng.list(&AlarmFilters::default()).await.is_empty());

        // Above the band but inside the debounce window.
        eng.process_signal(&signal(1, 52.0), t(1), 1.0).await;
        assert!(eng.list(&AlarmFilters::default()).await.is_empty());

        // Debounce elapsed: P2 raised.
        eng.process_signal(&signal(1, 52.0), t(11), 11.0).await;
        let listed = eng.list(&AlarmFilters::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, "ACTIVE");
        assert_eq!(listed[0].threshold_value, Some(50.0));

        // 50.5 is above the 49.0 clear point: still ACTIVE.
        eng.process_signal(&signal(1, 50.5), t(20), 20.0).await;
        assert_eq!(eng.list(&AlarmFilters::default()).await[0].state, "ACTIVE");

        // Past the deadband: RTN_UNACK.
        eng.process_signal(&signal(1, 48.9), t(30), 30.0).await;
        assert_eq!(
            eng.list(&AlarmFilters::default()).await[0].state,
            "RTN_UNACK"
        );

        // Ack clears fully.
        let snap = eng.acknowledge(1, "rdiaz", t(40)).await.unwrap();
        assert_eq!(snap.state, "CLEARED");

        assert_eq!(
            event_types(&eng),
            vec!["alarm_raised", "alarm_rtn_unack", "alarm_acked"]
        );
    }

    #[tokio::test]
    async fn signal_without_threshold_config_is_trusted_verbatim() {
        let eng = engine();
        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;
        let listed = eng.list(&AlarmFilters::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].priority, Priority::P2);
        assert_eq!(listed[0].state, "ACTIVE");
    }

    #[tokio::test]
    async fn one_non_cleared_instance_per_sensor() {
        let eng = engine();
        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;
        eng.process_signal(&signal(1, 95.0), t(1), 1.0).await;
        eng.process_signal(&signal(1, 99.0), t(2), 2.0).await;

        let listed = eng.list(&AlarmFilters::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_value, Some(99.0));
        // Only one raise audit.
        assert_eq!(event_types(&eng), vec!["alarm_raised"]);
    }

    // Cascade ----------------------------------------------------------

    #[tokio::test]
    async fn cause_raise_suppresses_active_effects_and_clear_releases_them() {
        let eng = engine_with_thresholds(serde_json::json!({
            "H": {"value": 1000.0, "priority": "P1"}
        }))
        .await;

        // Two downstream alarms already ACTIVE.
        eng.process_signal(&signal_in("thermal-l2", "ML-FLOW", 20, 5.0), t(0), 0.0)
            .await;
        eng.process_signal(&signal_in("thermal-l3", "PHX-01-T", 21, 60.0), t(1), 1.0)
            .await;

        // The cause fires.
        eng.process_signal(&signal_in("thermal-l2", "ML-PUMP-A-SPEED", 1, 2000.0), t(2), 2.0)
            .await;

        let suppressed = eng
            .list(&AlarmFilters {
                state: Some("SUPPRESSED".to_owned()),
                ..AlarmFilters::default()
            })
            .await;
        assert_eq!(suppressed.len(), 2);
        assert!(suppressed
            .iter()
            .all(|a| a.suppressed_by_sensor_id == Some(1)));

        // The cause clears (past deadband: 1000 × 0.98 = 980).
        eng.process_signal(&signal_in("thermal-l2", "ML-PUMP-A-SPEED", 1, 500.0), t(3), 3.0)
            .await;
        // RTN_UNACK is not CLEARED; effects still held.
        assert_eq!(
            eng.list(&AlarmFilters {
                state: Some("SUPPRESSED".to_owned()),
                ..AlarmFilters::default()
            })
            .await
            .len(),
            2
        );

        // Ack completes the clear and releases the effects.
        eng.acknowledge(1, "op", t(4)).await.unwrap();
        assert!(eng
            .list(&AlarmFilters {
                state: Some("SUPPRESSED".to_owned()),
                ..AlarmFilters::default()
            })
            .await
            .is_empty());

        let types = event_types(&eng);
        let unsuppressed = types.iter().filter(|t| *t == "alarm_unsuppressed").count();
        assert_eq!(unsuppressed, 2);
    }

    #[tokio::test]
    async fn arriving_effect_of_an_active_cause_is_raised_then_suppressed() {
        let eng = engine();
        // Cause first.
        eng.process_signal(&signal_in("thermal-l2", "ML-PUMP-B-SPEED", 1, 2000.0), t(0), 0.0)
            .await;
        // Effect arrives afterwards.
        eng.process_signal(&signal_in("thermal-l2", "ML-FLOW", 2, 0.0), t(1), 1.0)
            .await;

        let listed = eng.list(&AlarmFilters::default()).await;
        let effect = listed.iter().find(|a| a.sensor_id == 2).unwrap();
        assert_eq!(effect.state, "SUPPRESSED");
        assert_eq!(effect.suppressed_by_sensor_id, Some(1));

        // The raise audit fires, then the suppression.
        let types = event_types(&eng);
        let raised_idx = types.iter().rposition(|t| t == "alarm_raised").unwrap();
        let suppressed_idx = types.iter().position(|t| t == "alarm_suppressed").unwrap();
        assert!(raised_idx < suppressed_idx);
    }

    // Shelving ---------------------------------------------------------

    #[tokio::test]
    async fn shelve_and_timer_expiry() {
        let eng = engine();
        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;

        let result = eng
            .shelve(1, "op", "maintenance work order 123", 1.0, t(10))
            .await
            .unwrap();
        assert!(!result.duration_clamped);
        assert_eq!(result.alarm.state, "SHELVED");

        // Not yet expired.
        assert_eq!(eng.expire_shelves(t(1800)).await, 0);

        // One hour later the monitor unshelves to CLEARED.
        assert_eq!(eng.expire_shelves(t(3700)).await, 1);
        let events = event_types(&eng);
        assert_eq!(
            events,
            vec!["alarm_raised", "alarm_shelved", "alarm_unshelved"]
        );

        // The reason is recorded as timer expiry.
        let store_events = eng.store.events.lock().unwrap();
        let (_, _, payload) = store_events.last().unwrap();
        assert_eq!(payload["reason"], "timer_expired");
    }

    #[tokio::test]
    async fn shelve_without_reason_is_refused() {
        let eng = engine();
        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;
        assert_eq!(
            eng.shelve(1, "op", "", 1.0, t(1)).await,
            Err(OperatorError::ShelveRequiresReason)
        );
    }

    #[tokio::test]
    async fn shelve_duration_clamp_is_reported() {
        let eng = engine();
        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;
        let result = eng.shelve(1, "op", "long fix", 100.0, t(1)).await.unwrap();
        assert!(result.duration_clamped);
    }

    #[tokio::test]
    async fn operator_actions_on_missing_or_wrong_state_alarms() {
        let eng = engine();
        assert_eq!(
            eng.acknowledge(999, "op", t(0)).await,
            Err(OperatorError::NotFound)
        );

        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;
        eng.acknowledge(1, "op", t(1)).await.unwrap();
        // Second ack: no-op with current state.
        assert_eq!(
            eng.acknowledge(1, "op", t(2)).await,
            Err(OperatorError::InvalidTransition {
                current_state: "ACKED".to_owned()
            })
        );
    }

    // Stale sweep ------------------------------------------------------

    #[tokio::test]
    async fn stale_alarms_are_force_cleared_with_audit_reason() {
        let eng = engine();
        eng.process_signal(&signal(1, 91.0), t(0), 0.0).await;

        // 29 minutes: still fresh.
        assert_eq!(eng.sweep_stale(t(29 * 60)).await, 0);
        // 31 minutes of silence: force-cleared.
        assert_eq!(eng.sweep_stale(t(31 * 60)).await, 1);

        let store_events = eng.store.events.lock().unwrap();
        let (_, event_type, payload) = store_events.last().unwrap();
        assert_eq!(event_type, "alarm_cleared");
        assert_eq!(payload["reason"], "stale_timeout");
    }

    // Flood ------------------------------------------------------------

    #[tokio::test]
    async fn flood_emits_one_event_and_suppresses_low_priorities() {
        let mut config = EngineConfig::default();
        config.flood_threshold_count = 5;
        let eng = AlarmEngine::new(
            config,
            MemStore::default(),
            MemPublisher::default(),
            vec![],
        )
        .unwrap();

        // 6 distinct P2 alarms in the same block cross the threshold.
        for i in 0..6i64 {
            eng.process_signal(&signal_in("electrical", &format!("T-{}", i), i, 91.0), t(i), i as f64)
                .await;
        }
        let stats = eng.stats().await;
        assert_eq!(stats.flood_events, 1);

        // While flooding, further P2 raises are swallowed.
        eng.process_signal(&signal_in("electrical", "T-99", 99, 91.0), t(7), 7.0)
            .await;
        assert!(eng
            .list(&AlarmFilters::default())
            .await
            .iter()
            .all(|a| a.sensor_id != 99));

        // A P0 still gets through.
        let mut critical = signal_in("electrical", "T-CRIT", 100, 91.0);
        critical.priority = Priority::P0;
        eng.process_signal(&critical, t(8), 8.0).await;
        assert!(eng
            .list(&AlarmFilters::default())
            .await
            .iter()
            .any(|a| a.sensor_id == 100));

        let published = eng.publisher.events.lock().unwrap();
        assert_eq!(
            published.iter().filter(|e| e.event == "alarm_flood").count(),
            1
        );
    }

    // Boot state -------------------------------------------------------

    #[tokio::test]
    async fn boot_loads_non_cleared_alarms_as_authoritative_state() {
        let eng = engine();
        {
            let mut boot = eng.store.boot_alarms.lock().unwrap();
            let mut a =
                AlarmInstance::new(5, Priority::P1, "site", "block-01", "electrical", "UPS-01");
            a.raise(91.0, t(0), None, None);
            boot.push(a);
        }
        eng.load_state().await.unwrap();

        let listed = eng.list(&AlarmFilters::default()).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sensor_id, 5);

        // The loaded instance acks normally.
        eng.acknowledge(5, "op", t(10)).await.unwrap();
    }

    // Filters ----------------------------------------------------------

    #[tokio::test]
    async fn list_filters_by_block_priority_and_state() {
        let eng = engine();
        let mut p0 = signal_in("electrical", "A", 1, 91.0);
        p0.priority = Priority::P0;
        eng.process_signal(&p0, t(0), 0.0).await;

        let mut other_block = signal_in("electrical", "B", 2, 91.0);
        other_block.block_id = "block-02".to_owned();
        eng.process_signal(&other_block, t(1), 1.0).await;

        let all = eng.list(&AlarmFilters::default()).await;
        assert_eq!(all.len(), 2);
        // Severity first.
        assert_eq!(all[0].priority, Priority::P0);

        let block = eng
            .list(&AlarmFilters {
                block_id: Some("block-02".to_owned()),
                ..AlarmFilters::default()
            })
            .await;
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].sensor_id, 2);

        let p0_only = eng
            .list(&AlarmFilters {
                priority: Some(Priority::P0),
                ..AlarmFilters::default()
            })
            .await;
        assert_eq!(p0_only.len(), 1);
    }
}
