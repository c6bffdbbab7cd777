//! Alarm persistence.
//!
//! Every state transition is written immediately: the alarm row is
//! upserted and an immutable audit event appended.  On boot the engine
//! loads all non-CLEARED alarms as its authoritative state, plus the
//! threshold configs.

use async_trait::async_trait;
use mcs_proto::{Priority, ThresholdDirection};
use sqlx::{PgPool, Row};

use crate::state::{AlarmInstance, AlarmState};

#[derive(Debug, thiserror::Error)]
#[error("alarm store error: {0}")]
pub struct StoreError(pub String);

/// Storage capability of the engine.  Tests inject a recording fake.
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// All non-CLEARED alarms — the engine's boot state.
    async fn load_active_alarms(&self) -> Result<Vec<AlarmInstance>, StoreError>;

    /// `(sensor_id, tag, thresholds_json)` for sensors with thresholds.
    async fn load_thresholds(&self) -> Result<Vec<(i64, String, serde_json::Value)>, StoreError>;

    /// Upsert the current instance row for a sensor.
    async fn save_alarm(&self, alarm: &AlarmInstance) -> Result<(), StoreError>;

    /// Append one immutable audit event.
    async fn log_event(
        &self,
        block_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: AlarmStore + ?Sized> AlarmStore for std::sync::Arc<T> {
    async fn load_active_alarms(&self) -> Result<Vec<AlarmInstance>, StoreError> {
        (**self).load_active_alarms().await
    }

    async fn load_thresholds(&self) -> Result<Vec<(i64, String, serde_json::Value)>, StoreError> {
        (**self).load_thresholds().await
    }

    async fn save_alarm(&self, alarm: &AlarmInstance) -> Result<(), StoreError> {
        (**self).save_alarm(alarm).await
    }

    async fn log_event(
        &self,
        block_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        (**self).log_event(block_id, event_type, payload).await
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgAlarmStore {
    pool: PgPool,
}

impl PgAlarmStore {
    pub fn new(pool: PgPool) -> Self {
        PgAlarmStore { pool }
    }
}

#[async_trait]
impl AlarmStore for PgAlarmStore {
    async fn load_active_alarms(&self) -> Result<Vec<AlarmInstance>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT sensor_id, priority, state, site_id, block_id, subsystem, tag,
                      value_at_raise, value_at_clear, threshold_value, threshold_direction,
                      raised_at, acked_at, acked_by, cleared_at,
                      shelved_at, shelved_by, shelved_until, shelve_reason,
                      suppressed_by_sensor_id, transition_count, last_value, last_seen
               FROM alarms
               WHERE state != 'CLEARED'"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError(e.to_string()))?;

        let mut alarms = Vec::with_capacity(rows.len());
        for row in rows {
            let priority = Priority::parse(row.get::<&str, _>("priority"))
                .ok_or_else(|| StoreError("bad priority in alarms row".to_owned()))?;
            let state = AlarmState::parse(row.get::<&str, _>("state"))
                .ok_or_else(|| StoreError("bad state in alarms row".to_owned()))?;
            let direction = row
                .get::<Option<&str>, _>("threshold_direction")
                .and_then(|d| match d {
                    "HIGH" => Some(ThresholdDirection::High),
                    "LOW" => Some(ThresholdDirection::Low),
                    "BOOL" => Some(ThresholdDirection::Bool),
                    _ => None,
                });

            alarms.push(AlarmInstance {
                sensor_id: row.get("sensor_id"),
                priority,
                state,
                site_id: row.get("site_id"),
                block_id: row.get("block_id"),
                subsystem: row.get("subsystem"),
                tag: row.get("tag"),
                value_at_raise: row.get("value_at_raise"),
                value_at_clear: row.get("value_at_clear"),
                threshold_value: row.get("threshold_value"),
                threshold_direction: direction,
                raised_at: row.get("raised_at"),
                acked_at: row.get("acked_at"),
                acked_by: row.get("acked_by"),
                cleared_at: row.get("cleared_at"),
                shelved_at: row.get("shelved_at"),
                shelved_by: row.get("shelved_by"),
                shelved_until: row.get("shelved_until"),
                shelve_reason: row.get("shelve_reason"),
                suppressed_by_sensor_id: row.get("suppressed_by_sensor_id"),
                transition_count: row.get::<i64, _>("transition_count") as u64,
                last_value: row.get("last_value"),
                last_seen: row.get("last_seen"),
            });
        }
        Ok(alarms)
    }

    async fn load_thresholds(&self) -> Result<Vec<(i64, String, serde_json::Value)>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, tag, alarm_thresholds
               FROM sensors
               WHERE alarm_thresholds IS NOT NULL"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<i64, _>("id"),
                    row.get::<String, _>("tag"),
                    row.get::<serde_json::Value, _>("alarm_thresholds"),
                )
            })
            .collect())
    }

    async fn save_alarm(&self, alarm: &AlarmInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO alarms
                   (sensor_id, priority, state, site_id, block_id, subsystem, tag,
                    value_at_raise, value_at_clear, threshold_value, threshold_direction,
                    raised_at, acked_at, acked_by, cleared_at,
                    shelved_at, shelved_by, shelved_until, shelve_reason,
                    suppressed_by_sensor_id, transition_count, last_value, last_seen)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                       $15, $16, $17, $18, $19, $20, $21, $22, $23)
               ON CONFLICT (sensor_id) DO UPDATE SET
                   priority = EXCLUDED.priority,
                   state = EXCLUDED.state,
                   value_at_raise = EXCLUDED.value_at_raise,
                   value_at_clear = EXCLUDED.value_at_clear,
                   threshold_value = EXCLUDED.threshold_value,
                   threshold_direction = EXCLUDED.threshold_direction,
                   raised_at = EXCLUDED.raised_at,
                   acked_at = EXCLUDED.acked_at,
                   acked_by = EXCLUDED.acked_by,
                   cleared_at = EXCLUDED.cleared_at,
                   shelved_at = EXCLUDED.shelved_at,
                   shelved_by = EXCLUDED.shelved_by,
                   shelved_until = EXCLUDED.shelved_until,
                   shelve_reason = EXCLUDED.shelve_reason,
                   suppressed_by_sensor_id = EXCLUDED.suppressed_by_sensor_id,
                   transition_count = EXCLUDED.transition_count,
                   last_value = EXCLUDED.last_value,
                   last_seen = EXCLUDED.last_seen"#,
        )
        .bind(alarm.sensor_id)
        .bind(alarm.priority.as_str())
        .bind(alarm.state.as_str())
        .bind(&alarm.site_id)
        .bind(&alarm.block_id)
        .bind(&alarm.subsystem)
        .bind(&alarm.tag)
        .bind(alarm.value_at_raise)
        .bind(alarm.value_at_clear)
        .bind(alarm.threshold_value)
        .bind(alarm.threshold_direction.map(|d| d.as_str()))
        .bind(alarm.raised_at)
        .bind(alarm.acked_at)
        .bind(&alarm.acked_by)
        .bind(alarm.cleared_at)
        .bind(alarm.shelved_at)
        .bind(&alarm.shelved_by)
        .bind(alarm.shelved_until)
        .bind(&alarm.shelve_reason)
        .bind(alarm.suppressed_by_sensor_id)
        .bind(alarm.transition_count as i64)
        .bind(alarm.last_value)
        .bind(alarm.last_seen)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }

    async fn log_event(
        &self,
        block_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO events (block_id, event_type, payload, created_at)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(block_id)
        .bind(event_type)
        .bind(payload)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }
}
