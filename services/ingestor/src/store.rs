//! Postgres-backed telemetry store.
//!
//! One bulk insert per flush using unnest over parallel arrays — a single
//! round-trip regardless of batch size.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use crate::batch::{StoreError, TelemetryRow, TelemetryStore};

pub struct PgTelemetryStore {
    pool: PgPool,
    insert_timeout: Duration,
}

impl PgTelemetryStore {
    pub fn new(pool: PgPool, insert_timeout: Duration) -> Self {
        PgTelemetryStore {
            pool,
            insert_timeout,
        }
    }
}

#[async_trait]
impl TelemetryStore for PgTelemetryStore {
    async fn insert_rows(&self, rows: &[TelemetryRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let times: Vec<chrono::DateTime<chrono::Utc>> = rows.iter().map(|r| r.time).collect();
        let sensor_ids: Vec<i64> = rows.iter().map(|r| r.sensor_id).collect();
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
        let qualities: Vec<i16> = rows.iter().map(|r| r.quality).collect();

        let insert = sqlx::query(
            r#"INSERT INTO telemetry (time, sensor_id, value, quality)
               SELECT unnest($1::timestamptz[]),
                      unnest($2::bigint[]),
                      unnest($3::double precision[]),
                      unnest($4::smallint[])"#,
        )
        .bind(&times)
        .bind(&sensor_ids)
        .bind(&values)
        .bind(&qualities)
        .execute(&self.pool);

        tokio::time::timeout(self.insert_timeout, insert)
            .await
            .map_err(|_| StoreError("bulk insert timed out".to_owned()))?
            .map_err(|e| StoreError(e.to_string()))?;
        Ok(())
    }
}
