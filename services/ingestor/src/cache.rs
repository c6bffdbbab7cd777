//! Sensor-key cache.
//!
//! Resolves `(site, block, subsystem, tag)` to the dense sensor id through
//! three tiers: an in-process map warmed at startup, redis with a TTL
//! (write-through), and the authoritative registry table.
//!
//! Entries are immutable for the lifetime of a sensor; registry updates
//! are not invalidated mid-process — a restart picks them up.  That is
//! acceptable because sensors are created rarely and the registry never
//! repurposes a key.

use async_trait::async_trait;
use redis::AsyncCommands;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::metrics::IngestMetrics;

#[derive(Debug, thiserror::Error)]
#[error("sensor resolution failed: {0}")]
pub struct ResolveError(pub String);

/// Sensor-key resolution capability.  The pipeline depends on this, not
/// on the concrete cache, so tests inject a map-backed fake.
#[async_trait]
pub trait SensorResolver: Send + Sync {
    /// `Ok(None)` means the sensor is not in the registry — the caller
    /// dead-letters the message.
    async fn resolve(
        &self,
        site: &str,
        block: &str,
        subsystem: &str,
        tag: &str,
    ) -> Result<Option<i64>, ResolveError>;
}

#[async_trait]
impl<T: SensorResolver + ?Sized> SensorResolver for std::sync::Arc<T> {
    async fn resolve(
        &self,
        site: &str,
        block: &str,
        subsystem: &str,
        tag: &str,
    ) -> Result<Option<i64>, ResolveError> {
        (**self).resolve(site, block, subsystem, tag).await
    }
}

// ---------------------------------------------------------------------------
// SensorCache
// ---------------------------------------------------------------------------

pub struct SensorCache {
    local: Mutex<HashMap<String, i64>>,
    redis: Option<redis::aio::ConnectionManager>,
    pool: PgPool,
    ttl_s: u64,
    metrics: Arc<IngestMetrics>,
}

impl SensorCache {
    pub fn new(
        pool: PgPool,
        redis: Option<redis::aio::ConnectionManager>,
        ttl_s: u64,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        SensorCache {
            local: Mutex::new(HashMap::new()),
            redis,
            pool,
            ttl_s,
            metrics,
        }
    }

    fn cache_key(site: &str, block: &str, subsystem: &str, tag: &str) -> String {
        format!("sensor:{}:{}:{}:{}", site, block, subsystem, tag)
    }

    /// Pre-load the registry for all active sites.  Returns the number of
    /// sensors loaded.
    pub async fn warm(&self) -> Result<usize, ResolveError> {
        let rows = sqlx::query(
            r#"SELECT s.site_slug, s.block_slug, s.subsystem, s.tag, s.id
               FROM sensors s
               JOIN sites st ON st.slug = s.site_slug
               WHERE st.status = 'active'"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ResolveError(e.to_string()))?;

        let mut local = self.local.lock().expect("cache lock poisoned");
        for row in &rows {
            let key = Self::cache_key(
                row.get::<String, _>(0).as_str(),
                row.get::<String, _>(1).as_str(),
                row.get::<String, _>(2).as_str(),
                row.get::<String, _>(3).as_str(),
            );
            local.insert(key, row.get::<i64, _>(4));
        }
        info!(sensors = rows.len(), "sensor cache warmed");
        Ok(rows.len())
    }

    pub fn local_size(&self) -> usize {
        self.local.lock().expect("cache lock poisoned").len()
    }

    async fn registry_lookup(
        &self,
        site: &str,
        block: &str,
        subsystem: &str,
        tag: &str,
    ) -> Result<Option<i64>, ResolveError> {
        sqlx::query_scalar::<_, i64>(
            r#"SELECT id FROM sensors
               WHERE site_slug = $1 AND block_slug = $2 AND subsystem = $3 AND tag = $4
               LIMIT 1"#,
        )
        .bind(site)
        .bind(block)
        .bind(subsystem)
        .bind(tag)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ResolveError(e.to_string()))
    }
}

#[async_trait]
impl SensorResolver for SensorCache {
    async fn resolve(
        &self,
        site: &str,
        block: &str,
        subsystem: &str,
        tag: &str,
    ) -> Result<Option<i64>, ResolveError> {
        let key = Self::cache_key(site, block, subsystem, tag);

        // Tier 1: in-process map.
        if let Some(&id) = self.local.lock().expect("cache lock poisoned").get(&key) {
            IngestMetrics::incr(&self.metrics.cache_hits);
            return Ok(Some(id));
        }

        // Tier 2: shared cache.
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            match conn.get::<_, Option<String>>(&key).await {
                Ok(Some(cached)) => {
                    if let Ok(id) = cached.parse::<i64>() {
                        self.local
                            .lock()
                            .expect("cache lock poisoned")
                            .insert(key, id);
                        IngestMetrics::incr(&self.metrics.cache_hits);
                        return Ok(Some(id));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "redis cache read failed"),
            }
        }

        // Tier 3: authoritative registry.
        IngestMetrics::incr(&self.metrics.cache_misses);
        let id = match self.registry_lookup(site, block, subsystem, tag).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        // Write back through both tiers.
        self.local
            .lock()
            .expect("cache lock poisoned")
            .insert(key.clone(), id);
        if let Some(redis) = &self.redis {
            let mut conn = redis.clone();
            if let Err(e) = conn
                .set_ex::<_, _, ()>(&key, id.to_string(), self.ttl_s)
                .await
            {
                warn!(error = %e, "redis cache write failed");
            }
        }

        Ok(Some(id))
    }
}
