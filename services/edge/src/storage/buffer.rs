//! Durable SQLite ring buffer for cloud-bound messages.
//!
//! # Schema
//! - `buffer`: `(id, topic, payload, qos, retain, created_at)` with `id`
//!   assigned in append order and preserved across restarts.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! # Group commit
//! Appends accumulate in an open transaction committed every
//! [`COMMIT_EVERY_APPENDS`] rows or [`COMMIT_EVERY`] of wall time,
//! whichever comes first.  An unclean process exit therefore loses at
//! most one such batch.

use rusqlite::{params, Connection};
use std::path::Path;
use std::time::{Duration, Instant};

/// Commit the open append transaction after this many rows.
pub const COMMIT_EVERY_APPENDS: u32 = 1000;

/// ...or after this much wall time, whichever comes first.
pub const COMMIT_EVERY: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A message retrieved from the buffer for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// The durable store-and-forward buffer for a single edge instance.
pub struct Buffer {
    conn: Connection,
    capacity: u64,
    depth: u64,
    pending_appends: u32,
    batch_started: Option<Instant>,
}

impl Buffer {
    /// Open (or create) the buffer at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, creates the schema
    /// if needed, and counts the surviving backlog.
    pub fn open(path: &Path, capacity: u64) -> Result<Self, BufferError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;

        let depth: i64 = conn.query_row("SELECT COUNT(*) FROM buffer", [], |row| row.get(0))?;

        Ok(Buffer {
            conn,
            capacity,
            depth: depth as u64,
            pending_appends: 0,
            batch_started: None,
        })
    }

    /// Append one message in arrival order.
    ///
    /// The row is part of the open group-commit transaction; durability is
    /// bounded by the commit thresholds, and `commit()` forces it.
    pub fn append(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), BufferError> {
        self.begin_if_needed()?;

        let created_at = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO buffer (topic, payload, qos, retain, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![topic, payload, qos, retain as i64, created_at],
        )?;
        self.depth += 1;
        self.pending_appends += 1;

        // Ring semantics: evict oldest when over capacity.
        if self.depth > self.capacity {
            let excess = (self.depth - self.capacity) as i64;
            let deleted = self.conn.execute(
                "DELETE FROM buffer WHERE id IN
                     (SELECT id FROM buffer ORDER BY id ASC LIMIT ?1)",
                params![excess],
            )?;
            self.depth -= deleted as u64;
        }

        let elapsed = self
            .batch_started
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        if self.pending_appends >= COMMIT_EVERY_APPENDS || elapsed >= COMMIT_EVERY {
            self.commit()?;
        }
        Ok(())
    }

    /// Force-commit any pending appends.
    pub fn commit(&mut self) -> Result<(), BufferError> {
        if self.batch_started.is_some() {
            self.conn.execute_batch("COMMIT")?;
            self.batch_started = None;
            self.pending_appends = 0;
        }
        Ok(())
    }

    fn begin_if_needed(&mut self) -> Result<(), BufferError> {
        if self.batch_started.is_none() {
            self.conn.execute_batch("BEGIN")?;
            self.batch_started = Some(Instant::now());
        }
        Ok(())
    }

    /// Current record count.
    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Timestamp of the oldest buffered record, if any.
    pub fn oldest_ts(&mut self) -> Result<Option<String>, BufferError> {
        self.commit()?;
        let ts = self
            .conn
            .query_row("SELECT MIN(created_at) FROM buffer", [], |row| row.get(0))?;
        Ok(ts)
    }

    /// Fetch up to `limit` of the oldest records in id order.
    ///
    /// Commits pending appends first so the snapshot is durable.
    pub fn fetch_batch(&mut self, limit: u32) -> Result<Vec<BufferedMessage>, BufferError> {
        self.commit()?;
        let mut stmt = self.conn.prepare(
            "SELECT id, topic, payload, qos, retain FROM buffer
             ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(BufferedMessage {
                id: row.get(0)?,
                topic: row.get(1)?,
                payload: row.get(2)?,
                qos: row.get::<_, i64>(3)? as u8,
                retain: row.get::<_, i64>(4)? != 0,
            })
        })?;
        let mut messages = Vec::new();
        for r in rows {
            messages.push(r?);
        }
        Ok(messages)
    }

    /// Delete records whose cloud publish has been acknowledged.
    ///
    /// Commits immediately; a record must never outlive its ack by a
    /// process crash and be replayed twice silently, nor be deleted before
    /// the ack (the caller only passes acked ids).
    pub fn delete_acked(&mut self, ids: &[i64]) -> Result<u64, BufferError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.commit()?;
        let placeholders = std::iter::repeat("?")
            .take(ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("DELETE FROM buffer WHERE id IN ({})", placeholders);
        let deleted = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
        self.depth -= deleted as u64;
        Ok(deleted as u64)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let _ = self.commit();
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), BufferError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), BufferError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(BufferError::IntegrityCheckFailed(result));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_buffer(capacity: u64) -> (Buffer, NamedTempFile) {
        let file = NamedTempFile::new().expect("temp file");
        let buffer = Buffer::open(file.path(), capacity).expect("open buffer");
        (buffer, file)
    }

    #[test]
    fn appends_preserve_arrival_order() {
        let (mut buffer, _file) = make_buffer(100);
        for i in 0..5 {
            buffer
                .append(&format!("microlink/s/b/electrical/T{}", i), b"{}", 0, false)
                .unwrap();
        }
        let batch = buffer.fetch_batch(10).unwrap();
        assert_eq!(batch.len(), 5);
        for (i, msg) in batch.iter().enumerate() {
            assert!(msg.topic.ends_with(&format!("T{}", i)));
        }
        // Ids are strictly increasing.
        assert!(batch.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn depth_and_order_survive_reopen() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut buffer = Buffer::open(file.path(), 100).unwrap();
            buffer.append("t/a", b"1", 0, false).unwrap();
            buffer.append("t/b", b"2", 1, true).unwrap();
            // Dropped here: pending batch commits on drop.
        }

        let mut buffer = Buffer::open(file.path(), 100).unwrap();
        assert_eq!(buffer.depth(), 2);
        let batch = buffer.fetch_batch(10).unwrap();
        assert_eq!(batch[0].topic, "t/a");
        assert_eq!(batch[1].topic, "t/b");
        assert_eq!(batch[1].qos, 1);
        assert!(batch[1].retain);
    }

    #[test]
    fn over_capacity_evicts_oldest_first() {
        let (mut buffer, _file) = make_buffer(3);
        for i in 0..5 {
            buffer
                .append(&format!("t/{}", i), b"x", 0, false)
                .unwrap();
        }
        assert_eq!(buffer.depth(), 3);
        let batch = buffer.fetch_batch(10).unwrap();
        let topics: Vec<_> = batch.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["t/2", "t/3", "t/4"]);
    }

    #[test]
    fn delete_acked_removes_only_the_given_ids() {
        let (mut buffer, _file) = make_buffer(100);
        for i in 0..4 {
            buffer
                .append(&format!("t/{}", i), b"x", 0, false)
                .unwrap();
        }
        let batch = buffer.fetch_batch(2).unwrap();
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let deleted = buffer.delete_acked(&ids).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(buffer.depth(), 2);

        let rest = buffer.fetch_batch(10).unwrap();
        assert_eq!(rest[0].topic, "t/2");
    }

    #[test]
    fn group_commit_flushes_at_the_row_threshold() {
        let file = NamedTempFile::new().unwrap();
        let mut buffer = Buffer::open(file.path(), 10_000).unwrap();
        for i in 0..(COMMIT_EVERY_APPENDS as usize) {
            buffer
                .append(&format!("t/{}", i), b"x", 0, false)
                .unwrap();
        }
        // The threshold commit has run; a second connection sees the rows.
        let other = Connection::open(file.path()).unwrap();
        let count: i64 = other
            .query_row("SELECT COUNT(*) FROM buffer", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, i64::from(COMMIT_EVERY_APPENDS));
        drop(buffer);
    }

    #[test]
    fn oldest_ts_reports_the_head_of_the_queue() {
        let (mut buffer, _file) = make_buffer(100);
        assert_eq!(buffer.oldest_ts().unwrap(), None);
        buffer.append("t/a", b"x", 0, false).unwrap();
        assert!(buffer.oldest_ts().unwrap().is_some());
    }
}
