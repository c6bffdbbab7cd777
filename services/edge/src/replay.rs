//! Replay engine: drains the store-and-forward buffer to the cloud broker.
//!
//! Records are re-published in id order, in batches of
//! [`REPLAY_BATCH_SIZE`] with an inter-batch pause, and deleted only after
//! the cloud publish is acknowledged.  A replay is abandonable instantly:
//! records already dispatched stay deleted, the rest remain durably
//! queued.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::storage::buffer::Buffer;

pub const REPLAY_BATCH_SIZE: u32 = 500;
pub const REPLAY_BATCH_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
#[error("cloud publish failed: {0}")]
pub struct CloudPublishError(pub String);

/// The cloud broker capability the bridge and the replay engine need.
/// An `Ok` return means the broker has acknowledged the publish.
#[async_trait]
pub trait CloudPublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), CloudPublishError>;
}

#[async_trait]
impl<T: CloudPublisher + ?Sized> CloudPublisher for std::sync::Arc<T> {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: u8,
        retain: bool,
    ) -> Result<(), CloudPublishError> {
        (**self).publish(topic, payload, qos, retain).await
    }
}

/// What a replay run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: u64,
    pub remaining: u64,
    /// True if the run stopped early (link dropped or publish failed).
    pub aborted: bool,
}

/// Drain the buffer through `publisher` while `connected()` holds.
///
/// The buffer lock is never held across a publish await: each batch is
/// snapshotted, published, and then its acked ids are deleted.
pub async fn replay_buffer<P, F>(
    buffer: &Mutex<Buffer>,
    publisher: &P,
    connected: F,
) -> ReplayOutcome
where
    P: CloudPublisher + ?Sized,
    F: Fn() -> bool,
{
    let starting_depth = buffer.lock().expect("buffer lock poisoned").depth();
    if starting_depth == 0 {
        return ReplayOutcome {
            replayed: 0,
            remaining: 0,
            aborted: false,
        };
    }
    info!(depth = starting_depth, "buffer replay starting");

    let mut replayed: u64 = 0;
    let mut aborted = false;

    'outer: loop {
        let batch = {
            let mut buffer = buffer.lock().expect("buffer lock poisoned");
            match buffer.fetch_batch(REPLAY_BATCH_SIZE) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "replay fetch failed");
                    aborted = true;
                    break;
                }
            }
        };
        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();

        let mut acked: Vec<i64> = Vec::with_capacity(batch.len());
        for msg in batch {
            if !connected() {
                aborted = true;
                break;
            }
            match publisher
                .publish(&msg.topic, &msg.payload, msg.qos, msg.retain)
                .await
            {
                Ok(()) => acked.push(msg.id),
                Err(e) => {
                    warn!(error = %e, topic = %msg.topic, "replay publish failed");
                    aborted = true;
                    break;
                }
            }
        }

        replayed += acked.len() as u64;
        {
            let mut buffer = buffer.lock().expect("buffer lock poisoned");
            if let Err(e) = buffer.delete_acked(&acked) {
                warn!(error = %e, "failed to delete acked records");
                aborted = true;
            }
        }

        if aborted {
            break 'outer;
        }
        if batch_len < REPLAY_BATCH_SIZE as usize {
            break;
        }
        // Throttle so the replay does not starve live traffic.
        tokio::time::sleep(REPLAY_BATCH_PAUSE).await;
    }

    let remaining = buffer.lock().expect("buffer lock poisoned").depth();
    info!(replayed, remaining, aborted, "buffer replay finished");
    ReplayOutcome {
        replayed,
        remaining,
        aborted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    struct RecordingCloud {
        published: Mutex<Vec<(String, Vec<u8>)>>,
        fail_after: Option<u64>,
        count: AtomicU64,
    }

    impl RecordingCloud {
        fn new() -> Self {
            RecordingCloud {
                published: Mutex::new(Vec::new()),
                fail_after: None,
                count: AtomicU64::new(0),
            }
        }

        fn failing_after(n: u64) -> Self {
            RecordingCloud {
                fail_after: Some(n),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl CloudPublisher for RecordingCloud {
        async fn publish(
            &self,
            topic: &str,
            payload: &[u8],
            _qos: u8,
            _retain: bool,
        ) -> Result<(), CloudPublishError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if n >= limit {
                    return Err(CloudPublishError("link down".to_owned()));
                }
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_owned(), payload.to_vec()));
            Ok(())
        }
    }

    fn filled_buffer(n: usize) -> (Mutex<Buffer>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let mut buffer = Buffer::open(file.path(), 1_000_000).unwrap();
        for i in 0..n {
            buffer
                .append(
                    &format!("microlink/s/b/electrical/T{:04}", i),
                    format!("{{\"seq\":{}}}", i).as_bytes(),
                    0,
                    false,
                )
                .unwrap();
        }
        (Mutex::new(buffer), file)
    }

    #[tokio::test]
    async fn full_replay_drains_in_order_and_empties_the_buffer() {
        let (buffer, _file) = filled_buffer(1200);
        let cloud = RecordingCloud::new();

        let outcome = replay_buffer(&buffer, &cloud, || true).await;
        assert_eq!(outcome.replayed, 1200);
        assert_eq!(outcome.remaining, 0);
        assert!(!outcome.aborted);

        let published = cloud.published.lock().unwrap();
        assert_eq!(published.len(), 1200);
        // Id order = arrival order.
        for (i, (topic, _)) in published.iter().enumerate() {
            assert!(topic.ends_with(&format!("T{:04}", i)), "out of order at {}", i);
        }
        assert_eq!(buffer.lock().unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn publish_failure_aborts_and_keeps_the_tail_queued() {
        let (buffer, _file) = filled_buffer(100);
        let cloud = RecordingCloud::failing_after(40);

        let outcome = replay_buffer(&buffer, &cloud, || true).await;
        assert!(outcome.aborted);
        assert_eq!(outcome.replayed, 40);
        assert_eq!(outcome.remaining, 60);

        // Dispatched records are gone; the rest survive in order.
        let mut buffer = buffer.into_inner().unwrap();
        let batch = buffer.fetch_batch(10).unwrap();
        assert!(batch[0].topic.ends_with("T0040"));
    }

    #[tokio::test]
    async fn link_drop_aborts_between_messages() {
        let (buffer, _file) = filled_buffer(50);
        let cloud = RecordingCloud::new();
        let connected = Arc::new(AtomicBool::new(true));

        // Drop the link after 10 publishes.
        let connected_check = {
            let connected = connected.clone();
            let seen = AtomicU64::new(0);
            move || {
                if seen.fetch_add(1, Ordering::SeqCst) >= 10 {
                    connected.store(false, Ordering::SeqCst);
                }
                connected.load(Ordering::SeqCst)
            }
        };

        let outcome = replay_buffer(&buffer, &cloud, connected_check).await;
        assert!(outcome.aborted);
        assert_eq!(outcome.replayed, 10);
        assert_eq!(outcome.remaining, 40);
    }

    #[tokio::test]
    async fn empty_buffer_is_a_no_op() {
        let (buffer, _file) = filled_buffer(0);
        let cloud = RecordingCloud::new();
        let outcome = replay_buffer(&buffer, &cloud, || true).await;
        assert_eq!(
            outcome,
            ReplayOutcome {
                replayed: 0,
                remaining: 0,
                aborted: false
            }
        );
    }
}
