/// Offline replay, end to end.
///
/// An adapter publishes 10 000 tagged readings while the cloud link is
/// down; every one lands in the store-and-forward buffer.  After
/// reconnect, the replay delivers them in order, the ingestor accepts all
/// of them, telemetry rows exist with the original timestamps, and the
/// buffer drains to zero.
use chrono::{TimeZone, Utc};
use edge::bridge::Bridge;
use edge::storage::buffer::Buffer;
use ingestor::batch::BatchWriter;
use ingestor::config::BatchConfig;
use ingestor::ingest::Ingestor;
use ingestor::metrics::IngestMetrics;
use mcs_test_utils::{
    telemetry_json, MapResolver, MemChannels, MemDeadLetters, MemTelemetryStore, RecordingCloud,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const COUNT: usize = 10_000;
const TOPIC: &str = "microlink/baldwinsville/block-01/thermal-l1/TT-101";

fn original_ts(i: usize) -> String {
    let base = Utc.with_ymd_and_hms(2027, 1, 15, 8, 0, 0).unwrap();
    (base + chrono::Duration::milliseconds(i as i64))
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

#[tokio::test]
async fn buffered_backlog_replays_in_order_into_storage() {
    // ── Edge side: cloud down, everything buffers ────────────────────
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(Mutex::new(
        Buffer::open(&dir.path().join("buffer.db"), 1_000_000).unwrap(),
    ));
    let cloud = Arc::new(RecordingCloud::down());
    let connected = Arc::new(AtomicBool::new(false));
    let bridge = Bridge::new(cloud.clone(), buffer.clone(), connected.clone());

    for i in 0..COUNT {
        let payload = telemetry_json(&original_ts(i), 20.0 + (i % 10) as f64, i as u64);
        bridge
            .route_local_message(TOPIC, payload.as_bytes(), 0, true)
            .await;
    }
    assert_eq!(bridge.buffer().lock().unwrap().depth(), COUNT as u64);
    assert!(cloud.published.lock().unwrap().is_empty());

    // ── Link restored: the 10 s evaluation starts a replay ───────────
    connected.store(true, Ordering::SeqCst);
    cloud.set_up(true);
    bridge.evaluate_replay().await;

    assert_eq!(bridge.buffer().lock().unwrap().depth(), 0, "buffer must drain");
    let published = cloud.published.lock().unwrap().clone();
    assert_eq!(published.len(), COUNT);

    // ── Cloud side: feed the replayed stream through the ingestor ────
    let metrics = Arc::new(IngestMetrics::new());
    let store = Arc::new(MemTelemetryStore::default());
    let writer = Arc::new(BatchWriter::new(
        store.clone(),
        BatchConfig::default(),
        metrics.clone(),
    ));
    let dlq = Arc::new(MemDeadLetters::default());
    let ingest = Ingestor::new(
        Arc::new(MapResolver::with(&[(
            "baldwinsville/block-01/thermal-l1/TT-101",
            42,
        )])),
        writer.clone(),
        dlq.clone(),
        Arc::new(MemChannels::default()),
        metrics.clone(),
    );

    for (topic, payload, _, _) in &published {
        ingest.handle_message(topic, payload).await;
    }
    writer.close_drain().await;

    // Every reading persisted, in publish order, with original stamps.
    let rows = store.rows.lock().unwrap();
    assert_eq!(rows.len(), COUNT);
    assert!(dlq.rows.lock().unwrap().is_empty());
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.sensor_id, 42);
        let expected = chrono::DateTime::parse_from_rfc3339(&original_ts(i))
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(row.time, expected, "timestamp preserved for row {}", i);
    }
}

#[tokio::test]
async fn replay_interrupted_by_a_second_outage_keeps_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(Mutex::new(
        Buffer::open(&dir.path().join("buffer.db"), 1_000_000).unwrap(),
    ));
    let cloud = Arc::new(RecordingCloud::down());
    let connected = Arc::new(AtomicBool::new(false));
    let bridge = Bridge::new(cloud.clone(), buffer.clone(), connected.clone());

    for i in 0..1200 {
        let payload = telemetry_json(&original_ts(i), 1.0, i as u64);
        bridge
            .route_local_message(TOPIC, payload.as_bytes(), 0, false)
            .await;
    }

    // First batch succeeds, then the link dies again: the replay engine
    // observes the publish failure and abandons instantly.
    connected.store(true, Ordering::SeqCst);
    cloud.set_up(true);
    {
        // Sabotage after the first batch by flipping the link mid-replay.
        let cloud = cloud.clone();
        let connected = connected.clone();
        tokio::spawn(async move {
            // The inter-batch pause gives this a window to land.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            cloud.set_up(false);
            connected.store(false, Ordering::SeqCst);
        });
    }
    bridge.evaluate_replay().await;

    let sent = cloud.published.lock().unwrap().len();
    let remaining = bridge.buffer().lock().unwrap().depth() as usize;
    // Dispatched records are deleted; the rest stay durably queued.
    assert_eq!(sent + remaining, 1200);
    assert!(remaining > 0, "second outage must leave a tail queued");

    // Third attempt finishes the job.
    connected.store(true, Ordering::SeqCst);
    cloud.set_up(true);
    bridge.evaluate_replay().await;
    assert_eq!(bridge.buffer().lock().unwrap().depth(), 0);
    assert_eq!(cloud.published.lock().unwrap().len(), 1200);
}
