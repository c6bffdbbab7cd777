/// Backpressure drop, end to end.
///
/// With the batch buffer forced to its high-water mark, the next 100
/// messages increment the overflow counter; no telemetry rows are added
/// for them and no DLQ rows are written.
use ingestor::batch::BatchWriter;
use ingestor::config::BatchConfig;
use ingestor::ingest::Ingestor;
use ingestor::metrics::IngestMetrics;
use mcs_test_utils::{telemetry_json, MapResolver, MemChannels, MemDeadLetters, MemTelemetryStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const TOPIC: &str = "microlink/baldwinsville/block-01/electrical/P-MSB-TOTAL";
const SENSOR: (&str, i64) = ("baldwinsville/block-01/electrical/P-MSB-TOTAL", 3);
const HIGH_WATER: usize = 500;

#[tokio::test]
async fn messages_beyond_the_high_water_mark_are_counted_not_stored() {
    let metrics = Arc::new(IngestMetrics::new());
    let store = Arc::new(MemTelemetryStore::default());
    let writer = Arc::new(BatchWriter::new(
        store.clone(),
        BatchConfig {
            size: HIGH_WATER,
            flush_interval_ms: 60_000,
            max_pending: HIGH_WATER,
            insert_timeout_s: 30,
        },
        metrics.clone(),
    ));
    let dlq = Arc::new(MemDeadLetters::default());
    let ingestor = Ingestor::new(
        Arc::new(MapResolver::with(&[SENSOR])),
        writer.clone(),
        dlq.clone(),
        Arc::new(MemChannels::default()),
        metrics.clone(),
    );

    // Fill the buffer exactly to the mark (no flusher task is running).
    for i in 0..HIGH_WATER {
        ingestor
            .handle_message(
                TOPIC,
                telemetry_json("2027-01-15T10:30:00Z", i as f64, i as u64).as_bytes(),
            )
            .await;
    }
    assert_eq!(writer.pending(), HIGH_WATER);

    // The next 100 messages are dropped and counted.
    for i in 0..100 {
        ingestor
            .handle_message(
                TOPIC,
                telemetry_json("2027-01-15T10:30:01Z", i as f64, i as u64).as_bytes(),
            )
            .await;
    }

    assert_eq!(metrics.rows_dropped.load(Ordering::Relaxed), 100);
    assert_eq!(writer.pending(), HIGH_WATER, "buffer never exceeds the mark");
    assert!(dlq.rows.lock().unwrap().is_empty(), "drops are not DLQ'd");

    // Draining the buffer stores exactly the accepted rows.
    writer.close_drain().await;
    assert_eq!(store.rows.lock().unwrap().len(), HIGH_WATER);

    // Intake recovers once the buffer has room again.
    ingestor
        .handle_message(
            TOPIC,
            telemetry_json("2027-01-15T10:30:02Z", 1.0, 1).as_bytes(),
        )
        .await;
    assert_eq!(writer.pending(), 1);
    assert_eq!(metrics.rows_dropped.load(Ordering::Relaxed), 100);
}

#[tokio::test]
async fn failed_flush_with_full_buffer_drops_oldest_and_keeps_accounting() {
    let metrics = Arc::new(IngestMetrics::new());
    let store = Arc::new(MemTelemetryStore::default());
    let writer = Arc::new(BatchWriter::new(
        store.clone(),
        BatchConfig {
            size: 10,
            flush_interval_ms: 60_000,
            max_pending: 10,
            insert_timeout_s: 30,
        },
        metrics.clone(),
    ));
    let ingestor = Ingestor::new(
        Arc::new(MapResolver::with(&[SENSOR])),
        writer.clone(),
        Arc::new(MemDeadLetters::default()),
        Arc::new(MemChannels::default()),
        metrics.clone(),
    );

    for i in 0..10 {
        ingestor
            .handle_message(
                TOPIC,
                telemetry_json("2027-01-15T10:30:00Z", i as f64, i as u64).as_bytes(),
            )
            .await;
    }

    // The DB rejects the flush: rows return to the buffer intact.
    store.failing.store(true, Ordering::SeqCst);
    writer.flush().await;
    assert_eq!(writer.pending(), 10);
    assert_eq!(metrics.flush_errors.load(Ordering::Relaxed), 1);

    // Recovery writes everything exactly once.
    store.failing.store(false, Ordering::SeqCst);
    writer.flush().await;
    assert_eq!(store.rows.lock().unwrap().len(), 10);
    assert_eq!(writer.pending(), 0);

    // written + dropped accounts for every accepted row.
    let written = metrics.rows_written.load(Ordering::Relaxed);
    let dropped = metrics.rows_dropped.load(Ordering::Relaxed);
    assert_eq!(written + dropped, 10);
}
