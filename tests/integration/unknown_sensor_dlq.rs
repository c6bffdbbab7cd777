/// Unknown sensor, end to end.
///
/// A well-formed message on an unregistered tag produces exactly one DLQ
/// row with category SENSOR_UNKNOWN and zero telemetry rows.
use ingestor::batch::BatchWriter;
use ingestor::config::BatchConfig;
use ingestor::ingest::Ingestor;
use ingestor::metrics::IngestMetrics;
use mcs_proto::dlq_categories;
use mcs_test_utils::{telemetry_json, MapResolver, MemChannels, MemDeadLetters, MemTelemetryStore};
use std::sync::Arc;

fn make_ingestor(
    sensors: &[(&str, i64)],
) -> (
    Ingestor<Arc<MapResolver>, Arc<MemTelemetryStore>, Arc<MemDeadLetters>, Arc<MemChannels>>,
    Arc<BatchWriter<Arc<MemTelemetryStore>>>,
    Arc<MemTelemetryStore>,
    Arc<MemDeadLetters>,
) {
    let metrics = Arc::new(IngestMetrics::new());
    let store = Arc::new(MemTelemetryStore::default());
    let writer = Arc::new(BatchWriter::new(
        store.clone(),
        BatchConfig::default(),
        metrics.clone(),
    ));
    let dlq = Arc::new(MemDeadLetters::default());
    let ingestor = Ingestor::new(
        Arc::new(MapResolver::with(sensors)),
        writer.clone(),
        dlq.clone(),
        Arc::new(MemChannels::default()),
        metrics,
    );
    (ingestor, writer, store, dlq)
}

#[tokio::test]
async fn unregistered_tag_dead_letters_once_with_no_telemetry() {
    let (ingestor, writer, store, dlq) = make_ingestor(&[]);

    ingestor
        .handle_message(
            "microlink/baldwinsville/block-01/thermal-l1/TT-999",
            telemetry_json("2027-01-15T10:30:00Z", 21.5, 1).as_bytes(),
        )
        .await;
    writer.close_drain().await;

    let rows = dlq.rows.lock().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].category, dlq_categories::SENSOR_UNKNOWN);
    assert!(rows[0].message.contains("TT-999"));
    assert!(rows[0].payload.contains("21.5"), "raw payload preserved");

    assert!(store.rows.lock().unwrap().is_empty(), "zero telemetry rows");
}

#[tokio::test]
async fn registered_neighbour_is_unaffected() {
    let (ingestor, writer, store, dlq) =
        make_ingestor(&[("baldwinsville/block-01/thermal-l1/TT-101", 7)]);

    // One unknown, one known.
    ingestor
        .handle_message(
            "microlink/baldwinsville/block-01/thermal-l1/TT-999",
            telemetry_json("2027-01-15T10:30:00Z", 1.0, 1).as_bytes(),
        )
        .await;
    ingestor
        .handle_message(
            "microlink/baldwinsville/block-01/thermal-l1/TT-101",
            telemetry_json("2027-01-15T10:30:01Z", 2.0, 2).as_bytes(),
        )
        .await;
    writer.close_drain().await;

    assert_eq!(dlq.rows.lock().unwrap().len(), 1);
    let rows = store.rows.lock().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sensor_id, 7);
}

#[tokio::test]
async fn each_outcome_is_exactly_one_of_row_dlq_or_drop() {
    // Mixed stream: 3 accepted, 2 unknown, 1 parse error.
    let (ingestor, writer, store, dlq) =
        make_ingestor(&[("baldwinsville/block-01/electrical/P-MSB-TOTAL", 3)]);

    let good_topic = "microlink/baldwinsville/block-01/electrical/P-MSB-TOTAL";
    for i in 0..3 {
        ingestor
            .handle_message(
                good_topic,
                telemetry_json("2027-01-15T10:30:00Z", i as f64, i).as_bytes(),
            )
            .await;
    }
    for tag in ["X-1", "X-2"] {
        ingestor
            .handle_message(
                &format!("microlink/baldwinsville/block-01/electrical/{}", tag),
                telemetry_json("2027-01-15T10:30:00Z", 0.0, 0).as_bytes(),
            )
            .await;
    }
    ingestor.handle_message(good_topic, b"{broken").await;
    writer.close_drain().await;

    assert_eq!(store.rows.lock().unwrap().len(), 3);
    let dlq_rows = dlq.rows.lock().unwrap();
    assert_eq!(dlq_rows.len(), 3);
    assert_eq!(
        dlq_rows
            .iter()
            .filter(|r| r.category == dlq_categories::SENSOR_UNKNOWN)
            .count(),
        2
    );
    assert_eq!(
        dlq_rows
            .iter()
            .filter(|r| r.category == dlq_categories::PARSE_ERROR)
            .count(),
        1
    );
}
