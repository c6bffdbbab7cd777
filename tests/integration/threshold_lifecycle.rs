/// Threshold raise/clear with deadband, end to end through the engine.
///
/// Sensor X has `{H: value=50, priority=P2, delay_s=10}` and a 2 %
/// deadband.  The stream v=45, v=52 (15 s), v=50.5, v=48.9, ack must
/// produce exactly: RAISED at second 10, hold at 50.5 (above 49.0),
/// RTN_UNACK at 48.9, CLEARED on ack — in that audit order with
/// non-decreasing timestamps.
use alarm_engine::cascade::default_rules;
use alarm_engine::config::EngineConfig;
use alarm_engine::engine::{AlarmEngine, AlarmFilters};
use chrono::{DateTime, Utc};
use mcs_test_utils::{make_signal, MemAlarmStore, MemEvents};
use std::sync::Arc;

fn t(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_900_000_000 + seconds, 0).unwrap()
}

#[tokio::test]
async fn raise_deadband_hold_rtn_and_ack() {
    let store = Arc::new(MemAlarmStore::with_thresholds(
        1,
        "TT-101",
        serde_json::json!({ "H": {"value": 50.0, "priority": "P2", "delay_s": 10} }),
    ));
    let events = Arc::new(MemEvents::default());
    let engine = AlarmEngine::new(
        EngineConfig::default(),
        store.clone(),
        events.clone(),
        default_rules(),
    )
    .unwrap();
    engine.load_state().await.unwrap();

    let sig = |v: f64| make_signal(1, "thermal-l1", "TT-101", v);

    // v=45: inside the band, nothing happens.
    engine.process_signal(&sig(45.0), t(0), 0.0).await;
    assert!(engine.list(&AlarmFilters::default()).await.is_empty());

    // v=52 sustained: debounce holds for 10 s, then P2 raises.
    engine.process_signal(&sig(52.0), t(1), 1.0).await;
    engine.process_signal(&sig(52.0), t(6), 6.0).await;
    assert!(engine.list(&AlarmFilters::default()).await.is_empty());
    engine.process_signal(&sig(52.0), t(11), 11.0).await;
    let active = engine.list(&AlarmFilters::default()).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state, "ACTIVE");
    assert_eq!(active[0].priority, mcs_proto::Priority::P2);
    assert_eq!(active[0].threshold_value, Some(50.0));

    // v=50.5: below the threshold but above the 49.0 clear point.
    engine.process_signal(&sig(50.5), t(20), 20.0).await;
    let held = engine.list(&AlarmFilters::default()).await;
    assert_eq!(held[0].state, "ACTIVE", "deadband must hold the alarm");
    assert_eq!(held[0].last_value, Some(50.5));

    // v=48.9: past the deadband, returns to normal unacknowledged.
    engine.process_signal(&sig(48.9), t(25), 25.0).await;
    assert_eq!(
        engine.list(&AlarmFilters::default()).await[0].state,
        "RTN_UNACK"
    );

    // Operator ack completes the lifecycle.
    let snap = engine.acknowledge(1, "rdiaz", t(30)).await.unwrap();
    assert_eq!(snap.state, "CLEARED");
    assert_eq!(snap.acked_by.as_deref(), Some("rdiaz"));

    // Audit trail: every adjacent pair is a legal transition.
    assert_eq!(
        store.event_types(),
        vec!["alarm_raised", "alarm_rtn_unack", "alarm_acked"]
    );

    // Outbound fan-out mirrors the audit trail.
    assert_eq!(
        events.names(),
        vec!["alarm_raised", "alarm_rtn_unack", "alarm_acked"]
    );

    // Timestamps across the lifecycle are monotonically non-decreasing.
    let saved = store.saved.lock().unwrap();
    let last = saved.last().unwrap();
    assert!(last.acked_at.unwrap() >= last.raised_at.unwrap());
    assert!(last.cleared_at.unwrap() >= last.raised_at.unwrap());
}

#[tokio::test]
async fn fresh_excursion_after_cleared_starts_a_new_instance() {
    let store = Arc::new(MemAlarmStore::with_thresholds(
        1,
        "TT-101",
        serde_json::json!({ "H": {"value": 50.0, "priority": "P2"} }),
    ));
    let events = Arc::new(MemEvents::default());
    let engine = AlarmEngine::new(
        EngineConfig::default(),
        store.clone(),
        events.clone(),
        default_rules(),
    )
    .unwrap();
    engine.load_state().await.unwrap();

    let sig = |v: f64| make_signal(1, "thermal-l1", "TT-101", v);

    engine.process_signal(&sig(52.0), t(0), 0.0).await;
    engine.acknowledge(1, "op", t(1)).await.unwrap();
    engine.process_signal(&sig(40.0), t(2), 2.0).await; // ACKED → CLEARED

    // Second excursion gets a fresh raised_at.
    engine.process_signal(&sig(55.0), t(100), 100.0).await;
    let active = engine.list(&AlarmFilters::default()).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state, "ACTIVE");
    assert_eq!(
        active[0].raised_at.as_deref(),
        Some(t(100).to_rfc3339().as_str())
    );
    assert_eq!(active[0].acked_by, None, "fresh instance carries no old ack");
}
