/// Cascade suppression, end to end.
///
/// Raising `ML-PUMP-A-SPEED` (thermal-l2) must suppress the already
/// ACTIVE `ML-FLOW` and `PHX-01-T` alarms, each pointing back at the
/// cause.  When the cause clears, both effects transition to CLEARED, and
/// their release events follow the cause's clear in audit order.
use alarm_engine::cascade::default_rules;
use alarm_engine::config::EngineConfig;
use alarm_engine::engine::{AlarmEngine, AlarmFilters};
use chrono::{DateTime, Utc};
use mcs_test_utils::{make_signal, MemAlarmStore, MemEvents};
use std::sync::Arc;

fn t(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_900_000_000 + seconds, 0).unwrap()
}

const CAUSE: i64 = 1;
const FLOW: i64 = 20;
const PHX: i64 = 21;

async fn engine_with_cause_thresholds(
) -> (AlarmEngine<Arc<MemAlarmStore>, Arc<MemEvents>>, Arc<MemAlarmStore>, Arc<MemEvents>) {
    // The cause sensor has a LOW band so a recovered speed can clear it.
    let store = Arc::new(MemAlarmStore::with_thresholds(
        CAUSE,
        "ML-PUMP-A-SPEED",
        serde_json::json!({ "L": {"value": 1000.0, "priority": "P1"} }),
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
    (engine, store, events)
}

#[tokio::test]
async fn pump_trip_suppresses_downstream_and_release_follows_clear() {
    let (engine, store, _events) = engine_with_cause_thresholds().await;

    // Two downstream alarms are already ACTIVE.
    engine
        .process_signal(&make_signal(FLOW, "thermal-l2", "ML-FLOW", 2.0), t(0), 0.0)
        .await;
    engine
        .process_signal(&make_signal(PHX, "thermal-l3", "PHX-01-T", 71.0), t(1), 1.0)
        .await;

    // Pump speed collapses: the cause raises P1 and cascades.
    engine
        .process_signal(
            &make_signal(CAUSE, "thermal-l2", "ML-PUMP-A-SPEED", 120.0),
            t(2),
            2.0,
        )
        .await;

    let suppressed = engine
        .list(&AlarmFilters {
            state: Some("SUPPRESSED".to_owned()),
            ..AlarmFilters::default()
        })
        .await;
    assert_eq!(suppressed.len(), 2);
    assert!(suppressed
        .iter()
        .all(|a| a.suppressed_by_sensor_id == Some(CAUSE)));
    let tags: Vec<&str> = suppressed.iter().map(|a| a.tag.as_str()).collect();
    assert!(tags.contains(&"ML-FLOW") && tags.contains(&"PHX-01-T"));

    // Operator acks the cause, then the speed recovers past the LOW
    // deadband (1000 × 1.02 = 1020): ACKED → CLEARED.
    engine.acknowledge(CAUSE, "op", t(10)).await.unwrap();
    engine
        .process_signal(
            &make_signal(CAUSE, "thermal-l2", "ML-PUMP-A-SPEED", 1450.0),
            t(20),
            20.0,
        )
        .await;

    // Both effects released to CLEARED; nothing remains suppressed.
    assert!(engine
        .list(&AlarmFilters {
            state: Some("SUPPRESSED".to_owned()),
            ..AlarmFilters::default()
        })
        .await
        .is_empty());
    assert!(engine.list(&AlarmFilters::default()).await.is_empty());

    // Audit order: the cause's clear precedes both release events.
    let types = store.event_types();
    let clear_idx = types.iter().position(|e| e == "alarm_cleared").unwrap();
    let release_idxs: Vec<usize> = types
        .iter()
        .enumerate()
        .filter(|(_, e)| *e == "alarm_unsuppressed")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(release_idxs.len(), 2);
    assert!(release_idxs.iter().all(|&i| i > clear_idx));
}

#[tokio::test]
async fn late_arriving_effect_is_raised_then_immediately_suppressed() {
    let (engine, store, _events) = engine_with_cause_thresholds().await;

    // Cause trips first.
    engine
        .process_signal(
            &make_signal(CAUSE, "thermal-l2", "ML-PUMP-A-SPEED", 120.0),
            t(0),
            0.0,
        )
        .await;

    // A flow alarm arrives while the cause is active: it gets a stable
    // instance (RAISED audit fires) and is then suppressed.
    engine
        .process_signal(&make_signal(FLOW, "thermal-l2", "ML-FLOW", 1.5), t(5), 5.0)
        .await;

    let listed = engine.list(&AlarmFilters::default()).await;
    let flow = listed.iter().find(|a| a.sensor_id == FLOW).unwrap();
    assert_eq!(flow.state, "SUPPRESSED");
    assert_eq!(flow.suppressed_by_sensor_id, Some(CAUSE));

    let types = store.event_types();
    let raised = types.iter().rposition(|e| e == "alarm_raised").unwrap();
    let suppressed = types.iter().position(|e| e == "alarm_suppressed").unwrap();
    assert!(raised < suppressed, "raise audit fires before suppression");

    // The released effect is NOT automatically re-raised; the engine
    // waits for its next signal.
    engine.acknowledge(CAUSE, "op", t(6)).await.unwrap();
    engine
        .process_signal(
            &make_signal(CAUSE, "thermal-l2", "ML-PUMP-A-SPEED", 1450.0),
            t(7),
            7.0,
        )
        .await;
    assert!(engine.list(&AlarmFilters::default()).await.is_empty());

    // Next matching signal re-raises the effect on its own merits.
    engine
        .process_signal(&make_signal(FLOW, "thermal-l2", "ML-FLOW", 1.2), t(8), 8.0)
        .await;
    let listed = engine.list(&AlarmFilters::default()).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].sensor_id, FLOW);
    assert_eq!(listed[0].state, "ACTIVE");
}
