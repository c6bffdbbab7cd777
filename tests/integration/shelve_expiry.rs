/// Shelve and expire, end to end.
///
/// An operator shelves an ACTIVE alarm with a reason and a 1-hour
/// duration.  After one hour of simulated time the shelve monitor
/// transitions the instance to CLEARED with a `timer_expired` audit
/// reason; `shelved_until` holds until that event.
use alarm_engine::cascade::default_rules;
use alarm_engine::config::EngineConfig;
use alarm_engine::engine::{AlarmEngine, AlarmFilters, OperatorError};
use chrono::{DateTime, Utc};
use mcs_test_utils::{make_signal, MemAlarmStore, MemEvents};
use std::sync::Arc;

fn t(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_900_000_000 + seconds, 0).unwrap()
}

#[tokio::test]
async fn shelved_alarm_expires_after_one_hour() {
    let store = Arc::new(MemAlarmStore::default());
    let events = Arc::new(MemEvents::default());
    let engine = AlarmEngine::new(
        EngineConfig::default(),
        store.clone(),
        events.clone(),
        default_rules(),
    )
    .unwrap();
    engine.load_state().await.unwrap();

    engine
        .process_signal(&make_signal(1, "thermal-l1", "TT-101", 91.0), t(0), 0.0)
        .await;

    let result = engine
        .shelve(1, "rdiaz", "maintenance work order 123", 1.0, t(60))
        .await
        .unwrap();
    assert_eq!(result.alarm.state, "SHELVED");
    assert!(!result.duration_clamped);
    assert_eq!(
        result.alarm.shelve_reason.as_deref(),
        Some("maintenance work order 123")
    );

    // shelved_until = shelve time + 1 h, strictly after shelved_at.
    let until = DateTime::parse_from_rfc3339(result.alarm.shelved_until.as_deref().unwrap())
        .unwrap()
        .with_timezone(&Utc);
    assert_eq!(until, t(60 + 3600));

    // Half an hour in: the monitor leaves it alone.
    assert_eq!(engine.expire_shelves(t(1860)).await, 0);
    assert_eq!(
        engine.list(&AlarmFilters::default()).await[0].state,
        "SHELVED"
    );

    // Signals during the shelve only update the value.
    engine
        .process_signal(&make_signal(1, "thermal-l1", "TT-101", 96.0), t(2000), 2000.0)
        .await;
    let shelved = engine.list(&AlarmFilters::default()).await;
    assert_eq!(shelved[0].state, "SHELVED");
    assert_eq!(shelved[0].last_value, Some(96.0));

    // One hour of simulated time: the monitor unshelves to CLEARED.
    assert_eq!(engine.expire_shelves(t(60 + 3600 + 1)).await, 1);
    assert!(engine.list(&AlarmFilters::default()).await.is_empty());

    let audit = store.event_types();
    assert_eq!(audit, vec!["alarm_raised", "alarm_shelved", "alarm_unshelved"]);
    let recorded = store.events.lock().unwrap();
    assert_eq!(recorded.last().unwrap().payload["reason"], "timer_expired");
}

#[tokio::test]
async fn manual_unshelve_and_validation_paths() {
    let store = Arc::new(MemAlarmStore::default());
    let events = Arc::new(MemEvents::default());
    let engine = AlarmEngine::new(
        EngineConfig::default(),
        store.clone(),
        events.clone(),
        default_rules(),
    )
    .unwrap();
    engine.load_state().await.unwrap();

    engine
        .process_signal(&make_signal(1, "thermal-l1", "TT-101", 91.0), t(0), 0.0)
        .await;

    // Reason is required by default.
    assert_eq!(
        engine.shelve(1, "op", "   ", 1.0, t(1)).await,
        Err(OperatorError::ShelveRequiresReason)
    );

    // An over-long duration is clamped and reported.
    let result = engine
        .shelve(1, "op", "vendor visit", 240.0, t(2))
        .await
        .unwrap();
    assert!(result.duration_clamped);

    // Manual unshelve lands in CLEARED; re-evaluation happens on the
    // next matching signal.
    let snap = engine.unshelve(1, "op", t(3)).await.unwrap();
    assert_eq!(snap.state, "CLEARED");

    engine
        .process_signal(&make_signal(1, "thermal-l1", "TT-101", 93.0), t(4), 4.0)
        .await;
    assert_eq!(engine.list(&AlarmFilters::default()).await[0].state, "ACTIVE");

    // Unshelving a non-shelved alarm is a structured no-op.
    assert_eq!(
        engine.unshelve(1, "op", t(5)).await,
        Err(OperatorError::InvalidTransition {
            current_state: "ACTIVE".to_owned()
        })
    );
}
