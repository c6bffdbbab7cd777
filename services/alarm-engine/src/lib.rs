// alarm-engine: ISA-18.2 alarm lifecycle management.
//
// Consumes alarm signals from the inbound channel, evaluates thresholds
// with deadband and debounce, manages the per-sensor state machine,
// applies cascade suppression, shelving, flood control, and stale
// detection, and fans lifecycle events out to subscribers.

pub mod cascade;
pub mod config;
pub mod engine;
pub mod fanout;
pub mod flood;
pub mod persistence;
pub mod state;
pub mod threshold;
