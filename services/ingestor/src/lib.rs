// ingestor: Cloud ingestion service.
//
// Consumes telemetry from the cloud broker, validates it against the
// topic and payload contracts, resolves sensor keys through the cache,
// batch-writes rows into the telemetry table, dead-letters rejects, and
// extracts alarm signals for the alarm engine.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dead_letter;
pub mod ingest;
pub mod metrics;
pub mod store;
