//! Queue batch processing with batch-scoped resources, plus the NATS,
//! Postgres and telemetry plumbing it runs on.

pub mod nats;
pub mod postgres;
pub mod queue;
pub mod scope;
pub mod telemetry;
