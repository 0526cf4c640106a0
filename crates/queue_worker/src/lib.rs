//! Audit event worker: consumes audit events from NATS JetStream in batches
//! and stores them in PostgreSQL, with one pooled connection per batch.

pub mod config;
pub mod demo_producer;
pub mod domain;
pub mod postgres;
pub mod queue_worker;

pub use queue_worker::*;
