mod audit_event_repository;

pub use audit_event_repository::*;
