mod audit_event;
mod audit_event_handler;
mod error;
mod repository;

pub use audit_event::*;
pub use audit_event_handler::*;
pub use error::*;
pub use repository::*;
