//! Tower layers for message handlers.

mod logging;
mod tracing;

pub use logging::*;
pub use self::tracing::*;
