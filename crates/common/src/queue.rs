//! Queue batch processing: decode each message of a batch, run a handler on it
//! under a concurrency ceiling, and turn the result into exactly one
//! acknowledge or redelivery request.

mod decoder;
mod error;
mod message;
pub mod middleware;
mod outcome;
mod processor;
mod report;
mod router;

pub use decoder::*;
pub use error::*;
pub use message::*;
pub use outcome::*;
pub use processor::*;
pub use report::*;
pub use router::*;
