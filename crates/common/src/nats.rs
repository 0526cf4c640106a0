mod client;
mod consumer;
mod producer;
mod traits;

pub use client::*;
pub use consumer::*;
pub use producer::*;
pub use traits::*;
