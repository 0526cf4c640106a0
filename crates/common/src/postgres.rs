mod client;
mod config;
mod connection;

pub use client::*;
pub use config::*;
pub use connection::*;
