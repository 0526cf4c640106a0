mod config;
mod init;
mod propagation;

pub use config::*;
pub use init::*;
pub use propagation::*;
