pub mod config;
pub mod dedup;
pub mod error;
pub mod frigate;
pub mod messaging;
pub mod notify;
pub mod pipeline;
pub mod storage;

// Re-export main components for easier use
pub use config::Config;
pub use error::{Error, Result};
