// src/utils/mod.rs
//! Configuration and error types shared by every module

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::TrackingConfig;
pub use errors::{PersistError, QueueError, Result};
