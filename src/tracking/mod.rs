// src/tracking/mod.rs
//! Tracking data model
//!
//! - **Event**: one tracking ping (parameters, token, capture time)
//! - **Environment**: request context needed to attribute events on replay
//! - **EventBatch**: one client submission, the unit stored in the queue

pub mod batch;
pub mod event;

// Re-export commonly used types
pub use batch::EventBatch;
pub use event::{Environment, Event, ParamValue, SITE_ID_PARAM, URL_PARAM};
