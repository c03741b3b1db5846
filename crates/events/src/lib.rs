//! Event system for command sequencing
//!
//! This crate provides the event bus and event types used to surface
//! pipeline and connection-recovery progress without polling.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
