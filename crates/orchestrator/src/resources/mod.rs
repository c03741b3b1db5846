//! RAII resource guards.
//!
//! - [`ActivityGate`] - Shared in-flight counter with change notification
//! - [`ActivityGuard`] - Releases one unit of activity on drop

mod activity_gate;

pub use activity_gate::{ActivityGate, ActivityGuard};
