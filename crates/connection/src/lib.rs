//! Connection recovery for remote device endpoints.
//!
//! - [`Connector`] - Seam over the transport; [`HttpConnector`] checks a status endpoint
//! - [`ReconnectRoutine`] - Bounded retry loop distinguishing rejected credentials from outages
//! - [`ReconnectCommand`] - The routine as a gated leaf step of a command sequence

pub mod client;
pub mod command;
pub mod connector;
pub mod error;
pub mod recovery;
pub mod types;

pub use client::HttpConnector;
pub use command::{ReconnectCommand, ReconnectCommandBuilder, ReconnectOutcome};
pub use connector::{Connector, ScriptedConnector};
pub use error::{ConnectionError, Result};
pub use recovery::{ReconnectRoutine, RecoveryState};
pub use types::*;
