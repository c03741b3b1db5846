//! Shared building blocks for command sequencing: the command capability,
//! the notifier that carries readiness changes, and the common error type.

pub mod command;
pub mod domain;
pub mod error;
pub mod notify;

pub use command::{same_command, Command, CommandParameter};
pub use domain::{ConnectionPhase, ConnectionStatus};
pub use error::{CoreError, Result};
pub use notify::{Handler, Notifier, SubscriptionId};
