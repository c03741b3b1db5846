//! Command sequencing over a shared execution slot.
//!
//! - [`ObservableCommandQueue`] - FIFO whose emptiness gates every pipeline sharing it
//! - [`CommandSequence`] - Ordered, flattenable composite that drains the queue as steps become ready
//! - [`AsyncCommand`] - Leaf command around one action and a readiness predicate
//! - [`ActivityGate`] - Shared in-flight counter leaf predicates wait on

pub mod command;
pub mod queue;
pub mod resources;
pub mod sequence;

pub use cmdseq_core::{Command, CommandParameter, CoreError, Notifier, Result};
pub use command::{AsyncCommand, AsyncCommandBuilder};
pub use queue::{ObservableCommandQueue, RunId};
pub use resources::{ActivityGate, ActivityGuard};
pub use sequence::CommandSequence;
