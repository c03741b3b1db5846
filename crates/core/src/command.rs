use std::sync::Arc;

use crate::notify::Notifier;

/// Parameter handed to every command of a run. `Value::Null` when absent.
pub type CommandParameter = serde_json::Value;

/// A unit of work with a readiness predicate.
///
/// `run` must not block: asynchronous work is started and left to complete
/// on its own. Completion is observed through the readiness notifier, never
/// by awaiting `run`.
pub trait Command: Send + Sync {
    /// Human-readable name used in logs and events.
    fn name(&self) -> &str;

    fn can_run(&self, parameter: &CommandParameter) -> bool;

    fn run(&self, parameter: &CommandParameter);

    /// Fires whenever `can_run` may have changed.
    fn readiness(&self) -> &Notifier;

    /// Steps to splice in place of this command when it is registered into
    /// a composite. Leaf commands return `None`.
    fn composite_steps(&self) -> Option<Vec<Arc<dyn Command>>> {
        None
    }
}

/// Identity comparison for command handles, ignoring vtable metadata.
pub fn same_command(a: &Arc<dyn Command>, b: &Arc<dyn Command>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
