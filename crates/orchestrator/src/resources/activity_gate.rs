//! Shared "transport is idle" property.
//!
//! Leaf commands that talk to the same remote endpoint enter one gate
//! while their async work is in flight. The next step of a pipeline checks
//! `is_idle()` in its readiness predicate, and the gate's change
//! notification is what resumes a pump blocked on that step.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cmdseq_core::Notifier;
use tracing::debug;

struct GateInner {
    name: String,
    active: AtomicUsize,
    changed: Notifier,
}

/// Counts in-flight operations and notifies when the count changes.
#[derive(Clone)]
pub struct ActivityGate {
    inner: Arc<GateInner>,
}

impl ActivityGate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                name: name.into(),
                active: AtomicUsize::new(0),
                changed: Notifier::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_idle(&self) -> bool {
        self.active_count() == 0
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn changed(&self) -> &Notifier {
        &self.inner.changed
    }

    /// Mark one operation as in flight until the returned guard is dropped.
    pub fn enter(&self) -> ActivityGuard {
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(gate = %self.inner.name, active, "Activity started");
        self.inner.changed.notify();
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ActivityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityGate")
            .field("name", &self.inner.name)
            .field("active", &self.active_count())
            .finish()
    }
}

/// RAII guard for one in-flight operation.
///
/// Dropping it releases the gate and fires the change notification, so an
/// operation that panics or is cancelled still lets the pipeline resume.
pub struct ActivityGuard {
    inner: Arc<GateInner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        let active = self.inner.active.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(gate = %self.inner.name, active, "Activity finished");
        self.inner.changed.notify();
    }
}
