//! Synchronous observer list used for readiness and change notifications.
//!
//! Handlers run on the thread that calls [`Notifier::notify`], after the
//! internal lock has been released, so a handler may subscribe or
//! unsubscribe (itself included) without deadlocking.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

/// Callback invoked on every notification.
pub type Handler = Arc<dyn Fn() + Send + Sync>;

/// Identifies one subscription on one [`Notifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct NotifierInner {
    next_id: u64,
    handlers: Vec<(SubscriptionId, Handler)>,
}

/// Multicast notification channel with explicit subscribe/unsubscribe.
///
/// Cloning yields another handle to the same subscriber list.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Mutex<NotifierInner>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NotifierInner {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered until [`Notifier::unsubscribe`].
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.handlers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.handlers.len();
        inner.handlers.retain(|(existing, _)| *existing != id);
        inner.handlers.len() != before
    }

    /// Invoke every handler registered at the time of the call.
    pub fn notify(&self) {
        let handlers: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        trace!(handlers = handlers.len(), "notify");
        for handler in handlers {
            handler();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
