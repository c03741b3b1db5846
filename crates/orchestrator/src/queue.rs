//! Shared execution slot.
//!
//! A FIFO of command handles whose emptiness is the "is any pipeline
//! running" token. Every sequence that must not overlap with another is
//! constructed with a clone of the same queue handle.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cmdseq_core::{same_command, Command, CoreError, Notifier, Result};
use tracing::trace;

/// Identifies one program loaded by [`ObservableCommandQueue::enqueue_all_if_empty`].
///
/// The id stays current until the queue next runs empty or is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(u64);

struct Slot {
    commands: VecDeque<Arc<dyn Command>>,
    /// Program occupying the queue, `None` for loose enqueues.
    run: Option<RunId>,
    next_run: u64,
}

impl Slot {
    fn pop_front(&mut self) -> Option<Arc<dyn Command>> {
        let command = self.commands.pop_front();
        if self.commands.is_empty() {
            self.run = None;
        }
        command
    }
}

struct QueueInner {
    slot: Mutex<Slot>,
    changed: Notifier,
}

/// FIFO of pending commands with a change notification.
///
/// Cloning yields another handle to the same queue. Notifications are
/// fired after the mutation is visible and the lock has been released.
#[derive(Clone)]
pub struct ObservableCommandQueue {
    inner: Arc<QueueInner>,
}

impl ObservableCommandQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                slot: Mutex::new(Slot {
                    commands: VecDeque::new(),
                    run: None,
                    next_run: 0,
                }),
                changed: Notifier::new(),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fires after every enqueue, dequeue and clear.
    pub fn changed(&self) -> &Notifier {
        &self.inner.changed
    }

    pub fn count(&self) -> usize {
        self.slot().commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot().commands.is_empty()
    }

    pub fn peek(&self) -> Result<Arc<dyn Command>> {
        self.slot()
            .commands
            .front()
            .cloned()
            .ok_or(CoreError::EmptyQueue)
    }

    /// Program currently occupying the queue, if it was loaded as one.
    pub fn current_run(&self) -> Option<RunId> {
        self.slot().run
    }

    /// Head of the queue, but only while `run` still occupies it.
    pub fn peek_run(&self, run: RunId) -> Option<Arc<dyn Command>> {
        let slot = self.slot();
        if slot.run != Some(run) {
            return None;
        }
        slot.commands.front().cloned()
    }

    pub fn enqueue(&self, command: Arc<dyn Command>) {
        {
            let mut slot = self.slot();
            trace!(command = command.name(), depth = slot.commands.len() + 1, "enqueue");
            slot.commands.push_back(command);
        }
        self.inner.changed.notify();
    }

    pub fn dequeue(&self) -> Result<Arc<dyn Command>> {
        let command = self.slot().pop_front().ok_or(CoreError::EmptyQueue)?;
        trace!(command = command.name(), "dequeue");
        self.inner.changed.notify();
        Ok(command)
    }

    /// Drop every pending command. Already dequeued commands are unaffected.
    pub fn clear(&self) {
        let dropped = {
            let mut slot = self.slot();
            let dropped = slot.commands.len();
            slot.commands.clear();
            slot.run = None;
            dropped
        };
        trace!(dropped, "clear");
        self.inner.changed.notify();
    }

    /// Load a whole program, but only if nothing is pending.
    ///
    /// The emptiness check and the pushes happen under one lock so two
    /// sequences sharing the queue cannot interleave. Returns the id of the
    /// new run, or `None` (leaving the queue untouched) when it was busy.
    pub fn enqueue_all_if_empty(&self, program: &[Arc<dyn Command>]) -> Option<RunId> {
        let run = {
            let mut slot = self.slot();
            if !slot.commands.is_empty() || program.is_empty() {
                return None;
            }
            slot.next_run += 1;
            let run = RunId(slot.next_run);
            slot.commands.extend(program.iter().cloned());
            slot.run = Some(run);
            trace!(depth = slot.commands.len(), run = run.0, "enqueue program");
            run
        };
        self.inner.changed.notify();
        Some(run)
    }

    /// Pop the head only if `run` still occupies the queue and the head is
    /// still `expected`.
    ///
    /// Lets a pump evaluate readiness outside the lock and then commit the
    /// dequeue without racing a concurrent clear or a reload.
    pub fn dequeue_if_head(
        &self,
        run: RunId,
        expected: &Arc<dyn Command>,
    ) -> Option<Arc<dyn Command>> {
        let command = {
            let mut slot = self.slot();
            if slot.run != Some(run) {
                return None;
            }
            match slot.commands.front() {
                Some(head) if same_command(head, expected) => slot.pop_front()?,
                _ => return None,
            }
        };
        trace!(command = command.name(), "dequeue head");
        self.inner.changed.notify();
        Some(command)
    }

    /// Whether both handles refer to the same queue.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for ObservableCommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObservableCommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableCommandQueue")
            .field("count", &self.count())
            .field("subscriber_count", &self.inner.changed.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::AsyncCommand;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn step(name: &str) -> Arc<dyn Command> {
        AsyncCommand::from_fn(name, |_| {})
    }

    fn counting(queue: &ObservableCommandQueue) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        queue.changed().subscribe(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        hits
    }

    #[test]
    fn test_fifo_order() {
        let queue = ObservableCommandQueue::new();
        queue.enqueue(step("a"));
        queue.enqueue(step("b"));
        queue.enqueue(step("c"));

        assert_eq!(queue.count(), 3);
        assert_eq!(queue.peek().unwrap().name(), "a");
        assert_eq!(queue.dequeue().unwrap().name(), "a");
        assert_eq!(queue.dequeue().unwrap().name(), "b");
        assert_eq!(queue.dequeue().unwrap().name(), "c");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue_errors() {
        let queue = ObservableCommandQueue::new();
        assert_eq!(queue.peek().err(), Some(CoreError::EmptyQueue));
        assert_eq!(queue.dequeue().err(), Some(CoreError::EmptyQueue));
    }

    #[test]
    fn test_every_mutation_notifies() {
        let queue = ObservableCommandQueue::new();
        let hits = counting(&queue);

        queue.enqueue(step("a"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        queue.dequeue().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        queue.clear();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // A failed dequeue is not a mutation.
        assert!(queue.dequeue().is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_notification_sees_mutation() {
        let queue = ObservableCommandQueue::new();
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        let observed_clone = observed.clone();
        let handle = queue.clone();
        queue.changed().subscribe(move || {
            observed_clone.store(handle.count(), Ordering::SeqCst);
        });

        queue.enqueue(step("a"));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        queue.clear();
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enqueue_all_if_empty() {
        let queue = ObservableCommandQueue::new();
        let hits = counting(&queue);

        let run = queue.enqueue_all_if_empty(&[step("a"), step("b")]);
        assert!(run.is_some());
        assert_eq!(queue.current_run(), run);
        assert_eq!(queue.count(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(queue.enqueue_all_if_empty(&[step("c")]).is_none());
        assert_eq!(queue.count(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        queue.clear();
        assert!(queue.current_run().is_none());
        assert!(queue.enqueue_all_if_empty(&[]).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_each_load_gets_a_new_run() {
        let queue = ObservableCommandQueue::new();
        let a = step("a");

        let first = queue.enqueue_all_if_empty(&[a.clone()]).unwrap();
        assert!(queue.dequeue_if_head(first, &a).is_some());
        assert!(queue.current_run().is_none());

        let second = queue.enqueue_all_if_empty(&[a.clone()]).unwrap();
        assert_ne!(first, second);
        assert!(queue.peek_run(first).is_none());
        assert!(queue.dequeue_if_head(first, &a).is_none());
        assert_eq!(queue.count(), 1);
        assert!(same_command(&queue.peek_run(second).unwrap(), &a));
    }

    #[test]
    fn test_dequeue_if_head() {
        let queue = ObservableCommandQueue::new();
        let a = step("a");
        let b = step("b");
        let run = queue.enqueue_all_if_empty(&[a.clone(), b.clone()]).unwrap();

        assert!(queue.dequeue_if_head(run, &b).is_none());
        assert_eq!(queue.count(), 2);

        let popped = queue.dequeue_if_head(run, &a).unwrap();
        assert!(same_command(&popped, &a));
        assert_eq!(queue.count(), 1);
        assert_eq!(queue.current_run(), Some(run));
    }

    #[test]
    fn test_loose_enqueue_has_no_run() {
        let queue = ObservableCommandQueue::new();
        let a = step("a");
        queue.enqueue(a.clone());

        assert!(queue.current_run().is_none());
        assert_eq!(queue.count(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let queue = ObservableCommandQueue::new();
        let other = queue.clone();
        other.enqueue(step("a"));

        assert_eq!(queue.count(), 1);
        assert!(queue.ptr_eq(&other));
        assert!(!queue.ptr_eq(&ObservableCommandQueue::new()));
    }
}
