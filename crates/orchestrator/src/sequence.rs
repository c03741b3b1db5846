//! Ordered composite of commands drained through a shared execution slot.
//!
//! A sequence is itself a [`Command`], so it can be driven directly or
//! registered into another sequence (where it is flattened into its steps).
//!
//! `run` loads every registered step into the queue and pumps: ready steps
//! at the head are dequeued and started one after another; when the head is
//! not ready the pump subscribes to that head's readiness notification and
//! returns. The notification, not completion of the step, resumes pumping.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use cmdseq_core::{
    same_command, Command, CommandParameter, CoreError, Notifier, Result, SubscriptionId,
};
use events::{Event, EventBus};
use tracing::{debug, info};

use crate::queue::{ObservableCommandQueue, RunId};

const DEFAULT_NAME: &str = "sequence";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscription on a command's readiness notifier.
struct Subscription {
    command: Arc<dyn Command>,
    id: SubscriptionId,
}

impl Subscription {
    fn cancel(self) {
        self.command.readiness().unsubscribe(self.id);
    }
}

/// The pump's wait on the head of its own run.
struct Wait {
    run: RunId,
    head: Subscription,
}

pub struct CommandSequence {
    name: String,
    this: Weak<CommandSequence>,
    queue: ObservableCommandQueue,
    queue_subscription: SubscriptionId,
    commands: Mutex<Vec<Arc<dyn Command>>>,
    /// Readiness forwarding from the first registered command.
    first: Mutex<Option<Subscription>>,
    /// Head the pump is waiting on, if blocked.
    blocked: Mutex<Option<Wait>>,
    parameter: Mutex<CommandParameter>,
    readiness: Notifier,
    events: OnceLock<EventBus>,
}

impl CommandSequence {
    /// Sequence drawing from `queue`. Pass clones of one queue to sequences
    /// that must never run at the same time.
    pub fn new(queue: ObservableCommandQueue) -> Arc<Self> {
        Self::named(DEFAULT_NAME, queue)
    }

    pub fn named(name: impl Into<String>, queue: ObservableCommandQueue) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this: &Weak<CommandSequence>| {
            let weak = this.clone();
            let queue_subscription = queue.changed().subscribe(move || {
                if let Some(sequence) = weak.upgrade() {
                    sequence.on_queue_changed();
                }
            });

            Self {
                name,
                this: this.clone(),
                queue,
                queue_subscription,
                commands: Mutex::new(Vec::new()),
                first: Mutex::new(None),
                blocked: Mutex::new(None),
                parameter: Mutex::new(CommandParameter::Null),
                readiness: Notifier::new(),
                events: OnceLock::new(),
            }
        })
    }

    /// Sequence with its own private queue.
    pub fn standalone(name: impl Into<String>) -> Arc<Self> {
        Self::named(name, ObservableCommandQueue::new())
    }

    /// Publish start/blocked/drained events on `bus`. Only the first call
    /// has an effect.
    pub fn attach_event_bus(&self, bus: EventBus) {
        let _ = self.events.set(bus);
    }

    /// Append a step. A sequence is spliced in as its own steps.
    pub fn register_command(&self, command: Arc<dyn Command>) -> Result<()> {
        if self.is_self(&command) {
            return Err(CoreError::invalid_argument(format!(
                "sequence '{}' cannot be registered into itself",
                self.name
            )));
        }

        let steps = command
            .composite_steps()
            .unwrap_or_else(|| vec![Arc::clone(&command)]);
        debug!(
            sequence = %self.name,
            command = command.name(),
            steps = steps.len(),
            "Registering command"
        );

        let first = {
            let mut commands = lock(&self.commands);
            let was_empty = commands.is_empty();
            commands.extend(steps);
            if was_empty {
                commands.first().cloned()
            } else {
                None
            }
        };
        if let Some(first) = first {
            self.track_first(first);
        }

        self.readiness.notify();
        Ok(())
    }

    /// Snapshot of the registered program, already flattened.
    pub fn commands(&self) -> Vec<Arc<dyn Command>> {
        lock(&self.commands).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.commands).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.commands).is_empty()
    }

    pub fn queue(&self) -> &ObservableCommandQueue {
        &self.queue
    }

    /// Whether the pump is waiting on the head command.
    pub fn is_blocked(&self) -> bool {
        lock(&self.blocked).is_some()
    }

    /// Parameter of the current (or last) run.
    pub fn shared_parameter(&self) -> CommandParameter {
        lock(&self.parameter).clone()
    }

    fn is_self(&self, command: &Arc<dyn Command>) -> bool {
        std::ptr::eq(Arc::as_ptr(command) as *const (), self as *const Self as *const ())
    }

    fn track_first(&self, first: Arc<dyn Command>) {
        let weak = self.this.clone();
        let id = first.readiness().subscribe(move || {
            if let Some(sequence) = weak.upgrade() {
                sequence.readiness.notify();
            }
        });
        *lock(&self.first) = Some(Subscription { command: first, id });
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = self.events.get() {
            bus.emit(event);
        }
    }

    /// Drain ready head commands of `run`, then wait on the first one that
    /// is not. Returns as soon as `run` no longer occupies the queue.
    fn pump(&self, run: RunId) {
        loop {
            let parameter = self.shared_parameter();

            let head = loop {
                let Some(head) = self.queue.peek_run(run) else {
                    debug!(sequence = %self.name, "Run finished");
                    self.emit(Event::SequenceDrained {
                        sequence: self.name.clone(),
                    });
                    return;
                };
                if !head.can_run(&parameter) {
                    break head;
                }
                // Lost a race with clear() or another dequeue: re-read the head.
                if let Some(command) = self.queue.dequeue_if_head(run, &head) {
                    debug!(sequence = %self.name, command = command.name(), "Running step");
                    command.run(&parameter);
                }
            };

            let Some(id) = self.block_on(run, &head) else {
                return;
            };

            // The head may have become ready between the check and the
            // subscription; its notification would then have been missed.
            if !head.can_run(&parameter) {
                debug!(sequence = %self.name, command = head.name(), "Waiting for step");
                self.emit(Event::SequenceBlocked {
                    sequence: self.name.clone(),
                    command: head.name().to_string(),
                });
                return;
            }
            if !self.release_block(id) {
                return;
            }
        }
    }

    /// Subscribe to `head`. Returns `None` if some pump already waits or
    /// `head` is no longer the front of `run`.
    fn block_on(&self, run: RunId, head: &Arc<dyn Command>) -> Option<SubscriptionId> {
        let mut blocked = lock(&self.blocked);
        if blocked.is_some() {
            return None;
        }
        let still_head = self
            .queue
            .peek_run(run)
            .is_some_and(|current| same_command(&current, head));
        if !still_head {
            return None;
        }

        let weak = self.this.clone();
        let id = head.readiness().subscribe(move || {
            if let Some(sequence) = weak.upgrade() {
                sequence.on_head_readiness();
            }
        });
        *blocked = Some(Wait {
            run,
            head: Subscription {
                command: Arc::clone(head),
                id,
            },
        });
        Some(id)
    }

    /// Drop the wait on `id`. Only one caller can win for a given id.
    fn release_block(&self, id: SubscriptionId) -> bool {
        let released = {
            let mut blocked = lock(&self.blocked);
            match blocked.as_ref() {
                Some(current) if current.head.id == id => blocked.take(),
                _ => None,
            }
        };
        match released {
            Some(wait) => {
                wait.head.cancel();
                true
            }
            None => false,
        }
    }

    fn on_head_readiness(&self) {
        let waiting = lock(&self.blocked)
            .as_ref()
            .map(|current| (Arc::clone(&current.head.command), current.head.id, current.run));
        self.readiness.notify();

        let Some((head, id, run)) = waiting else {
            return;
        };
        if !head.can_run(&self.shared_parameter()) {
            return;
        }
        if self.release_block(id) {
            debug!(sequence = %self.name, command = head.name(), "Step ready, resuming");
            self.pump(run);
        }
    }

    fn on_queue_changed(&self) {
        self.release_stale_block();
        self.readiness.notify();
    }

    /// Stop waiting on a head that is no longer the front of its run
    /// (cleared, or the queue now holds another run).
    fn release_stale_block(&self) {
        let stale = {
            let mut blocked = lock(&self.blocked);
            let is_stale = blocked.as_ref().is_some_and(|current| {
                self.queue
                    .peek_run(current.run)
                    .map_or(true, |head| !same_command(&current.head.command, &head))
            });
            if is_stale {
                blocked.take()
            } else {
                None
            }
        };
        if let Some(wait) = stale {
            debug!(
                sequence = %self.name,
                command = wait.head.command.name(),
                "Abandoning wait, head left the queue"
            );
            wait.head.cancel();
        }
    }
}

impl Command for CommandSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_run(&self, parameter: &CommandParameter) -> bool {
        let Some(first) = lock(&self.commands).first().cloned() else {
            return false;
        };
        self.queue.is_empty() && first.can_run(parameter)
    }

    fn run(&self, parameter: &CommandParameter) {
        let program = self.commands();
        if program.is_empty() {
            debug!(sequence = %self.name, "Nothing registered, ignoring run");
            return;
        }
        let Some(run) = self.queue.enqueue_all_if_empty(&program) else {
            debug!(
                sequence = %self.name,
                pending = self.queue.count(),
                "Execution slot busy, ignoring run"
            );
            return;
        };

        *lock(&self.parameter) = parameter.clone();
        info!(sequence = %self.name, steps = program.len(), "Sequence started");
        self.emit(Event::SequenceStarted {
            sequence: self.name.clone(),
            steps: program.len(),
        });

        self.readiness.notify();
        self.pump(run);
    }

    fn readiness(&self) -> &Notifier {
        &self.readiness
    }

    fn composite_steps(&self) -> Option<Vec<Arc<dyn Command>>> {
        Some(self.commands())
    }
}

impl Drop for CommandSequence {
    fn drop(&mut self) {
        self.queue.changed().unsubscribe(self.queue_subscription);
        if let Some(subscription) = lock(&self.first).take() {
            subscription.cancel();
        }
        if let Some(wait) = lock(&self.blocked).take() {
            wait.head.cancel();
        }
    }
}

impl std::fmt::Debug for CommandSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSequence")
            .field("name", &self.name)
            .field("steps", &self.len())
            .field("pending", &self.queue.count())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
