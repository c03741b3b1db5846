//! Leaf command wrapping one action and a readiness predicate.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use cmdseq_core::{Command, CommandParameter, Notifier, SubscriptionId};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::resources::{ActivityGate, ActivityGuard};

type Predicate = Arc<dyn Fn(&CommandParameter) -> bool + Send + Sync>;
type AsyncAction = Arc<dyn Fn(CommandParameter) -> BoxFuture<'static, ()> + Send + Sync>;
type SyncAction = Arc<dyn Fn(&CommandParameter) + Send + Sync>;

enum Action {
    Sync(SyncAction),
    Async(AsyncAction),
}

/// A leaf command: one action, a predicate, and an optional shared gate.
///
/// `can_run` is true when the command is not already executing, the gate
/// (if any) is idle and the predicate (if any) holds. Async actions are
/// spawned on the runtime captured at build time; the gate is entered
/// before `run` returns so the next step of a pipeline sees it busy.
pub struct AsyncCommand {
    name: String,
    this: Weak<AsyncCommand>,
    action: Action,
    predicate: Option<Predicate>,
    gate: Option<ActivityGate>,
    gate_subscription: Option<SubscriptionId>,
    runtime: Option<Handle>,
    executing: AtomicBool,
    readiness: Arc<Notifier>,
    /// External properties forwarded into `readiness`, cut on drop.
    observed: Mutex<Vec<(Notifier, SubscriptionId)>>,
}

impl AsyncCommand {
    /// Start building a command around an async action.
    pub fn builder<F, Fut>(name: impl Into<String>, action: F) -> AsyncCommandBuilder
    where
        F: Fn(CommandParameter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        AsyncCommandBuilder::new(
            name.into(),
            Action::Async(Arc::new(move |parameter| action(parameter).boxed())),
        )
    }

    /// Start building a command around a synchronous action run inline.
    pub fn sync_builder<F>(name: impl Into<String>, action: F) -> AsyncCommandBuilder
    where
        F: Fn(&CommandParameter) + Send + Sync + 'static,
    {
        AsyncCommandBuilder::new(name.into(), Action::Sync(Arc::new(action)))
    }

    /// Always-ready synchronous command.
    pub fn from_fn<F>(name: impl Into<String>, action: F) -> Arc<Self>
    where
        F: Fn(&CommandParameter) + Send + Sync + 'static,
    {
        Self::sync_builder(name, action).build()
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Re-evaluate readiness whenever `property` fires, until this command
    /// is dropped.
    pub fn observe(&self, property: &Notifier) -> SubscriptionId {
        let readiness = Arc::downgrade(&self.readiness);
        let id = property.subscribe(move || {
            if let Some(readiness) = readiness.upgrade() {
                readiness.notify();
            }
        });
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((property.clone(), id));
        id
    }

    /// Force a readiness re-evaluation by observers.
    pub fn invalidate(&self) {
        self.readiness.notify();
    }

    fn finish(&self, guard: Option<ActivityGuard>) {
        self.executing.store(false, Ordering::SeqCst);
        drop(guard);
        debug!(command = %self.name, "Command finished");
        self.readiness.notify();
    }
}

impl Command for AsyncCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_run(&self, parameter: &CommandParameter) -> bool {
        if self.is_executing() {
            return false;
        }
        if let Some(gate) = &self.gate {
            if !gate.is_idle() {
                return false;
            }
        }
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(parameter))
    }

    fn run(&self, parameter: &CommandParameter) {
        if self.executing.swap(true, Ordering::SeqCst) {
            warn!(command = %self.name, "Command is already executing, ignoring run");
            return;
        }

        let guard = self.gate.as_ref().map(ActivityGate::enter);
        debug!(command = %self.name, "Command started");
        self.readiness.notify();

        match &self.action {
            Action::Sync(action) => {
                action(parameter);
                self.finish(guard);
            }
            Action::Async(action) => {
                let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok());
                let Some(runtime) = runtime else {
                    error!(command = %self.name, "No tokio runtime available, command dropped");
                    self.finish(guard);
                    return;
                };

                let future = action(parameter.clone());
                let this = self.this.clone();
                runtime.spawn(async move {
                    future.await;
                    match this.upgrade() {
                        Some(command) => command.finish(guard),
                        None => drop(guard),
                    }
                });
            }
        }
    }

    fn readiness(&self) -> &Notifier {
        &self.readiness
    }
}

impl Drop for AsyncCommand {
    fn drop(&mut self) {
        if let (Some(gate), Some(id)) = (&self.gate, self.gate_subscription) {
            gate.changed().unsubscribe(id);
        }
        let observed = std::mem::take(
            self.observed
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (property, id) in observed {
            property.unsubscribe(id);
        }
    }
}

impl std::fmt::Debug for AsyncCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCommand")
            .field("name", &self.name)
            .field("executing", &self.is_executing())
            .field("gate", &self.gate)
            .finish()
    }
}

/// Builder for [`AsyncCommand`].
pub struct AsyncCommandBuilder {
    name: String,
    action: Action,
    predicate: Option<Predicate>,
    gate: Option<ActivityGate>,
    runtime: Option<Handle>,
}

impl AsyncCommandBuilder {
    fn new(name: String, action: Action) -> Self {
        Self {
            name,
            action,
            predicate: None,
            gate: None,
            runtime: None,
        }
    }

    /// Only runnable while `predicate` holds.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&CommandParameter) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Hold `gate` while executing and wait for it to be idle before running.
    pub fn gated_by(mut self, gate: ActivityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Spawn async actions on `runtime` instead of the ambient one.
    pub fn on_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Arc<AsyncCommand> {
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        Arc::new_cyclic(|this| {
            let readiness = Arc::new(Notifier::new());
            let gate_subscription = self.gate.as_ref().map(|gate| {
                let readiness = Arc::downgrade(&readiness);
                gate.changed().subscribe(move || {
                    if let Some(readiness) = readiness.upgrade() {
                        readiness.notify();
                    }
                })
            });

            AsyncCommand {
                name: self.name,
                this: this.clone(),
                action: self.action,
                predicate: self.predicate,
                gate: self.gate,
                gate_subscription,
                runtime,
                executing: AtomicBool::new(false),
                readiness,
                observed: Mutex::new(Vec::new()),
            }
        })
    }
}
