//! The recovery routine packaged as a leaf command.
//!
//! Registered as one step of a pipeline (for example
//! stop-telemetry, reboot, reconnect, refresh-name, resume-telemetry), it
//! is gated like any other step: ready when no attempt is in flight and the
//! shared transport gate, if any, is idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use cmdseq_core::{Command, CommandParameter, Notifier, SubscriptionId};
use orchestrator::{ActivityGate, ActivityGuard, ObservableCommandQueue};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;
use crate::recovery::ReconnectRoutine;
use crate::types::RetryConfig;

const DEFAULT_NAME: &str = "reconnect";

/// How the last run of a [`ReconnectCommand`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconnectOutcome {
    Connected { attempts: u32 },
    Rejected,
    GaveUp { attempts: u32 },
}

impl ReconnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

pub struct ReconnectCommand {
    name: String,
    this: Weak<ReconnectCommand>,
    routine: Arc<ReconnectRoutine>,
    config: RetryConfig,
    gate: Option<ActivityGate>,
    gate_subscription: Option<SubscriptionId>,
    abort_queue: Option<ObservableCommandQueue>,
    runtime: Option<Handle>,
    running: AtomicBool,
    last_outcome: Mutex<Option<ReconnectOutcome>>,
    readiness: Arc<Notifier>,
}

impl ReconnectCommand {
    pub fn builder(routine: Arc<ReconnectRoutine>) -> ReconnectCommandBuilder {
        ReconnectCommandBuilder {
            name: DEFAULT_NAME.to_string(),
            routine,
            config: RetryConfig::default(),
            gate: None,
            abort_queue: None,
            runtime: None,
        }
    }

    pub fn routine(&self) -> &Arc<ReconnectRoutine> {
        &self.routine
    }

    pub fn last_outcome(&self) -> Option<ReconnectOutcome> {
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn finish(&self, result: Result<u32, ConnectionError>, guard: Option<ActivityGuard>) {
        let outcome = match result {
            Ok(attempts) => ReconnectOutcome::Connected { attempts },
            Err(ConnectionError::PermanentConnectionFailure) => ReconnectOutcome::Rejected,
            Err(ConnectionError::TransientConnectionFailure { attempts }) => {
                ReconnectOutcome::GaveUp { attempts }
            }
            Err(e) => {
                warn!(command = %self.name, error = %e, "Reconnect did not run");
                ReconnectOutcome::GaveUp { attempts: 0 }
            }
        };
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);

        // Abandon the rest of the pipeline before the gate reopens, otherwise
        // the next step would already be runnable.
        if !outcome.is_connected() {
            if let Some(queue) = &self.abort_queue {
                error!(
                    command = %self.name,
                    outcome = ?outcome,
                    abandoned = queue.count(),
                    "Reconnect failed, abandoning pipeline"
                );
                queue.clear();
            }
        }

        self.running.store(false, Ordering::SeqCst);
        drop(guard);
        self.readiness.notify();
    }
}

impl Command for ReconnectCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_run(&self, _parameter: &CommandParameter) -> bool {
        !self.is_running()
            && !self.routine.is_in_progress()
            && self.gate.as_ref().map_or(true, ActivityGate::is_idle)
    }

    fn run(&self, _parameter: &CommandParameter) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(command = %self.name, "Reconnect already running, ignoring run");
            return;
        }
        let guard = self.gate.as_ref().map(ActivityGate::enter);
        self.readiness.notify();

        let runtime = self.runtime.clone().or_else(|| Handle::try_current().ok());
        let Some(runtime) = runtime else {
            error!(command = %self.name, "No tokio runtime available, reconnect dropped");
            self.finish(
                Err(ConnectionError::InvalidConfig(
                    "no tokio runtime available".to_string(),
                )),
                guard,
            );
            return;
        };

        info!(
            command = %self.name,
            max_attempts = self.config.max_attempts,
            retry_delay_ms = self.config.retry_delay_ms,
            "Reconnect started"
        );
        let routine = Arc::clone(&self.routine);
        let config = self.config.clone();
        let this = self.this.clone();
        runtime.spawn(async move {
            let result = loop {
                match routine.reconnect_with(&config).await {
                    // Another holder of the routine is mid-run; take our turn after it.
                    Err(ConnectionError::AttemptInProgress) => {
                        debug!("Recovery already in flight, waiting for it to finish");
                        routine.wait_idle().await;
                    }
                    other => break other.map(|report| report.attempts),
                }
            };
            match this.upgrade() {
                Some(command) => command.finish(result, guard),
                None => drop(guard),
            }
        });
    }

    fn readiness(&self) -> &Notifier {
        &self.readiness
    }
}

impl Drop for ReconnectCommand {
    fn drop(&mut self) {
        if let (Some(gate), Some(id)) = (&self.gate, self.gate_subscription) {
            gate.changed().unsubscribe(id);
        }
    }
}

impl std::fmt::Debug for ReconnectCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectCommand")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("last_outcome", &self.last_outcome())
            .finish()
    }
}

/// Builder for [`ReconnectCommand`].
pub struct ReconnectCommandBuilder {
    name: String,
    routine: Arc<ReconnectRoutine>,
    config: RetryConfig,
    gate: Option<ActivityGate>,
    abort_queue: Option<ObservableCommandQueue>,
    runtime: Option<Handle>,
}

impl ReconnectCommandBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gated_by(mut self, gate: ActivityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Clear `queue` when recovery fails so the remaining steps never run.
    pub fn abort_on_failure(mut self, queue: ObservableCommandQueue) -> Self {
        self.abort_queue = Some(queue);
        self
    }

    pub fn on_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Arc<ReconnectCommand> {
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

            ReconnectCommand {
                name: self.name,
                this: this.clone(),
                routine: self.routine,
                config: self.config,
                gate: self.gate,
                gate_subscription,
                abort_queue: self.abort_queue,
                runtime,
                running: AtomicBool::new(false),
                last_outcome: Mutex::new(None),
                readiness,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ScriptedConnector;
    use crate::types::ConnectOutcome;
    use std::time::Duration;

    fn command_for(connector: ScriptedConnector) -> Arc<ReconnectCommand> {
        let routine = Arc::new(ReconnectRoutine::new(Arc::new(connector)));
        ReconnectCommand::builder(routine)
            .config(RetryConfig::new(3, Duration::from_millis(50)))
            .build()
    }

    async fn wait_until_idle(command: &ReconnectCommand) {
        while command.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_while_running() {
        let command = command_for(ScriptedConnector::flaky(1));
        assert!(command.can_run(&CommandParameter::Null));

        command.run(&CommandParameter::Null);
        assert!(!command.can_run(&CommandParameter::Null));

        wait_until_idle(&command).await;
        assert!(command.can_run(&CommandParameter::Null));
        assert_eq!(
            command.last_outcome(),
            Some(ReconnectOutcome::Connected { attempts: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_outcome() {
        let command = command_for(ScriptedConnector::always(ConnectOutcome::Unauthorized));
        command.run(&CommandParameter::Null);
        wait_until_idle(&command).await;

        assert_eq!(command.last_outcome(), Some(ReconnectOutcome::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gave_up_outcome() {
        let command = command_for(ScriptedConnector::always(ConnectOutcome::unreachable(
            "offline",
        )));
        command.run(&CommandParameter::Null);
        wait_until_idle(&command).await;

        assert_eq!(
            command.last_outcome(),
            Some(ReconnectOutcome::GaveUp { attempts: 3 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_sharing_a_routine_take_turns() {
        let connector = Arc::new(ScriptedConnector::flaky(1));
        let routine = Arc::new(ReconnectRoutine::new(connector.clone()));
        let slot = ObservableCommandQueue::new();
        slot.enqueue(orchestrator::AsyncCommand::from_fn("resume", |_| {}));

        let build = |name: &str| {
            ReconnectCommand::builder(routine.clone())
                .name(name)
                .config(RetryConfig::new(3, Duration::from_secs(1)))
                .abort_on_failure(slot.clone())
                .build()
        };
        let first = build("reconnect-a");
        let second = build("reconnect-b");

        // Both pass can_run before either task has claimed the routine.
        assert!(first.can_run(&CommandParameter::Null));
        assert!(second.can_run(&CommandParameter::Null));
        first.run(&CommandParameter::Null);
        second.run(&CommandParameter::Null);

        wait_until_idle(&first).await;
        wait_until_idle(&second).await;

        assert!(first.last_outcome().unwrap().is_connected());
        assert!(second.last_outcome().unwrap().is_connected());
        assert_eq!(connector.calls(), 3);
        assert_eq!(slot.count(), 1);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_string(&ReconnectOutcome::GaveUp { attempts: 3 }).unwrap();
        assert_eq!(json, r#"{"result":"gave_up","attempts":3}"#);
    }
}
