//! Bounded retry loop that re-establishes a logical connection.
//!
//! An authorization failure ends the run immediately; unreachability is
//! retried after a fixed delay until the attempt budget is spent. Every
//! status and phase transition is published on the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cmdseq_core::{ConnectionPhase, ConnectionStatus};
use events::{Event, EventBus};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::connector::Connector;
use crate::error::{ConnectionError, Result};
use crate::types::{RecoveryReport, RetryConfig};

/// Snapshot of the current (or last) recovery run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryState {
    pub attempt: u32,
    pub status: ConnectionStatus,
    pub phase: ConnectionPhase,
}

pub struct ReconnectRoutine {
    connector: Arc<dyn Connector>,
    events: Option<EventBus>,
    state: Mutex<RecoveryState>,
    in_progress: AtomicBool,
    idle: Notify,
}

/// Clears the in-progress flag even if the run is cancelled mid-await.
struct InProgress<'a>(&'a ReconnectRoutine);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::SeqCst);
        self.0.idle.notify_waiters();
    }
}

impl ReconnectRoutine {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            events: None,
            state: Mutex::new(RecoveryState::default()),
            in_progress: AtomicBool::new(false),
            idle: Notify::new(),
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state().phase
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Resolve once no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a run ending in between is seen.
            let idle = self.idle.notified();
            if !self.is_in_progress() {
                return;
            }
            idle.await;
        }
    }

    pub async fn reconnect_with(&self, config: &RetryConfig) -> Result<RecoveryReport> {
        self.reconnect(config.max_attempts, config.retry_delay()).await
    }

    /// Try to connect up to `max_attempts` times (at least once), sleeping
    /// `inter_attempt_delay` between attempts.
    pub async fn reconnect(
        &self,
        max_attempts: u32,
        inter_attempt_delay: Duration,
    ) -> Result<RecoveryReport> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AttemptInProgress);
        }
        let _in_progress = InProgress(self);

        let max_attempts = max_attempts.max(1);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RecoveryState::default();

        let mut attempt = 1;
        let outcome = loop {
            self.set_phase(attempt, ConnectionPhase::Attempting);
            self.set_status(attempt, max_attempts, ConnectionStatus::Connecting);
            info!(attempt, max_attempts, "Connecting");

            let outcome = self.connector.connect().await;
            if outcome.is_permanent_failure() {
                error!(attempt, "Connection rejected, not retrying");
                self.set_status(attempt, max_attempts, ConnectionStatus::Failed);
                self.set_phase(attempt, ConnectionPhase::Finished);
                return Err(ConnectionError::PermanentConnectionFailure);
            }
            if outcome.is_connected() || attempt >= max_attempts {
                break outcome;
            }

            warn!(
                attempt,
                max_attempts,
                outcome = ?outcome,
                delay_ms = inter_attempt_delay.as_millis() as u64,
                "Endpoint unreachable, retrying"
            );
            self.set_phase(attempt, ConnectionPhase::WaitingToRetry);
            tokio::time::sleep(inter_attempt_delay).await;
            attempt += 1;
        };

        if outcome.is_connected() {
            info!(attempts = attempt, "Connected");
            self.set_status(attempt, max_attempts, ConnectionStatus::Connected);
            self.set_phase(attempt, ConnectionPhase::Finished);
            Ok(RecoveryReport { attempts: attempt })
        } else {
            error!(attempts = attempt, "Giving up on connection");
            self.set_status(attempt, max_attempts, ConnectionStatus::Failed);
            self.set_phase(attempt, ConnectionPhase::Finished);
            Err(ConnectionError::TransientConnectionFailure { attempts: attempt })
        }
    }

    fn set_status(&self, attempt: u32, max_attempts: u32, status: ConnectionStatus) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.attempt = attempt;
            state.status = status;
        }
        if let Some(bus) = &self.events {
            bus.emit(Event::ConnectionStatusChanged {
                attempt,
                max_attempts,
                status,
            });
        }
    }

    fn set_phase(&self, attempt: u32, phase: ConnectionPhase) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.attempt = attempt;
            state.phase = phase;
        }
        if let Some(bus) = &self.events {
            bus.emit(Event::ConnectionPhaseChanged { attempt, phase });
        }
    }
}
