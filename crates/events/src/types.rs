//! Event types for sequencing and connection-recovery progress

use chrono::{DateTime, Utc};
use cmdseq_core::{ConnectionPhase, ConnectionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Sequence events
    /// A sequence loaded its program into the execution slot
    #[serde(rename = "sequence.started")]
    SequenceStarted { sequence: String, steps: usize },

    /// The pump is waiting for the head command to become ready
    #[serde(rename = "sequence.blocked")]
    SequenceBlocked { sequence: String, command: String },

    /// The execution slot ran empty
    #[serde(rename = "sequence.drained")]
    SequenceDrained { sequence: String },

    // Connection events
    /// Connection status transition during recovery
    #[serde(rename = "connection.status_changed")]
    ConnectionStatusChanged {
        attempt: u32,
        max_attempts: u32,
        status: ConnectionStatus,
    },

    /// Recovery phase transition
    #[serde(rename = "connection.phase_changed")]
    ConnectionPhaseChanged { attempt: u32, phase: ConnectionPhase },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Get the sequence name associated with this event, if any
    pub fn sequence(&self) -> Option<&str> {
        match self {
            Event::SequenceStarted { sequence, .. } => Some(sequence),
            Event::SequenceBlocked { sequence, .. } => Some(sequence),
            Event::SequenceDrained { sequence } => Some(sequence),
            Event::ConnectionStatusChanged { .. } => None,
            Event::ConnectionPhaseChanged { .. } => None,
            Event::Error { .. } => None,
        }
    }
}
