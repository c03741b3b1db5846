use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::types::ConnectOutcome;

/// Establishes the logical connection to a remote endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> ConnectOutcome;
}

/// Connector that replays a fixed script of outcomes.
///
/// Once the script is exhausted the last outcome repeats. An empty script
/// always connects.
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ConnectOutcome>>,
    last: Mutex<ConnectOutcome>,
    calls: AtomicU32,
}

impl ScriptedConnector {
    pub fn new(script: impl IntoIterator<Item = ConnectOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(ConnectOutcome::Connected),
            calls: AtomicU32::new(0),
        }
    }

    /// Fails `failures` times with `Unreachable`, then connects.
    pub fn flaky(failures: usize) -> Self {
        let mut script: Vec<ConnectOutcome> = (0..failures)
            .map(|n| ConnectOutcome::unreachable(format!("simulated outage #{}", n + 1)))
            .collect();
        script.push(ConnectOutcome::Connected);
        Self::new(script)
    }

    pub fn always(outcome: ConnectOutcome) -> Self {
        Self::new([outcome])
    }

    /// Number of `connect` calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> ConnectOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = next {
            *last = outcome;
        }
        last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_replays_then_repeats_last() {
        let connector = ScriptedConnector::new([
            ConnectOutcome::unreachable("down"),
            ConnectOutcome::Unauthorized,
        ]);

        assert_eq!(connector.connect().await, ConnectOutcome::unreachable("down"));
        assert_eq!(connector.connect().await, ConnectOutcome::Unauthorized);
        assert_eq!(connector.connect().await, ConnectOutcome::Unauthorized);
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test]
    async fn test_flaky_connects_eventually() {
        let connector = ScriptedConnector::flaky(2);
        assert!(!connector.connect().await.is_connected());
        assert!(!connector.connect().await.is_connected());
        assert!(connector.connect().await.is_connected());
    }

    #[tokio::test]
    async fn test_empty_script_connects() {
        let connector = ScriptedConnector::new([]);
        assert!(connector.connect().await.is_connected());
    }
}
