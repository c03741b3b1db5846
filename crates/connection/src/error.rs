use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection rejected: authorization failed")]
    PermanentConnectionFailure,

    #[error("Connection failed after {attempts} attempt(s)")]
    TransientConnectionFailure { attempts: u32 },

    #[error("A connection attempt is already in progress")]
    AttemptInProgress,

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectionError {
    /// Whether running the recovery again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientConnectionFailure { .. } | Self::AttemptInProgress
        )
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConnectionError::TransientConnectionFailure { attempts: 3 };
        assert_eq!(error.to_string(), "Connection failed after 3 attempt(s)");
        assert!(error.is_retryable());
        assert!(!ConnectionError::PermanentConnectionFailure.is_retryable());
    }
}
