use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command queue is empty")]
    EmptyQueue,
}

impl CoreError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::invalid_argument("a sequence cannot contain itself");
        assert!(error.to_string().contains("cannot contain itself"));
        assert_eq!(CoreError::EmptyQueue.to_string(), "Command queue is empty");
    }
}
