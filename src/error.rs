//! Error types for dlcore

use crate::core::task::TaskState;
use thiserror::Error;

/// Main error type for dlcore operations
#[derive(Debug, Error)]
pub enum DlError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot {action} task {id} in state {from}")]
    InvalidStateTransition {
        id: String,
        from: TaskState,
        action: &'static str,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Orchestrator is shut down")]
    Shutdown,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),
}

impl DlError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DlError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error() || s.as_u16() == 429).unwrap_or(true)
            }
            DlError::Transfer(_) => true,
            _ => false,
        }
    }

    /// Check if error is a caller bug rather than a runtime condition
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, DlError::InvalidArgument(_) | DlError::Configuration(_))
    }
}
