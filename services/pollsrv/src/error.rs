//! Error handling for the polling service

use fieldlink_core::CommError;
use thiserror::Error;

/// Polling service error type
#[derive(Error, Debug)]
pub enum PollSrvError {
    /// Configuration file or environment problems
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A configured link or controller failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    LoggingError(String),

    /// Link transport could not be created
    #[error("Link error: {link}: {source}")]
    LinkError {
        link: String,
        #[source]
        source: CommError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the polling service
pub type Result<T> = std::result::Result<T, PollSrvError>;

impl From<figment::Error> for PollSrvError {
    fn from(err: figment::Error) -> Self {
        PollSrvError::ConfigError(err.to_string())
    }
}
