//! Error types for the matchmaking core
//!
//! Domain errors are `MatchmakingError` variants raised through `anyhow`
//! (`MatchmakingError::X { .. }.into()`) and recovered by callers with
//! `downcast_ref`. Queue-path failures cross the response channel as an
//! [`ErrorKind`] plus message and are rebuilt on the waiting side.

use serde::{Deserialize, Serialize};

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchmakingError {
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    #[error("Request {request_id} timed out after {seconds}s")]
    Timeout { request_id: String, seconds: u64 },

    #[error("Index consistency error: {message}")]
    IndexConsistency { message: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Storage backend error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Wire-level classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NotFound,
    UnsupportedOperation,
    Timeout,
    IndexConsistency,
    InvalidRequest,
    Storage,
    Serialization,
    Internal,
}

impl MatchmakingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchmakingError::ConfigurationError { .. } => ErrorKind::Configuration,
            MatchmakingError::NotFound { .. } => ErrorKind::NotFound,
            MatchmakingError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            MatchmakingError::Timeout { .. } => ErrorKind::Timeout,
            MatchmakingError::IndexConsistency { .. } => ErrorKind::IndexConsistency,
            MatchmakingError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            MatchmakingError::Storage { .. } => ErrorKind::Storage,
            MatchmakingError::Serialization { .. } => ErrorKind::Serialization,
            MatchmakingError::InternalError { .. } => ErrorKind::Internal,
        }
    }

    /// Rebuild an error delivered as a failure payload
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Configuration => MatchmakingError::ConfigurationError { message },
            ErrorKind::NotFound => MatchmakingError::NotFound { message },
            ErrorKind::UnsupportedOperation => MatchmakingError::UnsupportedOperation { message },
            ErrorKind::Timeout => MatchmakingError::Timeout {
                request_id: message,
                seconds: 0,
            },
            ErrorKind::IndexConsistency => MatchmakingError::IndexConsistency { message },
            ErrorKind::InvalidRequest => MatchmakingError::InvalidRequest { reason: message },
            ErrorKind::Storage => MatchmakingError::Storage { message },
            ErrorKind::Serialization => MatchmakingError::Serialization { message },
            ErrorKind::Internal => MatchmakingError::InternalError { message },
        }
    }

    /// Classify any error, falling back to `Internal` for foreign errors
    pub fn classify(error: &anyhow::Error) -> (ErrorKind, String) {
        match error.downcast_ref::<MatchmakingError>() {
            Some(err) => (err.kind(), err.detail()),
            None => (ErrorKind::Internal, error.to_string()),
        }
    }

    fn detail(&self) -> String {
        match self {
            MatchmakingError::ConfigurationError { message }
            | MatchmakingError::NotFound { message }
            | MatchmakingError::UnsupportedOperation { message }
            | MatchmakingError::IndexConsistency { message }
            | MatchmakingError::Storage { message }
            | MatchmakingError::Serialization { message }
            | MatchmakingError::InternalError { message } => message.clone(),
            MatchmakingError::InvalidRequest { reason } => reason.clone(),
            MatchmakingError::Timeout { request_id, .. } => request_id.clone(),
        }
    }
}

/// Shorthand for the `NotFound` variant as an `anyhow::Error`
pub fn not_found(message: impl Into<String>) -> anyhow::Error {
    MatchmakingError::NotFound {
        message: message.into(),
    }
    .into()
}

/// Shorthand for the `Storage` variant as an `anyhow::Error`
pub fn storage(message: impl Into<String>) -> anyhow::Error {
    MatchmakingError::Storage {
        message: message.into(),
    }
    .into()
}
