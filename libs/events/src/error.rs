//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event type name is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The status name is unknown.
    #[error("unknown machine status: {0}")]
    UnknownStatus(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
