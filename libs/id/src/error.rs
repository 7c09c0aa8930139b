//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing an ID string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("{kind} ID cannot be empty")]
    Empty { kind: &'static str },

    /// The ID has no `_` between prefix and ULID.
    #[error("{kind} ID missing underscore separator")]
    MissingSeparator { kind: &'static str },

    /// The ID prefix belongs to another resource type.
    #[error("invalid {kind} ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        kind: &'static str,
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID in {kind} ID: {reason}")]
    InvalidUlid { kind: &'static str, reason: String },
}

impl IdError {
    /// Resource kind the failed parse was targeting.
    pub fn kind(&self) -> &'static str {
        match self {
            IdError::Empty { kind }
            | IdError::MissingSeparator { kind }
            | IdError::InvalidPrefix { kind, .. }
            | IdError::InvalidUlid { kind, .. } => kind,
        }
    }

    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
