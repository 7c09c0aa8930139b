//! Machine-level error taxonomy returned by the controller API.

use fleet_fsm::FsmError;
use thiserror::Error;

use crate::allocator::AllocatorError;
use crate::driver::DriverError;
use crate::state::StateStoreError;

/// Errors surfaced to callers of the machine API.
///
/// Guard failures never change state. `Internal` errors from a committed
/// transition (for example a failed local write) do not mean the event
/// did not happen.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The transition table rejected the event.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The machine is not in a status that allows the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resources exhausted: {0}")]
    ResourcesExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MachineError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition(message.into())
    }

    /// Whether the caller supplied a request the current state cannot accept.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition(_) | Self::FailedPrecondition(_) | Self::NotFound(_)
        )
    }
}

impl From<FsmError> for MachineError {
    fn from(err: FsmError) -> Self {
        match err {
            FsmError::CannotTransition { .. } => Self::InvalidTransition(err.to_string()),
            FsmError::Rejected { .. } => Self::FailedPrecondition(err.to_string()),
            FsmError::UnknownEvent(_) | FsmError::Hook { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<DriverError> for MachineError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotFound(_) => Self::NotFound(err.to_string()),
            DriverError::NotRunning(_) => Self::FailedPrecondition(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<AllocatorError> for MachineError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::Exhausted { .. } => Self::ResourcesExhausted(err.to_string()),
            AllocatorError::NotFound(_) | AllocatorError::Expired(_) => {
                Self::NotFound(err.to_string())
            }
            AllocatorError::AlreadyAllocated(_) => Self::FailedPrecondition(err.to_string()),
        }
    }
}

impl From<StateStoreError> for MachineError {
    fn from(err: StateStoreError) -> Self {
        match err {
            StateStoreError::NotFound(_) => Self::NotFound(err.to_string()),
            StateStoreError::AlreadyExists(_) => Self::FailedPrecondition(err.to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}
