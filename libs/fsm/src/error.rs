//! Transition engine errors.

use thiserror::Error;

/// Error returned by `before`/`after` hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FsmError {
    /// No transition set is registered for the event kind.
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    /// The guard rejected the event; state was not changed.
    #[error("cannot transition on '{event}' from '{state}'")]
    CannotTransition { event: String, state: String },

    /// The `before` hook rejected the event; state was not changed.
    #[error("'{event}' rejected: {source}")]
    Rejected {
        event: String,
        #[source]
        source: HookError,
    },

    /// The new state was committed but an after-hook failed.
    #[error("'{event}' committed but after-hook failed: {source}")]
    Hook {
        event: String,
        #[source]
        source: HookError,
    },
}

impl FsmError {
    /// Whether the state advanced despite the error.
    pub fn is_committed(&self) -> bool {
        matches!(self, FsmError::Hook { .. })
    }
}
