//! # fleet-fsm
//!
//! A small transition-table state machine.
//!
//! A [`StateMachine`] owns one observable state value. Events are pushed one
//! at a time under an exclusive lock and go through the [`TransitionSet`]
//! registered for their kind:
//!
//! ```text
//! push(event)
//!   ├── no set for kind        -> UnknownEvent       (state untouched)
//!   ├── can(state, event)=false -> CannotTransition  (state untouched)
//!   ├── before(..) fails       -> Rejected           (state untouched)
//!   ├── next = state.clone(); apply(next); Hooks::apply_all(next)
//!   ├── commit next
//!   └── after(..), Hooks::after_all(..) -> Hook error (state already committed)
//! ```
//!
//! [`StateMachine::mutate`] changes fields outside the transition table with
//! the same copy-then-commit discipline and runs [`Hooks::after_mutate`].

mod error;
mod machine;
mod table;

pub use error::{FsmError, HookError};
pub use machine::{Event, Hooks, NoHooks, State, StateMachine, Transitioned};
pub use table::{AfterFn, ApplyFn, BeforeFn, GuardFn, TransitionSet, Transitions};
