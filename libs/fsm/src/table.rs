//! Transition table types.

use std::collections::HashMap;
use std::fmt;

use crate::machine::Event;
use crate::HookError;

/// Guard: may the event be applied to the current state?
pub type GuardFn<S, E> = fn(&S, &E) -> bool;
/// Runs before any mutation; an error aborts the push.
pub type BeforeFn<S, E> = fn(&S, &E) -> Result<(), HookError>;
/// Event-specific field changes on the copied state.
pub type ApplyFn<S, E> = fn(&mut S, &E);
/// Runs after commit with `(previous, next, event)`.
pub type AfterFn<S, E> = fn(&S, &S, &E) -> Result<(), HookError>;

/// Behaviour of one event kind.
pub struct TransitionSet<S, E> {
    pub(crate) can: Option<GuardFn<S, E>>,
    pub(crate) before: Option<BeforeFn<S, E>>,
    pub(crate) apply: Option<ApplyFn<S, E>>,
    pub(crate) after: Option<AfterFn<S, E>>,
}

impl<S, E> TransitionSet<S, E> {
    pub fn new() -> Self {
        Self {
            can: None,
            before: None,
            apply: None,
            after: None,
        }
    }

    pub fn can(mut self, guard: GuardFn<S, E>) -> Self {
        self.can = Some(guard);
        self
    }

    pub fn before(mut self, before: BeforeFn<S, E>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn apply(mut self, apply: ApplyFn<S, E>) -> Self {
        self.apply = Some(apply);
        self
    }

    pub fn after(mut self, after: AfterFn<S, E>) -> Self {
        self.after = Some(after);
        self
    }
}

impl<S, E> Default for TransitionSet<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, E> fmt::Debug for TransitionSet<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionSet")
            .field("can", &self.can.is_some())
            .field("before", &self.before.is_some())
            .field("apply", &self.apply.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

/// Transition sets keyed by event kind.
pub struct Transitions<S, E: Event> {
    sets: HashMap<E::Kind, TransitionSet<S, E>>,
}

impl<S, E: Event> Transitions<S, E> {
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }

    /// Registers (or replaces) the set for `kind`.
    pub fn on(mut self, kind: E::Kind, set: TransitionSet<S, E>) -> Self {
        self.sets.insert(kind, set);
        self
    }

    pub fn get(&self, kind: &E::Kind) -> Option<&TransitionSet<S, E>> {
        self.sets.get(kind)
    }

    /// Evaluates only the guard for `kind`; unknown kinds are never allowed.
    pub fn allows(&self, state: &S, event: &E) -> bool {
        match self.sets.get(&event.kind()) {
            Some(set) => set.can.map_or(true, |can| can(state, event)),
            None => false,
        }
    }
}

impl<S, E: Event> Default for Transitions<S, E> {
    fn default() -> Self {
        Self::new()
    }
}
