//! The state machine and its hook interface.

use std::borrow::Cow;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use crate::table::Transitions;
use crate::{FsmError, HookError};

/// State values held by a [`StateMachine`].
pub trait State: Clone + Send + Sync + 'static {
    /// Short label used in errors and logs (usually the status name).
    fn label(&self) -> Cow<'_, str>;
}

/// Events accepted by a [`StateMachine`].
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Global hooks run for every transition, injected at construction.
pub trait Hooks<S, E>: Send + Sync + 'static {
    /// Runs after the event-specific `apply`, before commit.
    fn apply_all(&self, _state: &mut S, _event: &E) {}

    /// Runs after commit and after the event-specific `after` hook.
    fn after_all(&self, _previous: &S, _next: &S, _event: &E) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs after a committed [`StateMachine::mutate`].
    fn after_mutate(&self, _previous: &S, _next: &S) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<S, E> Hooks<S, E> for NoHooks {}

/// Result of a successful push or mutation.
#[derive(Debug, Clone)]
pub struct Transitioned<S, E> {
    pub previous: S,
    pub next: S,
    pub event: E,
}

pub struct StateMachine<S: State, E: Event, H: Hooks<S, E>> {
    transitions: Transitions<S, E>,
    hooks: H,
    current: watch::Sender<S>,
    push_lock: Mutex<()>,
}

impl<S: State, E: Event, H: Hooks<S, E>> StateMachine<S, E, H> {
    pub fn new(initial: S, transitions: Transitions<S, E>, hooks: H) -> Self {
        let (current, _) = watch::channel(initial);
        Self {
            transitions,
            hooks,
            current,
            push_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> S {
        self.current.borrow().clone()
    }

    /// Observe committed states.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.current.subscribe()
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn transitions(&self) -> &Transitions<S, E> {
        &self.transitions
    }

    pub fn push_event(&self, event: E) -> Result<Transitioned<S, E>, FsmError> {
        self.push_with(|_| event)
    }

    /// Builds the event from the current state under the push lock, then
    /// validates and applies it.
    ///
    /// Building under the lock lets the event record facts (such as its
    /// resulting status) that depend on the state it is applied to.
    pub fn push_with<F>(&self, build: F) -> Result<Transitioned<S, E>, FsmError>
    where
        F: FnOnce(&S) -> E,
    {
        let _guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.current.borrow().clone();
        let event = build(&previous);
        let kind = event.kind();

        let Some(set) = self.transitions.get(&kind) else {
            return Err(FsmError::UnknownEvent(kind.to_string()));
        };

        if let Some(can) = set.can {
            if !can(&previous, &event) {
                return Err(FsmError::CannotTransition {
                    event: kind.to_string(),
                    state: previous.label().into_owned(),
                });
            }
        }

        if let Some(before) = set.before {
            before(&previous, &event).map_err(|source| FsmError::Rejected {
                event: kind.to_string(),
                source,
            })?;
        }

        let mut next = previous.clone();
        if let Some(apply) = set.apply {
            apply(&mut next, &event);
        }
        self.hooks.apply_all(&mut next, &event);

        self.current.send_replace(next.clone());
        trace!(event = %kind, from = %previous.label(), to = %next.label(), "Transition committed");

        // Both after-hooks run even if the first fails; the first error wins.
        let after = set.after.map_or(Ok(()), |after| after(&previous, &next, &event));
        let after_all = self.hooks.after_all(&previous, &next, &event);
        if let Err(source) = after.and(after_all) {
            return Err(FsmError::Hook {
                event: kind.to_string(),
                source,
            });
        }

        Ok(Transitioned {
            previous,
            next,
            event,
        })
    }

    /// Applies a field-level change that is not a lifecycle event.
    pub fn mutate<F>(&self, change: F) -> Result<Transitioned<S, ()>, FsmError>
    where
        F: FnOnce(&mut S),
    {
        let _guard = self.push_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = self.current.borrow().clone();
        let mut next = previous.clone();
        change(&mut next);
        self.current.send_replace(next.clone());

        self.hooks
            .after_mutate(&previous, &next)
            .map_err(|source| FsmError::Hook {
                event: "mutate".to_string(),
                source,
            })?;

        Ok(Transitioned {
            previous,
            next,
            event: (),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransitionSet;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Open,
        Closed,
        Locked,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct DoorState {
        door: Door,
        opened: u32,
        stamped: u32,
        note: &'static str,
    }

    impl State for DoorState {
        fn label(&self) -> Cow<'_, str> {
            Cow::Owned(format!("{:?}", self.door))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Push {
        Open,
        Close,
        Lock,
        Unlock,
        Kick,
    }

    impl Display for Push {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Event for Push {
        type Kind = Push;

        fn kind(&self) -> Push {
            *self
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        after_all: AtomicUsize,
        after_mutate: AtomicUsize,
        fail_after: bool,
    }

    impl Hooks<DoorState, Push> for CountingHooks {
        fn apply_all(&self, state: &mut DoorState, _event: &Push) {
            state.stamped += 1;
        }

        fn after_all(&self, _: &DoorState, _: &DoorState, _: &Push) -> Result<(), HookError> {
            self.after_all.fetch_add(1, Ordering::SeqCst);
            if self.fail_after {
                return Err("disk full".into());
            }
            Ok(())
        }

        fn after_mutate(&self, _: &DoorState, _: &DoorState) -> Result<(), HookError> {
            self.after_mutate.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type DoorSet = TransitionSet<DoorState, Push>;

    fn door_table() -> Transitions<DoorState, Push> {
        Transitions::new()
            .on(
                Push::Open,
                DoorSet::new()
                    .can(|s, _| s.door == Door::Closed)
                    .apply(|s, _| {
                        s.door = Door::Open;
                        s.opened += 1;
                    }),
            )
            .on(
                Push::Close,
                DoorSet::new()
                    .can(|s, _| s.door == Door::Open)
                    .apply(|s, _| s.door = Door::Closed),
            )
            .on(
                Push::Lock,
                DoorSet::new()
                    .can(|s, _| s.door == Door::Closed)
                    .apply(|s, _| s.door = Door::Locked),
            )
            .on(
                Push::Unlock,
                DoorSet::new()
                    .can(|s, _| s.door == Door::Locked)
                    .before(|s, _| {
                        if s.opened > 2 {
                            return Err("worn out".into());
                        }
                        Ok(())
                    })
                    .apply(|s, _| s.door = Door::Closed)
                    .after(|_, next, _| {
                        if next.note == "fail" {
                            return Err("after failed".into());
                        }
                        Ok(())
                    }),
            )
    }

    fn closed() -> DoorState {
        DoorState {
            door: Door::Closed,
            opened: 0,
            stamped: 0,
            note: "",
        }
    }

    fn machine(hooks: CountingHooks) -> StateMachine<DoorState, Push, CountingHooks> {
        StateMachine::new(closed(), door_table(), hooks)
    }

    #[test]
    fn test_push_applies_then_apply_all() {
        let fsm = machine(CountingHooks::default());
        let t = fsm.push_event(Push::Open).unwrap();

        assert_eq!(t.previous.door, Door::Closed);
        assert_eq!(t.next.door, Door::Open);
        assert_eq!(t.next.opened, 1);
        assert_eq!(t.next.stamped, 1);
        assert_eq!(fsm.state(), t.next);
        assert_eq!(fsm.hooks().after_all.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_event() {
        let fsm = machine(CountingHooks::default());
        let err = fsm.push_event(Push::Kick).unwrap_err();
        assert!(matches!(err, FsmError::UnknownEvent(ref k) if k == "Kick"));
        assert_eq!(fsm.state(), closed());
    }

    #[rstest]
    #[case(Push::Close)]
    #[case(Push::Unlock)]
    fn test_guard_rejection_leaves_state(#[case] event: Push) {
        let fsm = machine(CountingHooks::default());
        let err = fsm.push_event(event).unwrap_err();
        assert!(matches!(err, FsmError::CannotTransition { ref state, .. } if state == "Closed"));
        assert!(!err.is_committed());
        assert_eq!(fsm.state(), closed());
        assert_eq!(fsm.hooks().after_all.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_before_rejection_leaves_state() {
        let worn = DoorState {
            door: Door::Locked,
            opened: 3,
            ..closed()
        };
        let fsm = StateMachine::new(worn.clone(), door_table(), CountingHooks::default());
        let err = fsm.push_event(Push::Unlock).unwrap_err();
        assert!(matches!(err, FsmError::Rejected { .. }));
        assert_eq!(fsm.state(), worn);
    }

    #[test]
    fn test_after_failure_still_commits() {
        let fsm = machine(CountingHooks {
            fail_after: true,
            ..CountingHooks::default()
        });
        let err = fsm.push_event(Push::Open).unwrap_err();
        assert!(err.is_committed());
        assert_eq!(fsm.state().door, Door::Open);
    }

    #[test]
    fn test_event_after_hook_failure_runs_after_all() {
        let locked = DoorState {
            door: Door::Locked,
            note: "fail",
            ..closed()
        };
        let fsm = StateMachine::new(locked, door_table(), CountingHooks::default());
        let err = fsm.push_event(Push::Unlock).unwrap_err();
        assert!(err.is_committed());
        assert_eq!(fsm.state().door, Door::Closed);
        assert_eq!(fsm.hooks().after_all.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_with_sees_current_state() {
        let fsm = machine(CountingHooks::default());
        fsm.push_event(Push::Open).unwrap();
        let t = fsm
            .push_with(|s| if s.door == Door::Open { Push::Close } else { Push::Open })
            .unwrap();
        assert_eq!(t.event, Push::Close);
        assert_eq!(fsm.state().door, Door::Closed);
    }

    #[test]
    fn test_mutate_bypasses_table() {
        let fsm = machine(CountingHooks::default());
        let t = fsm.mutate(|s| s.note = "painted").unwrap();
        assert_eq!(t.previous.note, "");
        assert_eq!(fsm.state().note, "painted");
        assert_eq!(fsm.state().stamped, 0);
        assert_eq!(fsm.hooks().after_mutate.load(Ordering::SeqCst), 1);
        assert_eq!(fsm.hooks().after_all.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribers_observe_commits() {
        let fsm = machine(CountingHooks::default());
        let rx = fsm.subscribe();
        fsm.push_event(Push::Open).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().door, Door::Open);
    }

    #[test]
    fn test_concurrent_pushes_are_serialized() {
        let fsm = Arc::new(machine(CountingHooks::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fsm = Arc::clone(&fsm);
                std::thread::spawn(move || {
                    let mut ok = 0;
                    for _ in 0..50 {
                        if fsm
                            .push_with(|s| match s.door {
                                Door::Open => Push::Close,
                                _ => Push::Open,
                            })
                            .is_ok()
                        {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // Every push sees the state left by the previous one, so none fail.
        assert_eq!(total, 400);
        assert_eq!(fsm.state().stamped, 400);
        assert_eq!(fsm.state().opened, 200);
    }

    fn door_strategy() -> impl Strategy<Value = DoorState> {
        (
            prop_oneof![Just(Door::Open), Just(Door::Closed), Just(Door::Locked)],
            0u32..5,
        )
            .prop_map(|(door, opened)| DoorState {
                door,
                opened,
                ..closed()
            })
    }

    fn push_strategy() -> impl Strategy<Value = Push> {
        prop_oneof![
            Just(Push::Open),
            Just(Push::Close),
            Just(Push::Lock),
            Just(Push::Unlock),
        ]
    }

    proptest! {
        #[test]
        fn prop_rejected_guard_never_mutates(state in door_strategy(), event in push_strategy()) {
            let table = door_table();
            prop_assume!(!table.allows(&state, &event));

            let fsm = StateMachine::new(state.clone(), table, NoHooks);
            let result = fsm.push_event(event);
            let is_cannot_transition = matches!(result, Err(FsmError::CannotTransition { .. }));
            prop_assert!(is_cannot_transition);
            prop_assert_eq!(fsm.state(), state);
        }
    }
}
