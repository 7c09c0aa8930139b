//! Machine state: the lifecycle transition table bound to one machine.
//!
//! Every lifecycle change goes through [`MachineState`], which builds the
//! typed event and pushes it through the transition engine. After each
//! committed transition the hooks record the event in the bounded history,
//! persist `(state, event)` in one local transaction, queue the event for
//! upstream delivery, signal the sync loop and hand the event to the
//! controller's event loop.

use std::net::Ipv4Addr;
use std::sync::Arc;

use fleet_events::{
    DesiredStatus, EventOrigin, ExitInfo, MachineEvent, MachineEventPayload, MachineEventType,
    MachineStatus, StopConfig,
};
use fleet_fsm::{HookError, Hooks, StateMachine, TransitionSet, Transitions};
use fleet_reconcile::Trigger;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::MachineError;
use crate::state::StateStore;

use super::delivery::DeliveryQueue;
use super::model::{Machine, MachineInstanceState};

type State = MachineInstanceState;
type Set = TransitionSet<State, MachineEvent>;

// =============================================================================
// Transition table
// =============================================================================

/// Guards and field effects of every lifecycle event.
///
/// `status` is not touched here: it is stamped from the event by
/// [`MachineHooks::apply_all`].
pub fn lifecycle_transitions() -> Transitions<State, MachineEvent> {
    use MachineStatus::*;

    Transitions::new()
        .on(
            MachineEventType::Prepare,
            Set::new().can(|s, _| matches!(s.status, Created | Preparing)),
        )
        .on(
            MachineEventType::Prepared,
            Set::new()
                .can(|s, _| s.status == Preparing)
                .apply(|s, e| {
                    if let MachineEventPayload::Prepared { local_ipv4 } = e.payload() {
                        s.local_ipv4 = *local_ipv4;
                    }
                }),
        )
        .on(
            MachineEventType::PrepareFailed,
            Set::new()
                .can(|s, _| s.status == Preparing)
                .apply(|s, _| s.desired_status = DesiredStatus::Destroyed),
        )
        .on(
            MachineEventType::Start,
            Set::new().can(|s, _| s.status == Stopped).apply(|s, e| {
                s.restarts = if e.is_restart() { s.restarts + 1 } else { 0 };
                s.desired_status = DesiredStatus::Running;
            }),
        )
        .on(
            MachineEventType::Started,
            Set::new().can(|s, _| s.status == Starting),
        )
        .on(
            MachineEventType::StartFailed,
            Set::new().can(|s, _| s.status == Starting),
        )
        .on(
            MachineEventType::Stop,
            Set::new()
                .can(|s, _| matches!(s.status, Running | Stopping))
                .apply(|s, _| {
                    s.restarts = 0;
                    s.desired_status = DesiredStatus::Stopped;
                }),
        )
        .on(
            MachineEventType::StopFailed,
            Set::new().can(|s, _| matches!(s.status, Stopping | Starting)),
        )
        .on(
            MachineEventType::Exited,
            Set::new().can(|s, _| matches!(s.status, Starting | Running | Stopping | Destroying)),
        )
        .on(
            MachineEventType::Destroy,
            Set::new()
                .can(|s, e| match s.status {
                    Stopped | Destroying => true,
                    Running => matches!(e.payload(), MachineEventPayload::Destroy { force: true, .. }),
                    // A failed prepare leaves the machine marked for destruction.
                    Preparing => s.desired_status == DesiredStatus::Destroyed,
                    _ => false,
                })
                .apply(|s, _| s.desired_status = DesiredStatus::Destroyed),
        )
        .on(
            MachineEventType::Destroyed,
            Set::new().can(|s, _| s.status == Destroying),
        )
}

/// Status a machine holds after `payload` is applied to `current`.
fn target_status(current: &State, payload: &MachineEventPayload) -> MachineStatus {
    use MachineStatus::*;

    match payload {
        MachineEventPayload::Prepare => Preparing,
        MachineEventPayload::Prepared { .. } => Stopped,
        MachineEventPayload::Start { .. } => Starting,
        MachineEventPayload::Started => Running,
        MachineEventPayload::StartFailed { .. } => Stopped,
        MachineEventPayload::Stop { .. } => Stopping,
        MachineEventPayload::Exited(_) => match current.status {
            Destroying | Destroyed => current.status,
            _ => Stopped,
        },
        MachineEventPayload::Destroy { .. } => Destroying,
        MachineEventPayload::Destroyed => Destroyed,
        MachineEventPayload::PrepareFailed { .. } | MachineEventPayload::StopFailed { .. } => {
            current.status
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Side effects of every committed transition.
pub(crate) struct MachineHooks {
    pub(crate) machine_id: fleet_id::MachineId,
    pub(crate) store: Arc<StateStore>,
    pub(crate) delivery: DeliveryQueue,
    pub(crate) sync: Trigger,
    pub(crate) committed: mpsc::UnboundedSender<MachineEvent>,
}

impl Hooks<State, MachineEvent> for MachineHooks {
    fn apply_all(&self, state: &mut State, event: &MachineEvent) {
        state.stamp(event);
    }

    fn after_all(&self, _previous: &State, next: &State, event: &MachineEvent) -> Result<(), HookError> {
        let persisted = self.store.persist_transition(self.machine_id, next, event);
        if let Err(e) = &persisted {
            warn!(
                machine_id = %self.machine_id,
                event_id = %event.id(),
                error = %e,
                "Failed to persist transition"
            );
        }

        self.delivery.push(event.clone());
        self.sync.notify();
        if self.committed.send(event.clone()).is_err() {
            debug!(machine_id = %self.machine_id, "Event loop gone, committed event not dispatched");
        }

        persisted.map_err(Into::into)
    }

    fn after_mutate(&self, _previous: &State, next: &State) -> Result<(), HookError> {
        let persisted = self.store.update_machine_instance_state(self.machine_id, next);
        self.sync.notify();
        persisted.map_err(Into::into)
    }
}

// =============================================================================
// Machine state
// =============================================================================

/// One machine's lifecycle state and its typed event constructors.
pub struct MachineState {
    machine: Machine,
    engine: StateMachine<State, MachineEvent, MachineHooks>,
}

impl MachineState {
    pub(crate) fn new(machine: Machine, initial: State, hooks: MachineHooks) -> Self {
        Self {
            machine,
            engine: StateMachine::new(initial, lifecycle_transitions(), hooks),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn snapshot(&self) -> State {
        self.engine.state()
    }

    pub fn status(&self) -> MachineStatus {
        self.engine.state().status
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.engine.subscribe()
    }

    /// Builds the event against the state it is applied to and pushes it.
    fn push(&self, origin: EventOrigin, payload: MachineEventPayload) -> Result<MachineEvent, MachineError> {
        let transitioned = self.engine.push_with(|current| {
            let status = target_status(current, &payload);
            MachineEvent::new(self.machine.id, self.machine.instance_id, origin, status, payload)
        })?;

        debug!(
            machine_id = %self.machine.id,
            event = %transitioned.event.event_type(),
            from = %transitioned.previous.status,
            to = %transitioned.next.status,
            "Machine transitioned"
        );
        Ok(transitioned.event)
    }

    pub fn prepare(&self, origin: EventOrigin) -> Result<MachineEvent, MachineError> {
        self.push(origin, MachineEventPayload::Prepare)
    }

    pub fn prepared(&self, local_ipv4: Option<Ipv4Addr>) -> Result<MachineEvent, MachineError> {
        self.push(EventOrigin::System, MachineEventPayload::Prepared { local_ipv4 })
    }

    pub fn prepare_failed(&self, error: impl Into<String>) -> Result<MachineEvent, MachineError> {
        self.push(
            EventOrigin::System,
            MachineEventPayload::PrepareFailed {
                error: error.into(),
            },
        )
    }

    pub fn start(&self, origin: EventOrigin, is_restart: bool) -> Result<MachineEvent, MachineError> {
        self.push(origin, MachineEventPayload::Start { is_restart })
    }

    pub fn started(&self) -> Result<MachineEvent, MachineError> {
        self.push(EventOrigin::System, MachineEventPayload::Started)
    }

    pub fn start_failed(&self, error: impl Into<String>) -> Result<MachineEvent, MachineError> {
        self.push(
            EventOrigin::System,
            MachineEventPayload::StartFailed {
                error: error.into(),
            },
        )
    }

    pub fn stop(&self, origin: EventOrigin, config: StopConfig) -> Result<MachineEvent, MachineError> {
        self.push(origin, MachineEventPayload::Stop { config })
    }

    pub fn stop_failed(&self, error: impl Into<String>) -> Result<MachineEvent, MachineError> {
        self.push(
            EventOrigin::System,
            MachineEventPayload::StopFailed {
                error: error.into(),
            },
        )
    }

    pub fn exited(&self, exit: ExitInfo) -> Result<MachineEvent, MachineError> {
        self.push(EventOrigin::System, MachineEventPayload::Exited(exit))
    }

    pub fn destroy(
        &self,
        origin: EventOrigin,
        force: bool,
        auto_destroy: bool,
        reason: impl Into<String>,
    ) -> Result<MachineEvent, MachineError> {
        self.push(
            origin,
            MachineEventPayload::Destroy {
                force,
                auto_destroy,
                reason: reason.into(),
            },
        )
    }

    pub fn destroyed(&self) -> Result<MachineEvent, MachineError> {
        self.push(EventOrigin::System, MachineEventPayload::Destroyed)
    }

    /// Toggles the gateway flag. Not a lifecycle event.
    pub fn set_gateway(&self, enabled: bool) -> Result<State, MachineError> {
        let changed = self
            .engine
            .mutate(|s| s.machine_gateway_enabled = enabled)?;
        Ok(changed.next)
    }

    pub fn set_desired_status(&self, desired: DesiredStatus) -> Result<State, MachineError> {
        let changed = self.engine.mutate(|s| s.desired_status = desired)?;
        Ok(changed.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_events::HISTORY_CAPACITY;
    use fleet_id::{FleetId, InstanceId, MachineId, NodeId, VersionId};
    use proptest::prelude::*;
    use rstest::rstest;

    use crate::state::MachineRecord;
    use crate::machine::{GuestResources, MachineVersion, RestartPolicy};

    struct Fixture {
        state: MachineState,
        store: Arc<StateStore>,
        committed: mpsc::UnboundedReceiver<MachineEvent>,
        _sync: fleet_reconcile::TriggerListener,
    }

    fn fixture_with(initial: State) -> Fixture {
        let machine = Machine {
            id: MachineId::new(),
            namespace: "default".to_string(),
            fleet_id: FleetId::new(),
            region: "local".to_string(),
            version_id: VersionId::new(),
            node_id: NodeId::new(),
            instance_id: InstanceId::new(),
        };
        let version = MachineVersion {
            id: machine.version_id,
            machine_id: machine.id,
            image_ref: "registry.local/app:v1".to_string(),
            guest: GuestResources {
                cpus: 1,
                memory_mb: 256,
            },
            restart: RestartPolicy::Always,
            auto_destroy: false,
            stop_config: StopConfig::default(),
            init: Default::default(),
            env: Default::default(),
        };

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store
            .create_machine_instance(&MachineRecord {
                machine: machine.clone(),
                version,
                state: initial.clone(),
            })
            .unwrap();

        let delivery = DeliveryQueue::detached(machine.id);
        let (sync, listener) = fleet_reconcile::trigger();
        let (committed_tx, committed) = mpsc::unbounded_channel();

        let hooks = MachineHooks {
            machine_id: machine.id,
            store: Arc::clone(&store),
            delivery,
            sync,
            committed: committed_tx,
        };

        Fixture {
            state: MachineState::new(machine, initial, hooks),
            store,
            committed,
            _sync: listener,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(State::new())
    }

    fn with_status(status: MachineStatus, desired: DesiredStatus) -> State {
        let mut state = State::new();
        state.status = status;
        state.desired_status = desired;
        state
    }

    fn exit_info(code: i32) -> ExitInfo {
        ExitInfo {
            exit_code: code,
            exited_at: Utc::now(),
            oom_killed: false,
        }
    }

    #[test]
    fn test_happy_path_to_running() {
        let f = fixture();
        f.state.prepare(EventOrigin::System).unwrap();
        let ip = Ipv4Addr::new(172, 19, 0, 2);
        f.state.prepared(Some(ip)).unwrap();
        f.state.start(EventOrigin::System, false).unwrap();
        let ev = f.state.started().unwrap();

        let snap = f.state.snapshot();
        assert_eq!(snap.status(), MachineStatus::Running);
        assert_eq!(snap.local_ipv4, Some(ip));
        assert_eq!(snap.restarts, 0);
        assert_eq!(snap.updated_at, ev.timestamp());
        assert_eq!(snap.events.latest().unwrap().id(), ev.id());

        let persisted = f.store.get_machine_instance(f.state.machine().id).unwrap().unwrap();
        assert_eq!(persisted.state, snap);
        assert_eq!(f.store.count_machine_instance_events().unwrap(), 4);
    }

    #[test]
    fn test_event_status_is_resulting_status() {
        let f = fixture_with(with_status(MachineStatus::Running, DesiredStatus::Running));
        let ev = f.state.exited(exit_info(1)).unwrap();
        assert_eq!(ev.status(), MachineStatus::Stopped);

        let f = fixture_with(with_status(MachineStatus::Destroying, DesiredStatus::Destroyed));
        let ev = f.state.exited(exit_info(137)).unwrap();
        assert_eq!(ev.status(), MachineStatus::Destroying);
        assert_eq!(f.state.status(), MachineStatus::Destroying);
    }

    #[test]
    fn test_committed_events_reach_event_loop() {
        let mut f = fixture();
        let prepare = f.state.prepare(EventOrigin::User).unwrap();
        let received = f.committed.try_recv().unwrap();
        assert_eq!(received, prepare);
        assert_eq!(received.origin(), EventOrigin::User);
    }

    #[test]
    fn test_restart_counter_law() {
        let f = fixture_with(with_status(MachineStatus::Stopped, DesiredStatus::Running));

        for expected in 1..=3 {
            f.state.start(EventOrigin::System, true).unwrap();
            assert_eq!(f.state.snapshot().restarts, expected);
            f.state.started().unwrap();
            f.state.exited(exit_info(1)).unwrap();
        }

        f.state.start(EventOrigin::User, false).unwrap();
        assert_eq!(f.state.snapshot().restarts, 0);

        f.state.started().unwrap();
        f.state.stop(EventOrigin::User, StopConfig::default()).unwrap();
        let snap = f.state.snapshot();
        assert_eq!(snap.restarts, 0);
        assert_eq!(snap.desired_status, DesiredStatus::Stopped);
    }

    #[test]
    fn test_prepare_failed_marks_for_destroy() {
        let f = fixture();
        f.state.prepare(EventOrigin::System).unwrap();
        let ev = f.state.prepare_failed("image not found").unwrap();
        assert_eq!(ev.status(), MachineStatus::Preparing);
        assert_eq!(f.state.snapshot().desired_status, DesiredStatus::Destroyed);

        f.state
            .destroy(EventOrigin::System, true, false, "prepare failed")
            .unwrap();
        f.state.destroyed().unwrap();
        assert!(f.state.status().is_terminal());
    }

    #[test]
    fn test_stop_failed_keeps_status() {
        let f = fixture_with(with_status(MachineStatus::Running, DesiredStatus::Running));
        f.state.stop(EventOrigin::User, StopConfig::default()).unwrap();
        let ev = f.state.stop_failed("vmm unresponsive").unwrap();
        assert_eq!(ev.status(), MachineStatus::Stopping);
        assert_eq!(f.state.status(), MachineStatus::Stopping);
    }

    #[rstest]
    #[case(MachineStatus::Running, false, false)]
    #[case(MachineStatus::Running, true, true)]
    #[case(MachineStatus::Stopped, false, true)]
    #[case(MachineStatus::Destroying, false, true)]
    #[case(MachineStatus::Starting, true, false)]
    #[case(MachineStatus::Stopping, true, false)]
    #[case(MachineStatus::Created, true, false)]
    #[case(MachineStatus::Destroyed, true, false)]
    fn test_destroy_guard(#[case] status: MachineStatus, #[case] force: bool, #[case] allowed: bool) {
        let f = fixture_with(with_status(status, DesiredStatus::Running));
        let result = f.state.destroy(EventOrigin::User, force, false, "test");
        assert_eq!(result.is_ok(), allowed, "destroy(force={force}) from {status}");
        if allowed {
            assert_eq!(f.state.status(), MachineStatus::Destroying);
            assert_eq!(f.state.snapshot().desired_status, DesiredStatus::Destroyed);
        }
    }

    #[test]
    fn test_destroy_from_preparing_requires_failed_prepare() {
        let f = fixture_with(with_status(MachineStatus::Preparing, DesiredStatus::Running));
        assert!(matches!(
            f.state.destroy(EventOrigin::User, true, false, "test"),
            Err(MachineError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_history_bound() {
        let f = fixture_with(with_status(MachineStatus::Stopped, DesiredStatus::Running));
        let mut last = None;
        for _ in 0..6 {
            f.state.start(EventOrigin::System, true).unwrap();
            last = Some(f.state.start_failed("boom").unwrap());
        }

        let snap = f.state.snapshot();
        assert_eq!(snap.events.len(), HISTORY_CAPACITY);
        assert_eq!(snap.events.latest().unwrap().id(), last.unwrap().id());
    }

    #[test]
    fn test_gateway_toggle_is_not_an_event() {
        let f = fixture_with(with_status(MachineStatus::Running, DesiredStatus::Running));
        let before = f.store.count_machine_instance_events().unwrap();

        let state = f.state.set_gateway(true).unwrap();
        assert!(state.machine_gateway_enabled);
        assert_eq!(state.status(), MachineStatus::Running);
        assert!(state.events.is_empty());

        assert_eq!(f.store.count_machine_instance_events().unwrap(), before);
        let persisted = f.store.get_machine_instance(f.state.machine().id).unwrap().unwrap();
        assert!(persisted.state.machine_gateway_enabled);
    }

    #[test]
    fn test_persistence_failure_still_commits() {
        let f = fixture_with(with_status(MachineStatus::Stopped, DesiredStatus::Running));
        f.store.delete_machine_instance(f.state.machine().id).unwrap();

        let err = f.state.start(EventOrigin::User, false).unwrap_err();
        assert!(matches!(err, MachineError::Internal(_)));
        assert_eq!(f.state.status(), MachineStatus::Starting);
    }

    fn status_strategy() -> impl Strategy<Value = MachineStatus> {
        proptest::sample::select(MachineStatus::ALL.to_vec())
    }

    fn desired_strategy() -> impl Strategy<Value = DesiredStatus> {
        prop_oneof![
            Just(DesiredStatus::Running),
            Just(DesiredStatus::Stopped),
            Just(DesiredStatus::Destroyed),
        ]
    }

    fn payload_strategy() -> impl Strategy<Value = MachineEventPayload> {
        prop_oneof![
            Just(MachineEventPayload::Prepare),
            Just(MachineEventPayload::Prepared { local_ipv4: None }),
            Just(MachineEventPayload::PrepareFailed { error: "e".to_string() }),
            any::<bool>().prop_map(|is_restart| MachineEventPayload::Start { is_restart }),
            Just(MachineEventPayload::Started),
            Just(MachineEventPayload::StartFailed { error: "e".to_string() }),
            Just(MachineEventPayload::Stop { config: StopConfig::default() }),
            Just(MachineEventPayload::StopFailed { error: "e".to_string() }),
            Just(MachineEventPayload::Exited(ExitInfo {
                exit_code: 1,
                exited_at: Utc::now(),
                oom_killed: false,
            })),
            any::<bool>().prop_map(|force| MachineEventPayload::Destroy {
                force,
                auto_destroy: false,
                reason: "test".to_string(),
            }),
            Just(MachineEventPayload::Destroyed),
        ]
    }

    proptest! {
        #[test]
        fn prop_guard_rejection_never_mutates(
            status in status_strategy(),
            desired in desired_strategy(),
            payload in payload_strategy(),
        ) {
            let initial = with_status(status, desired);
            let candidate = MachineEvent::new(
                MachineId::new(),
                InstanceId::new(),
                EventOrigin::System,
                status,
                payload.clone(),
            );
            prop_assume!(!lifecycle_transitions().allows(&initial, &candidate));

            let f = fixture_with(initial.clone());
            let result = f.state.push(EventOrigin::System, payload);
            let rejected = matches!(result, Err(MachineError::InvalidTransition(_)));
            prop_assert!(rejected);
            prop_assert_eq!(f.state.snapshot(), initial);
            prop_assert_eq!(f.store.count_machine_instance_events().unwrap(), 0);
        }
    }
}
