//! Per-machine lifecycle.
//!
//! - [`model`]: machine identity, version and instance state
//! - [`state`]: lifecycle transition table and typed event constructors
//! - [`policy`]: what to do after a workload exits
//! - [`delivery`]: ordered, at-least-once event delivery upstream
//! - [`sync`]: cluster store projection
//! - [`controller`]: imperative API and event loop
//! - [`recovery`]: resuming a machine after an agent restart

pub mod controller;
pub mod delivery;
pub mod model;
pub mod policy;
mod recovery;
pub mod state;
pub mod sync;

pub use controller::{ControllerDeps, DestroyedHandler, MachineController};
pub use delivery::DeliveryQueue;
pub use model::{
    GuestResources, InitOverrides, Machine, MachineInstanceState, MachineVersion, RestartPolicy,
};
pub use policy::{decide_exit, ExitDecision};
pub use state::MachineState;
pub use sync::MachineSync;

#[cfg(test)]
pub(crate) mod testing {
    //! Controller fixtures backed by the in-memory collaborators.

    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;
    use fleet_events::{DesiredStatus, MachineStatus, StopConfig};
    use fleet_id::{FleetId, InstanceId, MachineId, NodeId, VersionId};
    use tokio::sync::Notify;

    use super::*;
    use crate::client::InMemoryReporter;
    use crate::cluster::InMemoryClusterStore;
    use crate::config::LifecycleTimings;
    use crate::driver::MockDriver;
    use crate::state::{MachineRecord, StateStore};

    /// Records destroyed machines.
    #[derive(Default)]
    pub struct RecordingHandler {
        destroyed: Mutex<Vec<MachineId>>,
        notify: Notify,
    }

    impl RecordingHandler {
        pub fn ids(&self) -> Vec<MachineId> {
            self.destroyed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub async fn wait_for(&self, machine_id: MachineId) {
            loop {
                let notified = self.notify.notified();
                if self.ids().contains(&machine_id) {
                    return;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl DestroyedHandler for RecordingHandler {
        async fn machine_destroyed(&self, machine: &Machine) {
            self.destroyed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(machine.id);
            self.notify.notify_waiters();
        }
    }

    pub struct Harness {
        pub controller: MachineController,
        pub driver: Arc<MockDriver>,
        pub store: Arc<StateStore>,
        pub reporter: Arc<InMemoryReporter>,
        pub cluster: Arc<InMemoryClusterStore>,
        pub destroyed: Arc<RecordingHandler>,
    }

    pub fn timings() -> LifecycleTimings {
        LifecycleTimings {
            delivery_retry: Duration::from_millis(100),
            sync_retry: Duration::from_millis(500),
            first_restart: Duration::from_secs(1),
            restart: Duration::from_secs(5),
            auto_destroy_restart_step: Duration::from_secs(5),
        }
    }

    pub fn machine() -> Machine {
        Machine {
            id: MachineId::new(),
            namespace: "default".to_string(),
            fleet_id: FleetId::new(),
            region: "local".to_string(),
            version_id: VersionId::new(),
            node_id: NodeId::new(),
            instance_id: InstanceId::new(),
        }
    }

    pub fn version(restart: RestartPolicy, auto_destroy: bool) -> MachineVersion {
        MachineVersion {
            id: VersionId::new(),
            machine_id: MachineId::new(),
            image_ref: "registry.local/app:v1".to_string(),
            guest: GuestResources {
                cpus: 1,
                memory_mb: 256,
            },
            restart,
            auto_destroy,
            stop_config: StopConfig::default(),
            init: InitOverrides::default(),
            env: Default::default(),
        }
    }

    pub fn state_with(status: MachineStatus, desired: DesiredStatus) -> MachineInstanceState {
        let mut state = MachineInstanceState::new();
        state.status = status;
        state.desired_status = desired;
        state
    }

    pub async fn harness(version: MachineVersion) -> Harness {
        harness_with(version, MachineInstanceState::new()).await
    }

    pub async fn harness_with(version: MachineVersion, state: MachineInstanceState) -> Harness {
        let mut machine = machine();
        machine.version_id = version.id;
        let version = MachineVersion {
            machine_id: machine.id,
            ..version
        };

        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store
            .create_machine_instance(&MachineRecord {
                machine: machine.clone(),
                version: version.clone(),
                state: state.clone(),
            })
            .unwrap();

        let driver = Arc::new(MockDriver::new());
        let reporter = Arc::new(InMemoryReporter::new());
        let cluster = Arc::new(InMemoryClusterStore::new());
        let destroyed = Arc::new(RecordingHandler::default());

        let deps = ControllerDeps {
            store: Arc::clone(&store),
            driver: Arc::clone(&driver) as _,
            cluster: Arc::clone(&cluster) as _,
            reporter: Arc::clone(&reporter) as _,
            on_destroyed: Arc::clone(&destroyed) as _,
            timings: timings(),
        };

        Harness {
            controller: MachineController::spawn(machine, version, state, deps),
            driver,
            store,
            reporter,
            cluster,
            destroyed,
        }
    }
}
