//! Node agent.
//!
//! Owns the collaborators shared by every machine on the node and the
//! registry of their controllers. Machines enter through
//! [`NodeAgent::place_machine`] or, after a restart, through
//! [`NodeAgent::boot`], and leave through the destroyed handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::MachineEvent;
use fleet_id::{MachineId, NodeId};
use tracing::{error, info, instrument, warn};

use crate::allocator::Allocator;
use crate::client::EventReporter;
use crate::cluster::ClusterStore;
use crate::config::LifecycleTimings;
use crate::driver::VmDriver;
use crate::error::MachineError;
use crate::machine::{
    ControllerDeps, DeliveryQueue, DestroyedHandler, Machine, MachineController,
    MachineInstanceState, MachineVersion,
};
use crate::registry::MachineRegistry;
use crate::state::{MachineRecord, StateStore, StateStoreError};

/// External collaborators of the agent.
#[derive(Clone)]
pub struct AgentServices {
    pub store: Arc<StateStore>,
    pub driver: Arc<dyn VmDriver>,
    pub allocator: Arc<dyn Allocator>,
    pub cluster: Arc<dyn ClusterStore>,
    pub reporter: Arc<dyn EventReporter>,
}

/// What [`NodeAgent::boot`] found in the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootReport {
    pub machines: usize,
    /// Undelivered events of restored machines.
    pub pending_events: usize,
    /// Undelivered events whose machine record is gone.
    pub orphaned_events: usize,
}

/// Releases everything a destroyed machine held on this node.
struct ReleaseOnDestroy {
    registry: Arc<MachineRegistry>,
    allocator: Arc<dyn Allocator>,
    store: Arc<StateStore>,
}

#[async_trait]
impl DestroyedHandler for ReleaseOnDestroy {
    async fn machine_destroyed(&self, machine: &Machine) {
        self.registry.remove(machine.id);

        if let Err(e) = self.allocator.delete_allocation(machine.id).await {
            warn!(machine_id = %machine.id, error = %e, "Failed to release allocation");
        }
        if let Err(e) = self.store.delete_machine_instance(machine.id) {
            warn!(machine_id = %machine.id, error = %e, "Failed to delete machine record");
        }

        info!(machine_id = %machine.id, "Machine released");
    }
}

pub struct NodeAgent {
    node_id: NodeId,
    services: AgentServices,
    registry: Arc<MachineRegistry>,
    on_destroyed: Arc<ReleaseOnDestroy>,
    timings: LifecycleTimings,
}

impl NodeAgent {
    pub fn new(node_id: NodeId, services: AgentServices, timings: LifecycleTimings) -> Self {
        let registry = Arc::new(MachineRegistry::new());
        let on_destroyed = Arc::new(ReleaseOnDestroy {
            registry: Arc::clone(&registry),
            allocator: Arc::clone(&services.allocator),
            store: Arc::clone(&services.store),
        });

        Self {
            node_id,
            services,
            registry,
            on_destroyed,
            timings,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn get(&self, machine_id: MachineId) -> Option<MachineController> {
        self.registry.get(machine_id)
    }

    fn controller_deps(&self) -> ControllerDeps {
        ControllerDeps {
            store: Arc::clone(&self.services.store),
            driver: Arc::clone(&self.services.driver),
            cluster: Arc::clone(&self.services.cluster),
            reporter: Arc::clone(&self.services.reporter),
            on_destroyed: Arc::clone(&self.on_destroyed) as Arc<dyn DestroyedHandler>,
            timings: self.timings,
        }
    }

    /// Rebuilds every machine from the local store and resumes it.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn boot(&self) -> Result<BootReport, MachineError> {
        let records = self.services.store.load_machine_instances()?;
        let events = self.services.store.load_machine_instance_events()?;

        let mut pending: HashMap<MachineId, Vec<MachineEvent>> = HashMap::new();
        for event in events {
            pending.entry(event.machine_id()).or_default().push(event);
        }

        let mut report = BootReport::default();
        let mut controllers = Vec::with_capacity(records.len());

        for record in records {
            let machine_id = record.machine.id;
            let Some(claim) = self.registry.claim(machine_id) else {
                // Its controller already owns the pending events.
                pending.remove(&machine_id);
                warn!(machine_id = %machine_id, "Machine already registered, not restoring");
                continue;
            };
            let controller = MachineController::spawn(
                record.machine,
                record.version,
                record.state,
                self.controller_deps(),
            );
            if let Some(events) = pending.remove(&machine_id) {
                report.pending_events += events.len();
                controller.restore_events(events);
            }
            claim.fill(controller.clone());
            controllers.push(controller);
            report.machines += 1;
        }

        // Machines already released still owe the control plane their events.
        for (machine_id, events) in pending {
            report.orphaned_events += events.len();
            let queue = DeliveryQueue::spawn(
                machine_id,
                Arc::clone(&self.services.reporter),
                Arc::clone(&self.services.store),
                self.timings.delivery_retry,
            );
            queue.restore(events);
            queue.close();
        }

        for controller in controllers {
            if let Err(e) = controller.recover().await {
                error!(machine_id = %controller.id(), error = %e, "Failed to recover machine");
            }
        }

        info!(
            node_id = %self.node_id,
            machines = report.machines,
            pending_events = report.pending_events,
            orphaned_events = report.orphaned_events,
            "Node agent booted"
        );
        Ok(report)
    }

    /// Takes ownership of a machine scheduled onto this node and prepares it.
    ///
    /// The machine's resources must have been reserved with the allocator.
    #[instrument(skip_all, fields(machine_id = %machine.id))]
    pub async fn place_machine(
        &self,
        machine: Machine,
        version: MachineVersion,
    ) -> Result<MachineController, MachineError> {
        if machine.node_id != self.node_id {
            return Err(MachineError::precondition(format!(
                "machine {} is scheduled on node {}, not {}",
                machine.id, machine.node_id, self.node_id
            )));
        }
        if version.machine_id != machine.id || version.id != machine.version_id {
            return Err(MachineError::precondition(format!(
                "version {} does not belong to machine {}",
                version.id, machine.id
            )));
        }
        let Some(claim) = self.registry.claim(machine.id) else {
            return Err(MachineError::precondition(format!(
                "machine {} is already placed",
                machine.id
            )));
        };

        self.services.allocator.confirm_allocation(machine.id).await?;

        let state = MachineInstanceState::new();
        let record = MachineRecord {
            machine: machine.clone(),
            version: version.clone(),
            state: state.clone(),
        };
        match self.services.store.create_machine_instance(&record) {
            Ok(()) => {}
            // The allocation belongs to the machine that owns the record.
            Err(e @ StateStoreError::AlreadyExists(_)) => return Err(e.into()),
            Err(e) => {
                if let Err(release) = self.services.allocator.delete_allocation(machine.id).await {
                    warn!(machine_id = %machine.id, error = %release, "Failed to release allocation");
                }
                return Err(e.into());
            }
        }

        info!(
            machine_id = %machine.id,
            instance_id = %machine.instance_id,
            image = %version.image_ref,
            "Placing machine"
        );

        let controller =
            MachineController::spawn(machine, version, state, self.controller_deps());
        claim.fill(controller.clone());
        controller.prepare().await?;
        Ok(controller)
    }
}
