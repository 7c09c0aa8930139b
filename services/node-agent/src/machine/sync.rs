//! Cluster store synchronization.
//!
//! Pushes the latest projection of one machine to the cluster store each
//! time the sync trigger fires. Mutations between two wake-ups coalesce
//! into one upsert; the loop ends once `destroyed` has been pushed.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::MachineStatus;
use fleet_reconcile::{ConvergenceStatus, Reconcile, ReconcileError};
use tokio::sync::watch;

use crate::cluster::{ClusterStore, ClusterStoreError, InstanceProjection};

use super::model::{Machine, MachineInstanceState};

pub struct MachineSync {
    machine: Machine,
    state: watch::Receiver<MachineInstanceState>,
    cluster: Arc<dyn ClusterStore>,
}

impl MachineSync {
    pub fn new(
        machine: Machine,
        state: watch::Receiver<MachineInstanceState>,
        cluster: Arc<dyn ClusterStore>,
    ) -> Self {
        Self {
            machine,
            state,
            cluster,
        }
    }
}

#[async_trait]
impl Reconcile for MachineSync {
    fn name(&self) -> String {
        format!("machine-sync/{}", self.machine.id)
    }

    async fn reconcile(&self) -> Result<ConvergenceStatus, ReconcileError> {
        let projection = InstanceProjection::new(&self.machine, &self.state.borrow());
        let status = projection.status;

        self.cluster
            .upsert_instance(projection)
            .await
            .map_err(|e| match e {
                ClusterStoreError::Unavailable(msg) => ReconcileError::Unavailable(msg),
                ClusterStoreError::Rejected(msg) => ReconcileError::Rejected(msg),
            })?;

        if status == MachineStatus::Destroyed {
            Ok(ConvergenceStatus::Terminal)
        } else {
            Ok(ConvergenceStatus::Converged)
        }
    }
}
