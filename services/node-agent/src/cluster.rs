//! Cluster store contract.
//!
//! The cluster store is the shared, cluster-wide view of machine instances
//! read by other nodes and the control plane. The agent only ever upserts
//! the projection of machines it owns.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{DesiredStatus, MachineEvent, MachineStatus};
use fleet_id::{InstanceId, MachineId, NodeId, VersionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machine::{Machine, MachineInstanceState};

#[derive(Debug, Error)]
pub enum ClusterStoreError {
    #[error("cluster store unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Cluster-visible view of one machine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProjection {
    pub id: InstanceId,
    pub node_id: NodeId,
    pub namespace: String,
    pub machine_id: MachineId,
    pub version_id: VersionId,
    pub status: MachineStatus,
    pub desired_status: DesiredStatus,
    /// Recent lifecycle events, newest first.
    pub events: Vec<MachineEvent>,
    pub local_ipv4: Option<Ipv4Addr>,
    pub machine_gateway_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceProjection {
    pub fn new(machine: &Machine, state: &MachineInstanceState) -> Self {
        Self {
            id: machine.instance_id,
            node_id: machine.node_id,
            namespace: machine.namespace.clone(),
            machine_id: machine.id,
            version_id: machine.version_id,
            status: state.status(),
            desired_status: state.desired_status,
            events: state.events.to_vec(),
            local_ipv4: state.local_ipv4,
            machine_gateway_enabled: state.machine_gateway_enabled,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn upsert_instance(&self, projection: InstanceProjection)
        -> Result<(), ClusterStoreError>;
}

/// Cluster store kept in process memory.
#[derive(Default)]
pub struct InMemoryClusterStore {
    instances: RwLock<HashMap<InstanceId, InstanceProjection>>,
    unavailable: AtomicBool,
    upserts: AtomicUsize,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upsert fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, id: InstanceId) -> Option<InstanceProjection> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of upsert attempts, failed ones included.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn upsert_instance(
        &self,
        projection: InstanceProjection,
    ) -> Result<(), ClusterStoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterStoreError::Unavailable(
                "in-memory store disabled".to_string(),
            ));
        }

        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(projection.id, projection);
        Ok(())
    }
}
