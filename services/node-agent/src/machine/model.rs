//! Machine identity, versions and the mutable instance record.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use fleet_events::{DesiredStatus, EventHistory, MachineEvent, MachineStatus, StopConfig};
use fleet_id::{FleetId, InstanceId, MachineId, NodeId, VersionId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identity and configuration
// =============================================================================

/// Local cached copy of a machine's identity. Owned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub namespace: String,
    pub fleet_id: FleetId,
    pub region: String,
    /// Version referenced by the current instance.
    pub version_id: VersionId,
    pub node_id: NodeId,
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestResources {
    pub cpus: u32,
    pub memory_mb: u64,
}

/// What to do when the workload exits on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    OnFailure { max_retries: u32 },
    Always,
}

/// Overrides of the image's entrypoint for the guest init.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<Vec<String>>,
}

/// Immutable configuration snapshot a machine's instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineVersion {
    pub id: VersionId,
    pub machine_id: MachineId,
    pub image_ref: String,
    pub guest: GuestResources,
    pub restart: RestartPolicy,
    /// Destroy the machine when its workload exits instead of keeping it.
    #[serde(default)]
    pub auto_destroy: bool,
    #[serde(default)]
    pub stop_config: StopConfig,
    #[serde(default)]
    pub init: InitOverrides,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// =============================================================================
// Instance state
// =============================================================================

/// Mutable lifecycle record of a machine's instance.
///
/// `status` is only ever stamped from a validated lifecycle event; it has
/// no public setter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInstanceState {
    pub(super) status: MachineStatus,
    pub desired_status: DesiredStatus,
    /// Automatic restarts since the last explicit start or stop.
    pub restarts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub local_ipv4: Option<Ipv4Addr>,
    pub machine_gateway_enabled: bool,
    /// Most recent lifecycle events, newest first.
    pub events: EventHistory,
}

impl MachineInstanceState {
    /// State of a machine freshly placed on this node.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            status: MachineStatus::Created,
            desired_status: DesiredStatus::Running,
            restarts: 0,
            created_at: now,
            updated_at: now,
            local_ipv4: None,
            machine_gateway_enabled: false,
            events: EventHistory::new(),
        }
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    /// Records a committed event: status and `updated_at` come from the event.
    pub(super) fn stamp(&mut self, event: &MachineEvent) {
        self.status = event.status();
        self.updated_at = event.timestamp();
        self.events.record(event.clone());
    }
}

impl Default for MachineInstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl fleet_fsm::State for MachineInstanceState {
    fn label(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.status.as_str())
    }
}
