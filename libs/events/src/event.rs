//! Machine lifecycle events and their payloads.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{EventId, InstanceId, MachineId};
use serde::{Deserialize, Serialize};

use crate::{EventOrigin, MachineEventType, MachineStatus};

// =============================================================================
// Stop Configuration
// =============================================================================

/// How to stop a running instance: the signal delivered to the workload and
/// how long to wait for it before forcing shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopConfig {
    pub signal: String,
    pub timeout_secs: u64,
}

impl StopConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            signal: "SIGINT".to_string(),
            timeout_secs: 5,
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Exit report of an instance's workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub exited_at: DateTime<Utc>,
    #[serde(default)]
    pub oom_killed: bool,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Type-specific data carried by a [`MachineEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MachineEventPayload {
    Prepare,
    Prepared {
        local_ipv4: Option<Ipv4Addr>,
    },
    PrepareFailed {
        error: String,
    },
    Start {
        is_restart: bool,
    },
    Started,
    StartFailed {
        error: String,
    },
    Stop {
        config: StopConfig,
    },
    StopFailed {
        error: String,
    },
    Exited(ExitInfo),
    Destroy {
        force: bool,
        auto_destroy: bool,
        reason: String,
    },
    Destroyed,
}

impl MachineEventPayload {
    pub fn event_type(&self) -> MachineEventType {
        match self {
            Self::Prepare => MachineEventType::Prepare,
            Self::Prepared { .. } => MachineEventType::Prepared,
            Self::PrepareFailed { .. } => MachineEventType::PrepareFailed,
            Self::Start { .. } => MachineEventType::Start,
            Self::Started => MachineEventType::Started,
            Self::StartFailed { .. } => MachineEventType::StartFailed,
            Self::Stop { .. } => MachineEventType::Stop,
            Self::StopFailed { .. } => MachineEventType::StopFailed,
            Self::Exited(_) => MachineEventType::Exited,
            Self::Destroy { .. } => MachineEventType::Destroy,
            Self::Destroyed => MachineEventType::Destroyed,
        }
    }
}

// =============================================================================
// Machine Event
// =============================================================================

/// An immutable lifecycle fact.
///
/// `status` is the status the machine holds once the event is applied, so a
/// consumer replaying history never needs the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEvent {
    id: EventId,
    machine_id: MachineId,
    instance_id: InstanceId,
    #[serde(rename = "type")]
    event_type: MachineEventType,
    origin: EventOrigin,
    status: MachineStatus,
    payload: MachineEventPayload,
    timestamp: DateTime<Utc>,
}

impl MachineEvent {
    pub fn new(
        machine_id: MachineId,
        instance_id: InstanceId,
        origin: EventOrigin,
        status: MachineStatus,
        payload: MachineEventPayload,
    ) -> Self {
        Self {
            id: EventId::new(),
            machine_id,
            instance_id,
            event_type: payload.event_type(),
            origin,
            status,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn event_type(&self) -> MachineEventType {
        self.event_type
    }

    pub fn origin(&self) -> EventOrigin {
        self.origin
    }

    /// Status after this event was applied.
    pub fn status(&self) -> MachineStatus {
        self.status
    }

    pub fn payload(&self) -> &MachineEventPayload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// True for `start` events issued by the restart policy.
    pub fn is_restart(&self) -> bool {
        matches!(self.payload, MachineEventPayload::Start { is_restart: true })
    }
}

impl fleet_fsm::Event for MachineEvent {
    type Kind = MachineEventType;

    fn kind(&self) -> MachineEventType {
        self.event_type
    }
}
