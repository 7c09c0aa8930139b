//! Status and event-type enums.

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Machine Status
// =============================================================================

/// Authoritative lifecycle status of a machine on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Created,
    Preparing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Destroying,
    Destroyed,
}

impl MachineStatus {
    pub const ALL: [MachineStatus; 8] = [
        MachineStatus::Created,
        MachineStatus::Preparing,
        MachineStatus::Stopped,
        MachineStatus::Starting,
        MachineStatus::Running,
        MachineStatus::Stopping,
        MachineStatus::Destroying,
        MachineStatus::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preparing => "preparing",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }

    /// `destroyed` accepts no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// Whether imperative operations (start, stop, exec, ...) may be
    /// attempted at all.
    pub fn is_operable(&self) -> bool {
        !matches!(
            self,
            Self::Created | Self::Preparing | Self::Destroying | Self::Destroyed
        )
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MachineStatus {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EventError::UnknownStatus(s.to_string()))
    }
}

// =============================================================================
// Desired Status
// =============================================================================

/// Operator intent the controller converges `status` toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    #[default]
    Running,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredStatus::Running => f.write_str("running"),
            DesiredStatus::Stopped => f.write_str("stopped"),
            DesiredStatus::Destroyed => f.write_str("destroyed"),
        }
    }
}

// =============================================================================
// Event Origin
// =============================================================================

/// Who caused a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// An API call made on behalf of a user.
    User,
    /// The agent itself (driver callbacks, restart policy, recovery).
    #[default]
    System,
}

impl std::fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventOrigin::User => f.write_str("user"),
            EventOrigin::System => f.write_str("system"),
        }
    }
}

// =============================================================================
// Event Types
// =============================================================================

/// Lifecycle transition names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineEventType {
    Prepare,
    Prepared,
    PrepareFailed,
    Start,
    Started,
    StartFailed,
    Stop,
    StopFailed,
    Exited,
    Destroy,
    Destroyed,
}

impl MachineEventType {
    pub const ALL: [MachineEventType; 11] = [
        MachineEventType::Prepare,
        MachineEventType::Prepared,
        MachineEventType::PrepareFailed,
        MachineEventType::Start,
        MachineEventType::Started,
        MachineEventType::StartFailed,
        MachineEventType::Stop,
        MachineEventType::StopFailed,
        MachineEventType::Exited,
        MachineEventType::Destroy,
        MachineEventType::Destroyed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Prepared => "prepared",
            Self::PrepareFailed => "prepare_failed",
            Self::Start => "start",
            Self::Started => "started",
            Self::StartFailed => "start_failed",
            Self::Stop => "stop",
            Self::StopFailed => "stop_failed",
            Self::Exited => "exited",
            Self::Destroy => "destroy",
            Self::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for MachineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MachineEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}
