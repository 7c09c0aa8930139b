//! Exit handling policy.
//!
//! Decides what happens after a machine's workload exits, from the machine
//! version's restart policy, its auto-destroy flag and the state at the
//! moment of the exit. Pure: the controller applies the decision.

use std::time::Duration;

use fleet_events::{DesiredStatus, ExitInfo, MachineStatus};

use crate::config::LifecycleTimings;

use super::model::{MachineInstanceState, MachineVersion, RestartPolicy};

/// Follow-up to an `exited` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
    /// Destroy the machine (forced, marked as auto-destroy).
    Destroy { reason: String },
    /// Start the machine again after `delay`.
    Restart { delay: Duration },
    /// Leave the machine stopped and record that as the desired status.
    MarkStopped,
    /// Nothing to do.
    Nothing,
}

pub fn decide_exit(
    version: &MachineVersion,
    state: &MachineInstanceState,
    exit: &ExitInfo,
    timings: &LifecycleTimings,
) -> ExitDecision {
    if matches!(
        state.status(),
        MachineStatus::Destroying | MachineStatus::Destroyed
    ) || state.desired_status == DesiredStatus::Destroyed
    {
        return ExitDecision::Nothing;
    }

    let restarts = state.restarts;
    let retries_exhausted = |max: u32| restarts >= max;

    if version.auto_destroy {
        if exit.success() {
            return ExitDecision::Destroy {
                reason: "successful exit".to_string(),
            };
        }
        return match version.restart {
            RestartPolicy::Never => ExitDecision::Destroy {
                reason: "failed exit".to_string(),
            },
            RestartPolicy::OnFailure { max_retries } if retries_exhausted(max_retries) => {
                ExitDecision::Destroy {
                    reason: "failed exit".to_string(),
                }
            }
            _ => ExitDecision::Restart {
                delay: timings.auto_destroy_restart_step * restarts,
            },
        };
    }

    if state.desired_status != DesiredStatus::Running {
        return ExitDecision::Nothing;
    }

    match version.restart {
        RestartPolicy::Never => ExitDecision::MarkStopped,
        RestartPolicy::OnFailure { .. } if exit.success() => ExitDecision::MarkStopped,
        RestartPolicy::OnFailure { max_retries } if retries_exhausted(max_retries) => {
            ExitDecision::MarkStopped
        }
        RestartPolicy::OnFailure { .. } | RestartPolicy::Always => ExitDecision::Restart {
            delay: if restarts == 0 {
                timings.first_restart
            } else {
                timings.restart
            },
        },
    }
}
