//! Recovery after an agent restart.
//!
//! Resumes a machine from its last persisted status alone. Nothing is
//! assumed about side effects that may or may not have completed before
//! the agent went down.

use fleet_events::{EventOrigin, MachineStatus};
use tracing::info;

use crate::error::MachineError;

use super::controller::MachineController;

impl MachineController {
    /// Resumes the lifecycle of a machine rebuilt from the local store.
    ///
    /// | persisted status     | action                                   |
    /// |----------------------|------------------------------------------|
    /// | created              | emit `prepare`                           |
    /// | preparing            | re-run the prepare side effect           |
    /// | stopped              | none                                     |
    /// | running              | watch the instance for exit              |
    /// | starting, stopping   | watch for exit and re-issue driver stop  |
    /// | destroying           | emit a forced `destroy`                  |
    /// | destroyed            | destroyed handler, after delivery drains |
    ///
    /// A machine caught in `starting` is stopped rather than verified: the
    /// driver reports the resulting exit and the exit policy takes over.
    pub async fn recover(&self) -> Result<(), MachineError> {
        let _guard = self.inner.lock.lock().await;
        let status = self.status();
        info!(machine_id = %self.id(), status = %status, "Recovering machine");

        match status {
            MachineStatus::Created => {
                self.inner.state.prepare(EventOrigin::System)?;
            }
            MachineStatus::Preparing => self.spawn_prepare(),
            MachineStatus::Stopped => {}
            MachineStatus::Running => self.watch_exit(),
            MachineStatus::Starting | MachineStatus::Stopping => {
                self.watch_exit();
                self.spawn_stop(self.inner.version.stop_config.clone());
            }
            MachineStatus::Destroying => {
                self.inner.state.destroy(
                    EventOrigin::System,
                    true,
                    false,
                    "resuming interrupted destroy",
                )?;
            }
            MachineStatus::Destroyed => {
                let this = self.clone();
                tokio::spawn(async move { this.finish_destroy().await });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_events::{DesiredStatus, MachineEventType};

    use crate::driver::{DriverOp, VmDriver};
    use crate::machine::testing::{harness_with, state_with, version};
    use crate::machine::RestartPolicy;

    use super::*;

    const WAIT: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_recover_preparing_runs_prepare_once() {
        let h = harness_with(
            version(RestartPolicy::Always, false),
            state_with(MachineStatus::Preparing, DesiredStatus::Running),
        )
        .await;

        h.controller.recover().await.unwrap();
        h.controller
            .wait_for_status(MachineStatus::Running, WAIT)
            .await
            .unwrap();

        assert_eq!(h.driver.count(DriverOp::PullImage), 1);
        assert_eq!(h.driver.count(DriverOp::CreateInstance), 1);
        let types: Vec<_> = h
            .controller
            .snapshot()
            .events
            .iter()
            .rev()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(
            types,
            vec![
                MachineEventType::Prepared,
                MachineEventType::Start,
                MachineEventType::Started
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_created_emits_prepare() {
        let h = harness_with(
            version(RestartPolicy::Always, false),
            state_with(MachineStatus::Created, DesiredStatus::Running),
        )
        .await;

        h.controller.recover().await.unwrap();
        h.controller
            .wait_for_status(MachineStatus::Running, WAIT)
            .await
            .unwrap();
        assert_eq!(
            h.controller.snapshot().events.oldest().unwrap().event_type(),
            MachineEventType::Prepare
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_stopped_does_nothing() {
        let h = harness_with(
            version(RestartPolicy::Always, false),
            state_with(MachineStatus::Stopped, DesiredStatus::Stopped),
        )
        .await;

        h.controller.recover().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.controller.status(), MachineStatus::Stopped);
        assert!(h.driver.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_starting_reissues_stop() {
        let v = version(RestartPolicy::Never, false);
        let h = harness_with(v.clone(), state_with(MachineStatus::Starting, DesiredStatus::Running)).await;

        // The instance made it to running before the agent went down.
        let instance_id = h.controller.machine().instance_id;
        h.driver.create_instance(h.controller.machine(), &v).await.unwrap();
        h.driver.start(instance_id).await.unwrap();

        h.controller.recover().await.unwrap();
        h.controller
            .wait_for_status(MachineStatus::Stopped, WAIT)
            .await
            .unwrap();

        assert_eq!(h.driver.count(DriverOp::Stop), 1);
        assert!(!h.driver.is_running(instance_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_destroying_completes_destroy() {
        let h = harness_with(
            version(RestartPolicy::Always, false),
            state_with(MachineStatus::Destroying, DesiredStatus::Destroyed),
        )
        .await;

        h.controller.recover().await.unwrap();
        h.destroyed.wait_for(h.controller.id()).await;

        assert_eq!(h.controller.status(), MachineStatus::Destroyed);
        // Instance already gone: not-found counts as destroyed.
        assert_eq!(h.driver.count(DriverOp::Destroy), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_destroyed_invokes_handler_without_driver() {
        let h = harness_with(
            version(RestartPolicy::Always, false),
            state_with(MachineStatus::Destroyed, DesiredStatus::Destroyed),
        )
        .await;

        h.controller.recover().await.unwrap();
        h.destroyed.wait_for(h.controller.id()).await;
        assert_eq!(h.destroyed.ids(), vec![h.controller.id()]);
        assert!(h.driver.calls().is_empty());
    }
}
