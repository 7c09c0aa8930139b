//! Machine controller.
//!
//! The controller is the single point of serialization for one machine.
//! Imperative operations and the event loop take the same per-machine lock
//! before pushing events, while driver calls run on separate tasks without
//! it, so a slow VM start never keeps another caller from being rejected.
//!
//! ## Event loop
//!
//! Every committed event is dispatched to at most one side effect:
//!
//! ```text
//! prepare        -> pull image + create instance -> prepared | prepare_failed
//! prepared       -> start (when desired running)
//! prepare_failed -> forced destroy
//! start          -> driver start                 -> started | start_failed
//! started        -> watch for exit               -> exited
//! exited         -> exit policy                  -> restart | destroy | mark stopped
//! stop           -> driver stop                  -> (exit) | stop_failed
//! destroy        -> driver destroy               -> destroyed
//! destroyed      -> drain delivery, destroyed handler, loop ends
//! ```
//!
//! Side-effect outcomes re-enter the lifecycle as new events; they are never
//! returned to the caller of the original operation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_events::{
    DesiredStatus, EventOrigin, ExitInfo, MachineEvent, MachineEventPayload, MachineStatus,
    StopConfig,
};
use fleet_id::{InstanceId, MachineId};
use fleet_reconcile::run_sync_loop;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::client::EventReporter;
use crate::cluster::ClusterStore;
use crate::config::LifecycleTimings;
use crate::driver::{DriverError, ExecOutput, InstanceStateUpdate, LogEntries, LogEntry, VmDriver};
use crate::error::MachineError;
use crate::state::StateStore;

use super::delivery::DeliveryQueue;
use super::model::{Machine, MachineInstanceState, MachineVersion};
use super::policy::{decide_exit, ExitDecision};
use super::state::{MachineHooks, MachineState};
use super::sync::MachineSync;

/// Notified once a machine reached `destroyed` and its events were delivered.
#[async_trait]
pub trait DestroyedHandler: Send + Sync {
    async fn machine_destroyed(&self, machine: &Machine);
}

/// Collaborators shared by every controller on the node.
#[derive(Clone)]
pub struct ControllerDeps {
    pub store: Arc<StateStore>,
    pub driver: Arc<dyn VmDriver>,
    pub cluster: Arc<dyn ClusterStore>,
    pub reporter: Arc<dyn EventReporter>,
    pub on_destroyed: Arc<dyn DestroyedHandler>,
    pub timings: LifecycleTimings,
}

#[derive(Default)]
struct Tasks {
    pending_restart: Option<JoinHandle<()>>,
    exit_watch: Option<JoinHandle<()>>,
}

pub(super) struct Inner {
    pub(super) version: MachineVersion,
    pub(super) state: MachineState,
    pub(super) lock: tokio::sync::Mutex<()>,
    driver: Arc<dyn VmDriver>,
    on_destroyed: Arc<dyn DestroyedHandler>,
    timings: LifecycleTimings,
    delivery: DeliveryQueue,
    tasks: Mutex<Tasks>,
    terminated: Notify,
}

/// Handle on one machine's controller. Cheap to clone.
#[derive(Clone)]
pub struct MachineController {
    pub(super) inner: Arc<Inner>,
}

impl fmt::Debug for MachineController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineController")
            .field("machine_id", &format_args!("{}", self.id()))
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl MachineController {
    /// Builds the controller around `state` and starts its event loop,
    /// delivery worker and sync loop.
    pub fn spawn(
        machine: Machine,
        version: MachineVersion,
        state: MachineInstanceState,
        deps: ControllerDeps,
    ) -> Self {
        let delivery = DeliveryQueue::spawn(
            machine.id,
            deps.reporter,
            Arc::clone(&deps.store),
            deps.timings.delivery_retry,
        );
        let (sync_trigger, sync_listener) = fleet_reconcile::trigger();
        let (committed_tx, committed_rx) = mpsc::unbounded_channel();

        // Publish the restored state once, even if nothing changes.
        sync_trigger.notify();

        let hooks = MachineHooks {
            machine_id: machine.id,
            store: deps.store,
            delivery: delivery.clone(),
            sync: sync_trigger,
            committed: committed_tx,
        };
        let machine_state = MachineState::new(machine.clone(), state, hooks);

        let sync = MachineSync::new(machine, machine_state.subscribe(), deps.cluster);
        tokio::spawn(run_sync_loop(sync, sync_listener, deps.timings.sync_retry));

        let controller = Self {
            inner: Arc::new(Inner {
                version,
                state: machine_state,
                lock: tokio::sync::Mutex::new(()),
                driver: deps.driver,
                on_destroyed: deps.on_destroyed,
                timings: deps.timings,
                delivery,
                tasks: Mutex::new(Tasks::default()),
                terminated: Notify::new(),
            }),
        };

        tokio::spawn(controller.clone().run_events(committed_rx));
        controller
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> MachineId {
        self.machine().id
    }

    pub fn machine(&self) -> &Machine {
        self.inner.state.machine()
    }

    pub fn version(&self) -> &MachineVersion {
        &self.inner.version
    }

    fn instance_id(&self) -> InstanceId {
        self.machine().instance_id
    }

    pub fn snapshot(&self) -> MachineInstanceState {
        self.inner.state.snapshot()
    }

    pub fn status(&self) -> MachineStatus {
        self.inner.state.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineInstanceState> {
        self.inner.state.subscribe()
    }

    /// Events not yet acknowledged by the control plane.
    pub fn pending_deliveries(&self) -> usize {
        self.inner.delivery.len()
    }

    /// Queues events persisted by a previous run ahead of new ones.
    pub fn restore_events(&self, events: Vec<MachineEvent>) {
        self.inner.delivery.restore(events);
    }

    pub fn has_pending_restart(&self) -> bool {
        self.tasks()
            .pending_restart
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails unless the machine accepts imperative operations.
    fn ensure_operable(&self) -> Result<MachineInstanceState, MachineError> {
        let state = self.snapshot();
        if !state.status().is_operable() {
            return Err(MachineError::precondition(format!(
                "machine {} is {}",
                self.id(),
                state.status()
            )));
        }
        Ok(state)
    }

    // =========================================================================
    // Imperative API
    // =========================================================================

    /// Emits `prepare` for a freshly placed machine.
    pub async fn prepare(&self) -> Result<(), MachineError> {
        let _guard = self.inner.lock.lock().await;
        self.inner.state.prepare(EventOrigin::System)?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), MachineError> {
        let _guard = self.inner.lock.lock().await;
        let state = self.ensure_operable()?;
        if state.status() != MachineStatus::Stopped {
            return Err(MachineError::precondition(format!(
                "machine {} is {}, not stopped",
                self.id(),
                state.status()
            )));
        }

        info!(machine_id = %self.id(), "Starting machine");
        self.cancel_restart();
        self.inner.state.start(EventOrigin::User, false)?;
        Ok(())
    }

    /// Stops the machine with `config`, or the version's stop config.
    ///
    /// On a stopped machine waiting for an automatic restart, cancels the
    /// restart instead.
    pub async fn stop(&self, config: Option<StopConfig>) -> Result<(), MachineError> {
        let _guard = self.inner.lock.lock().await;
        let state = self.ensure_operable()?;

        match state.status() {
            MachineStatus::Stopped if state.desired_status == DesiredStatus::Running => {
                info!(machine_id = %self.id(), "Cancelling pending restart");
                self.cancel_restart();
                self.inner.state.set_desired_status(DesiredStatus::Stopped)?;
                Ok(())
            }
            MachineStatus::Running | MachineStatus::Stopping => {
                let config = config.unwrap_or_else(|| self.inner.version.stop_config.clone());
                info!(
                    machine_id = %self.id(),
                    signal = %config.signal,
                    timeout_secs = config.timeout_secs,
                    "Stopping machine"
                );
                self.cancel_restart();
                self.inner.state.stop(EventOrigin::User, config)?;
                Ok(())
            }
            status => Err(MachineError::precondition(format!(
                "machine {} is {}, not running",
                self.id(),
                status
            ))),
        }
    }

    /// Destroys the machine. A running machine requires `force`.
    pub async fn destroy(&self, force: bool) -> Result<(), MachineError> {
        let _guard = self.inner.lock.lock().await;
        let state = self.ensure_operable()?;

        match state.status() {
            MachineStatus::Stopped => {}
            MachineStatus::Running if force => {}
            MachineStatus::Running => {
                return Err(MachineError::precondition(format!(
                    "machine {} is running, destroy requires force",
                    self.id()
                )));
            }
            status => {
                return Err(MachineError::precondition(format!(
                    "machine {} is {}",
                    self.id(),
                    status
                )));
            }
        }

        info!(machine_id = %self.id(), force, "Destroying machine");
        self.cancel_restart();
        self.inner
            .state
            .destroy(EventOrigin::User, force, false, "user requested")?;
        Ok(())
    }

    pub async fn exec(&self, cmd: Vec<String>, timeout: Duration) -> Result<ExecOutput, MachineError> {
        {
            let _guard = self.inner.lock.lock().await;
            let state = self.ensure_operable()?;
            if state.status() != MachineStatus::Running {
                return Err(MachineError::precondition(format!(
                    "machine {} is {}, not running",
                    self.id(),
                    state.status()
                )));
            }
        }

        debug!(machine_id = %self.id(), cmd = ?cmd, "Executing command");
        match tokio::time::timeout(timeout, self.inner.driver.exec(self.instance_id(), &cmd, timeout))
            .await
        {
            Ok(output) => Ok(output?),
            Err(_) => Err(MachineError::DeadlineExceeded(format!(
                "exec in machine {} timed out after {:?}",
                self.id(),
                timeout
            ))),
        }
    }

    pub async fn get_logs(&self) -> Result<Vec<LogEntry>, MachineError> {
        {
            let _guard = self.inner.lock.lock().await;
            self.ensure_operable()?;
        }
        Ok(self.inner.driver.get_logs(self.instance_id()).await?)
    }

    pub async fn subscribe_logs(&self) -> Result<LogEntries, MachineError> {
        {
            let _guard = self.inner.lock.lock().await;
            self.ensure_operable()?;
        }
        Ok(self.inner.driver.subscribe_logs(self.instance_id()).await?)
    }

    pub async fn enable_gateway(&self) -> Result<(), MachineError> {
        self.set_gateway(true).await
    }

    pub async fn disable_gateway(&self) -> Result<(), MachineError> {
        self.set_gateway(false).await
    }

    async fn set_gateway(&self, enabled: bool) -> Result<(), MachineError> {
        let _guard = self.inner.lock.lock().await;
        self.ensure_operable()?;
        self.inner.state.set_gateway(enabled)?;
        info!(machine_id = %self.id(), enabled, "Machine gateway toggled");
        Ok(())
    }

    /// Waits until the machine reaches `status`.
    ///
    /// Fails with a precondition error if the machine reaches `destroyed`
    /// first, and with `DeadlineExceeded` after `timeout`.
    pub async fn wait_for_status(
        &self,
        status: MachineStatus,
        timeout: Duration,
    ) -> Result<MachineInstanceState, MachineError> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.status() == status || s.status().is_terminal()),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => state.clone(),
            Ok(Err(_)) => {
                return Err(MachineError::Internal(format!(
                    "state of machine {} is no longer observable",
                    self.id()
                )));
            }
            Err(_) => {
                return Err(MachineError::DeadlineExceeded(format!(
                    "machine {} did not reach {} within {:?}",
                    self.id(),
                    status,
                    timeout
                )));
            }
        };

        if state.status() == status {
            Ok(state)
        } else {
            Err(MachineError::precondition(format!(
                "machine {} is {} and will never be {}",
                self.id(),
                state.status(),
                status
            )))
        }
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    async fn run_events(self, mut committed: mpsc::UnboundedReceiver<MachineEvent>) {
        debug!(machine_id = %self.id(), "Event loop started");

        loop {
            tokio::select! {
                event = committed.recv() => {
                    let Some(event) = event else { break };
                    if !self.dispatch(event).await {
                        break;
                    }
                }
                _ = self.inner.terminated.notified() => break,
            }
        }

        debug!(machine_id = %self.id(), "Event loop stopped");
    }

    /// Runs the side effect of one committed event. Returns `false` once
    /// the machine is gone.
    async fn dispatch(&self, event: MachineEvent) -> bool {
        match event.payload() {
            MachineEventPayload::Prepare => self.spawn_prepare(),
            MachineEventPayload::Prepared { .. } => {
                let _guard = self.inner.lock.lock().await;
                let state = self.snapshot();
                if state.desired_status == DesiredStatus::Running
                    && state.status() == MachineStatus::Stopped
                {
                    self.log_push("start", self.inner.state.start(EventOrigin::System, false));
                }
            }
            MachineEventPayload::PrepareFailed { error } => {
                let _guard = self.inner.lock.lock().await;
                let reason = format!("prepare failed: {error}");
                self.log_push(
                    "destroy",
                    self.inner.state.destroy(EventOrigin::System, true, false, reason),
                );
            }
            MachineEventPayload::Start { .. } => self.spawn_start(),
            MachineEventPayload::Started => self.watch_exit(),
            MachineEventPayload::StartFailed { error } => {
                warn!(machine_id = %self.id(), error = %error, "Machine failed to start");
            }
            MachineEventPayload::Stop { config } => self.spawn_stop(config.clone()),
            MachineEventPayload::StopFailed { error } => {
                warn!(machine_id = %self.id(), error = %error, "Machine failed to stop");
            }
            MachineEventPayload::Exited(exit) => self.handle_exit(exit).await,
            MachineEventPayload::Destroy { .. } => {
                self.cancel_restart();
                self.spawn_destroy();
            }
            MachineEventPayload::Destroyed => {
                self.finish_destroy().await;
                return false;
            }
        }
        true
    }

    fn log_push(&self, event: &str, result: Result<MachineEvent, MachineError>) {
        if let Err(e) = result {
            warn!(machine_id = %self.id(), event, error = %e, "Failed to push event");
        }
    }

    pub(super) fn spawn_prepare(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let driver = &this.inner.driver;
            let version = &this.inner.version;

            info!(machine_id = %this.id(), image = %version.image_ref, "Preparing machine");
            let prepared = match driver.pull_image(&version.image_ref).await {
                Ok(()) => driver.create_instance(this.machine(), version).await,
                Err(e) => Err(e),
            };

            let _guard = this.inner.lock.lock().await;
            match prepared {
                Ok(info) => this.log_push("prepared", this.inner.state.prepared(info.local_ipv4)),
                Err(e) => {
                    warn!(machine_id = %this.id(), error = %e, "Prepare failed");
                    this.log_push("prepare_failed", this.inner.state.prepare_failed(e.to_string()));
                }
            }
        });
    }

    fn spawn_start(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let started = this.inner.driver.start(this.instance_id()).await;

            let _guard = this.inner.lock.lock().await;
            match started {
                Ok(()) => this.log_push("started", this.inner.state.started()),
                Err(e) => {
                    warn!(machine_id = %this.id(), error = %e, "Driver start failed");
                    this.log_push("start_failed", this.inner.state.start_failed(e.to_string()));
                }
            }
        });
    }

    pub(super) fn spawn_stop(&self, config: StopConfig) {
        let this = self.clone();
        tokio::spawn(async move {
            // Success is observed by the exit watcher.
            if let Err(e) = this.inner.driver.stop(this.instance_id(), &config).await {
                warn!(machine_id = %this.id(), error = %e, "Driver stop failed");
                let _guard = this.inner.lock.lock().await;
                this.log_push("stop_failed", this.inner.state.stop_failed(e.to_string()));
            }
        });
    }

    fn spawn_destroy(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.inner.driver.destroy(this.instance_id()).await {
                Ok(()) | Err(DriverError::NotFound(_)) => {}
                Err(e) => {
                    warn!(machine_id = %this.id(), error = %e, "Driver destroy failed, continuing");
                }
            }

            let _guard = this.inner.lock.lock().await;
            if let Some(watch) = this.tasks().exit_watch.take() {
                watch.abort();
            }
            this.log_push("destroyed", this.inner.state.destroyed());
        });
    }

    // =========================================================================
    // Exit handling
    // =========================================================================

    /// Watches the instance until its workload exits, replacing any
    /// previous watcher.
    pub(super) fn watch_exit(&self) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_exit_watch().await });
        if let Some(previous) = self.tasks().exit_watch.replace(handle) {
            previous.abort();
        }
    }

    async fn run_exit_watch(&self) {
        let mut updates = match self.inner.driver.watch_state(self.instance_id()).await {
            Ok(updates) => updates,
            Err(DriverError::NotFound(_)) => {
                warn!(machine_id = %self.id(), "Instance lost, reporting exit");
                self.push_exited(ExitInfo {
                    exit_code: -1,
                    exited_at: Utc::now(),
                    oom_killed: false,
                })
                .await;
                return;
            }
            Err(e) => {
                warn!(machine_id = %self.id(), error = %e, "Failed to watch instance");
                return;
            }
        };

        while let Some(update) = updates.next().await {
            match update {
                InstanceStateUpdate::Running => continue,
                InstanceStateUpdate::Exited(exit) => {
                    info!(
                        machine_id = %self.id(),
                        exit_code = exit.exit_code,
                        oom_killed = exit.oom_killed,
                        "Machine exited"
                    );
                    self.push_exited(exit).await;
                    return;
                }
            }
        }
        debug!(machine_id = %self.id(), "Instance state stream ended");
    }

    async fn push_exited(&self, exit: ExitInfo) {
        let _guard = self.inner.lock.lock().await;
        self.log_push("exited", self.inner.state.exited(exit));
    }

    async fn handle_exit(&self, exit: &ExitInfo) {
        let _guard = self.inner.lock.lock().await;
        let state = self.snapshot();

        match decide_exit(&self.inner.version, &state, exit, &self.inner.timings) {
            ExitDecision::Destroy { reason } => {
                info!(machine_id = %self.id(), reason = %reason, "Auto-destroying machine");
                self.log_push(
                    "destroy",
                    self.inner.state.destroy(EventOrigin::System, true, true, reason),
                );
            }
            ExitDecision::Restart { delay } => self.schedule_restart(delay),
            ExitDecision::MarkStopped => {
                info!(machine_id = %self.id(), restarts = state.restarts, "Not restarting machine");
                if let Err(e) = self.inner.state.set_desired_status(DesiredStatus::Stopped) {
                    warn!(machine_id = %self.id(), error = %e, "Failed to record desired status");
                }
            }
            ExitDecision::Nothing => {}
        }
    }

    fn schedule_restart(&self, delay: Duration) {
        info!(
            machine_id = %self.id(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling restart"
        );

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let _guard = this.inner.lock.lock().await;
            let state = this.snapshot();
            if state.desired_status != DesiredStatus::Running
                || state.status() != MachineStatus::Stopped
            {
                debug!(machine_id = %this.id(), status = %state.status(), "Restart no longer wanted");
                return;
            }
            this.log_push("start", this.inner.state.start(EventOrigin::System, true));
        });

        if let Some(previous) = self.tasks().pending_restart.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_restart(&self) {
        if let Some(pending) = self.tasks().pending_restart.take() {
            pending.abort();
        }
    }

    /// Releases the machine once `destroyed` is committed.
    pub(super) async fn finish_destroy(&self) {
        self.cancel_restart();
        if let Some(watch) = self.tasks().exit_watch.take() {
            watch.abort();
        }

        self.inner.delivery.close();
        self.inner.delivery.drained().await;

        self.inner.on_destroyed.machine_destroyed(self.machine()).await;
        self.inner.terminated.notify_one();
        info!(machine_id = %self.id(), "Machine destroyed");
    }
}
