//! VM driver interface and mock implementation.
//!
//! The driver abstracts everything the agent does to a microVM instance:
//! - Pulling the image and building the instance
//! - Starting, stopping and destroying the VM
//! - Exec, logs and a stream of instance state updates
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{ExitInfo, StopConfig};
use fleet_id::InstanceId;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::machine::{Machine, MachineVersion};

/// Errors from driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    #[error("instance {0} is not running")]
    NotRunning(InstanceId),

    #[error("image pull failed for {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
}

/// Result of building an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub local_ipv4: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

/// Status update from [`VmDriver::watch_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStateUpdate {
    Running,
    Exited(ExitInfo),
}

pub type InstanceUpdates = Pin<Box<dyn Stream<Item = InstanceStateUpdate> + Send>>;
pub type LogEntries = Pin<Box<dyn Stream<Item = LogEntry> + Send>>;

/// VM driver interface.
#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn pull_image(&self, image_ref: &str) -> Result<(), DriverError>;

    /// Builds the instance for `version`. Must be safe to repeat after a
    /// partial earlier attempt.
    async fn create_instance(
        &self,
        machine: &Machine,
        version: &MachineVersion,
    ) -> Result<InstanceInfo, DriverError>;

    async fn start(&self, instance_id: InstanceId) -> Result<(), DriverError>;

    /// Delivers `config.signal`, escalating to a forced shutdown after
    /// `config.timeout()`.
    async fn stop(&self, instance_id: InstanceId, config: &StopConfig) -> Result<(), DriverError>;

    /// Tears the instance down. Callers treat [`DriverError::NotFound`] as
    /// success.
    async fn destroy(&self, instance_id: InstanceId) -> Result<(), DriverError>;

    async fn exec(
        &self,
        instance_id: InstanceId,
        cmd: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, DriverError>;

    async fn get_logs(&self, instance_id: InstanceId) -> Result<Vec<LogEntry>, DriverError>;

    async fn subscribe_logs(&self, instance_id: InstanceId) -> Result<LogEntries, DriverError>;

    /// Streams state updates, starting with the instance's current state.
    async fn watch_state(&self, instance_id: InstanceId) -> Result<InstanceUpdates, DriverError>;
}

// =============================================================================
// Mock driver
// =============================================================================

/// Driver operations, used for failure injection and call recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    PullImage,
    CreateInstance,
    Start,
    Stop,
    Destroy,
    Exec,
}

impl DriverOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PullImage => "pull_image",
            Self::CreateInstance => "create_instance",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
            Self::Exec => "exec",
        }
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub op: DriverOp,
    /// Instance id, or the image reference for pulls.
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockVmStatus {
    Created,
    Running,
    Stopped,
}

struct MockInstance {
    status: MockVmStatus,
    local_ipv4: Ipv4Addr,
    last_exit: Option<ExitInfo>,
    logs: Vec<LogEntry>,
    watchers: Vec<mpsc::UnboundedSender<InstanceStateUpdate>>,
    log_subscribers: Vec<mpsc::UnboundedSender<LogEntry>>,
}

impl MockInstance {
    fn publish(&mut self, update: InstanceStateUpdate) {
        self.watchers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn log(&mut self, stream: LogStream, line: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            stream,
            line: line.into(),
        };
        self.log_subscribers
            .retain(|tx| tx.send(entry.clone()).is_ok());
        self.logs.push(entry);
    }

    fn exit(&mut self, exit_code: i32, oom_killed: bool) {
        let info = ExitInfo {
            exit_code,
            exited_at: Utc::now(),
            oom_killed,
        };
        self.status = MockVmStatus::Stopped;
        self.last_exit = Some(info.clone());
        self.log(LogStream::Stderr, format!("workload exited with code {exit_code}"));
        self.publish(InstanceStateUpdate::Exited(info));
    }
}

#[derive(Default)]
struct MockInner {
    instances: HashMap<InstanceId, MockInstance>,
    failing: HashMap<DriverOp, String>,
    calls: Vec<DriverCall>,
}

/// In-process driver for testing and development.
///
/// Instances are plain records; `start` marks one running and `stop` makes
/// its workload exit with code 0. [`MockDriver::exit`] simulates the
/// workload exiting on its own.
pub struct MockDriver {
    inner: Mutex<MockInner>,
    next_ip: AtomicU32,
    latency: Duration,
}

impl MockDriver {
    /// Create a new mock driver.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner::default()),
            next_ip: AtomicU32::new(2),
            latency: Duration::ZERO,
        }
    }

    /// Simulates work taking `latency` in every lifecycle call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn inner(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every call of `op` fail with `reason` until cleared.
    pub fn fail(&self, op: DriverOp, reason: impl Into<String>) {
        self.inner().failing.insert(op, reason.into());
    }

    pub fn clear_failure(&self, op: DriverOp) {
        self.inner().failing.remove(&op);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner().calls.clone()
    }

    /// Number of recorded calls of `op`.
    pub fn count(&self, op: DriverOp) -> usize {
        self.inner().calls.iter().filter(|c| c.op == op).count()
    }

    /// Whether the instance exists and is running.
    pub fn is_running(&self, instance_id: InstanceId) -> bool {
        self.inner()
            .instances
            .get(&instance_id)
            .is_some_and(|i| i.status == MockVmStatus::Running)
    }

    pub fn has_instance(&self, instance_id: InstanceId) -> bool {
        self.inner().instances.contains_key(&instance_id)
    }

    /// Simulates the workload exiting on its own.
    pub fn exit(&self, instance_id: InstanceId, exit_code: i32) -> Result<(), DriverError> {
        let mut inner = self.inner();
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;
        if instance.status != MockVmStatus::Running {
            return Err(DriverError::NotRunning(instance_id));
        }
        info!(instance_id = %instance_id, exit_code, "[MOCK] Workload exited");
        instance.exit(exit_code, false);
        Ok(())
    }

    /// Appends a workload log line.
    pub fn emit_log(&self, instance_id: InstanceId, line: &str) -> Result<(), DriverError> {
        let mut inner = self.inner();
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;
        instance.log(LogStream::Stdout, line);
        Ok(())
    }

    /// Records the call and returns the injected failure for `op`, if any.
    fn begin(&self, op: DriverOp, target: String) -> Result<(), DriverError> {
        let mut inner = self.inner();
        inner.calls.push(DriverCall { op, target });
        match inner.failing.get(&op) {
            Some(reason) => Err(DriverError::Operation {
                op: op.as_str(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn simulate_work(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_ipv4(&self) -> Ipv4Addr {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        Ipv4Addr::new(172, 19, ((n >> 8) & 0xff) as u8, (n & 0xff) as u8)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmDriver for MockDriver {
    async fn pull_image(&self, image_ref: &str) -> Result<(), DriverError> {
        if let Err(DriverError::Operation { reason, .. }) =
            self.begin(DriverOp::PullImage, image_ref.to_string())
        {
            return Err(DriverError::ImagePull {
                image: image_ref.to_string(),
                reason,
            });
        }
        info!(image = %image_ref, "[MOCK] Pulling image");
        self.simulate_work().await;
        Ok(())
    }

    async fn create_instance(
        &self,
        machine: &Machine,
        version: &MachineVersion,
    ) -> Result<InstanceInfo, DriverError> {
        let instance_id = machine.instance_id;
        self.begin(DriverOp::CreateInstance, instance_id.to_string())?;
        self.simulate_work().await;

        let mut inner = self.inner();
        if let Some(existing) = inner.instances.get(&instance_id) {
            debug!(instance_id = %instance_id, "[MOCK] Instance already built");
            return Ok(InstanceInfo {
                local_ipv4: Some(existing.local_ipv4),
            });
        }

        let local_ipv4 = self.next_ipv4();
        info!(
            instance_id = %instance_id,
            image = %version.image_ref,
            cpus = version.guest.cpus,
            memory_mb = version.guest.memory_mb,
            local_ipv4 = %local_ipv4,
            "[MOCK] Instance created"
        );
        inner.instances.insert(
            instance_id,
            MockInstance {
                status: MockVmStatus::Created,
                local_ipv4,
                last_exit: None,
                logs: Vec::new(),
                watchers: Vec::new(),
                log_subscribers: Vec::new(),
            },
        );
        Ok(InstanceInfo {
            local_ipv4: Some(local_ipv4),
        })
    }

    async fn start(&self, instance_id: InstanceId) -> Result<(), DriverError> {
        self.begin(DriverOp::Start, instance_id.to_string())?;
        self.simulate_work().await;

        let mut inner = self.inner();
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;
        if instance.status != MockVmStatus::Running {
            instance.status = MockVmStatus::Running;
            instance.log(LogStream::Stdout, "workload started");
            instance.publish(InstanceStateUpdate::Running);
        }
        info!(instance_id = %instance_id, "[MOCK] VM started");
        Ok(())
    }

    async fn stop(&self, instance_id: InstanceId, config: &StopConfig) -> Result<(), DriverError> {
        self.begin(DriverOp::Stop, instance_id.to_string())?;
        info!(
            instance_id = %instance_id,
            signal = %config.signal,
            timeout_secs = config.timeout_secs,
            "[MOCK] Stopping VM"
        );
        self.simulate_work().await;

        let mut inner = self.inner();
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;
        if instance.status == MockVmStatus::Running {
            instance.exit(0, false);
        }
        Ok(())
    }

    async fn destroy(&self, instance_id: InstanceId) -> Result<(), DriverError> {
        self.begin(DriverOp::Destroy, instance_id.to_string())?;
        self.simulate_work().await;

        let mut inner = self.inner();
        let mut instance = inner
            .instances
            .remove(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;
        if instance.status == MockVmStatus::Running {
            instance.exit(137, false);
        }
        info!(instance_id = %instance_id, "[MOCK] Instance destroyed");
        Ok(())
    }

    async fn exec(
        &self,
        instance_id: InstanceId,
        cmd: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput, DriverError> {
        self.begin(DriverOp::Exec, instance_id.to_string())?;
        if !self.is_running(instance_id) {
            return Err(DriverError::NotRunning(instance_id));
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("{}\n", cmd.join(" ")),
            stderr: String::new(),
        })
    }

    async fn get_logs(&self, instance_id: InstanceId) -> Result<Vec<LogEntry>, DriverError> {
        self.inner()
            .instances
            .get(&instance_id)
            .map(|i| i.logs.clone())
            .ok_or(DriverError::NotFound(instance_id))
    }

    async fn subscribe_logs(&self, instance_id: InstanceId) -> Result<LogEntries, DriverError> {
        let mut inner = self.inner();
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        instance.log_subscribers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn watch_state(&self, instance_id: InstanceId) -> Result<InstanceUpdates, DriverError> {
        let mut inner = self.inner();
        let instance = inner
            .instances
            .get_mut(&instance_id)
            .ok_or(DriverError::NotFound(instance_id))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let current = match instance.status {
            MockVmStatus::Running => InstanceStateUpdate::Running,
            MockVmStatus::Created | MockVmStatus::Stopped => {
                InstanceStateUpdate::Exited(instance.last_exit.clone().unwrap_or(ExitInfo {
                    exit_code: 0,
                    exited_at: Utc::now(),
                    oom_killed: false,
                }))
            }
        };
        // Receiver is alive, the send cannot fail.
        let _ = tx.send(current);
        instance.watchers.push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
