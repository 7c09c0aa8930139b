//! Reconciliation loop primitives.
//!
//! This library provides the pieces a per-resource sync loop is built from:
//!
//! - **Trigger**: a coalescing wake-up signal. The channel holds at most one
//!   pending signal, so any number of notifications between two wake-ups
//!   collapse into one.
//! - **Reconcile**: one attempt to push the current local state outward.
//! - **Sync loop**: waits for a trigger, reconciles, and on failure schedules
//!   a retry after a fixed delay instead of retrying inline.
//!
//! # Invariants
//!
//! - `notify` never blocks
//! - Only the latest state at each wake-up is pushed; intermediate states
//!   may be skipped
//! - A loop that observes [`ConvergenceStatus::Terminal`] never runs again

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default delay before a failed reconciliation is retried.
pub const DEFAULT_SYNC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The remote store could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The remote store refused the write.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Remote matches local; wait for the next trigger.
    Converged,

    /// Remote holds the final state; the loop should exit.
    Terminal,
}

impl ConvergenceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }
}

// =============================================================================
// Trigger
// =============================================================================

/// Sending half of a coalescing trigger.
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    /// Requests a reconciliation.
    ///
    /// Returns `false` when a signal was already pending or the listener is
    /// gone; either way the call returns immediately.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Receiving half of a coalescing trigger.
///
/// Keeps only a weak handle on the channel for self-scheduled retries, so the
/// listener ends once every [`Trigger`] is dropped.
#[derive(Debug)]
pub struct TriggerListener {
    rx: mpsc::Receiver<()>,
    retry: mpsc::WeakSender<()>,
}

impl TriggerListener {
    /// Waits for the next signal. Returns `false` once all triggers are gone.
    pub async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Schedules a self-trigger after `delay`.
    pub fn retry_after(&self, delay: Duration) -> JoinHandle<()> {
        let retry = self.retry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = retry.upgrade() {
                let _ = tx.try_send(());
            }
        })
    }
}

/// Creates a trigger pair with a single-slot buffer.
pub fn trigger() -> (Trigger, TriggerListener) {
    let (tx, rx) = mpsc::channel(1);
    let retry = tx.downgrade();
    (Trigger { tx }, TriggerListener { rx, retry })
}

// =============================================================================
// Sync Loop
// =============================================================================

/// One reconciliation attempt.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> String;

    async fn reconcile(&self) -> Result<ConvergenceStatus, ReconcileError>;
}

/// Why a sync loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncExit {
    /// A terminal state was pushed.
    Terminal,

    /// Every trigger was dropped.
    Closed,
}

/// Runs `reconciler` once per trigger until it reports
/// [`ConvergenceStatus::Terminal`] or all triggers are dropped.
pub async fn run_sync_loop<R>(
    reconciler: R,
    mut listener: TriggerListener,
    retry_delay: Duration,
) -> SyncExit
where
    R: Reconcile,
{
    let name = reconciler.name();

    while listener.wait().await {
        match reconciler.reconcile().await {
            Ok(ConvergenceStatus::Converged) => {
                debug!(reconciler = %name, "Reconciled");
            }
            Ok(ConvergenceStatus::Terminal) => {
                debug!(reconciler = %name, "Reached terminal state, sync loop exiting");
                return SyncExit::Terminal;
            }
            Err(e) => {
                warn!(
                    reconciler = %name,
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Reconcile failed, scheduling retry"
                );
                listener.retry_after(retry_delay);
            }
        }
    }

    SyncExit::Closed
}
