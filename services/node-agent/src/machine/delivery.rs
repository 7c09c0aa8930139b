//! Outbound event delivery.
//!
//! Each machine has one FIFO of lifecycle events awaiting acknowledgment
//! from the control plane, drained by a single worker task. Events are
//! delivered strictly in order: a failed report is retried after a fixed
//! delay and later events wait behind it. Acknowledged events are removed
//! from the local store, so whatever is still stored after a crash is
//! reloaded with [`DeliveryQueue::restore`] and delivered again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleet_events::MachineEvent;
use fleet_id::MachineId;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::client::EventReporter;
use crate::state::StateStore;

struct Shared {
    machine_id: MachineId,
    pending: Mutex<VecDeque<MachineEvent>>,
    wake: Notify,
    closed: AtomicBool,
    drained: watch::Sender<bool>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<MachineEvent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle on one machine's delivery queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    fn new(machine_id: MachineId) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                machine_id,
                pending: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                drained,
            }),
        }
    }

    /// Creates the queue and spawns its worker.
    pub fn spawn(
        machine_id: MachineId,
        reporter: Arc<dyn EventReporter>,
        store: Arc<StateStore>,
        retry_delay: Duration,
    ) -> Self {
        let queue = Self::new(machine_id);
        let shared = Arc::clone(&queue.shared);
        tokio::spawn(deliver(shared, reporter, store, retry_delay));
        queue
    }

    /// Queue without a worker; events only accumulate.
    #[cfg(test)]
    pub(crate) fn detached(machine_id: MachineId) -> Self {
        Self::new(machine_id)
    }

    pub fn push(&self, event: MachineEvent) {
        self.shared.pending().push_back(event);
        self.shared.wake.notify_one();
    }

    /// Appends events persisted by a previous run, oldest first.
    pub fn restore(&self, events: Vec<MachineEvent>) {
        if events.is_empty() {
            return;
        }
        info!(
            machine_id = %self.shared.machine_id,
            count = events.len(),
            "Restoring undelivered events"
        );
        self.shared.pending().extend(events);
        self.shared.wake.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events still waiting for acknowledgment, oldest first.
    pub fn snapshot(&self) -> Vec<MachineEvent> {
        self.shared.pending().iter().cloned().collect()
    }

    /// Lets the worker exit once the queue is empty.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Resolves once the queue was closed and every event acknowledged.
    pub async fn drained(&self) {
        let mut rx = self.shared.drained.subscribe();
        // The sender lives in `shared`, which `self` keeps alive.
        let _ = rx.wait_for(|done| *done).await;
    }
}

async fn deliver(
    shared: Arc<Shared>,
    reporter: Arc<dyn EventReporter>,
    store: Arc<StateStore>,
    retry_delay: Duration,
) {
    let machine_id = shared.machine_id;
    debug!(machine_id = %machine_id, "Delivery worker started");

    loop {
        let head = shared.pending().front().cloned();
        let Some(event) = head else {
            if shared.closed.load(Ordering::SeqCst) {
                break;
            }
            shared.wake.notified().await;
            continue;
        };

        match reporter.report(&event).await {
            Ok(()) => {
                if let Err(e) = store.delete_machine_instance_event(event.id()) {
                    warn!(
                        machine_id = %machine_id,
                        event_id = %event.id(),
                        error = %e,
                        "Failed to delete delivered event"
                    );
                }
                shared.pending().pop_front();
                debug!(
                    machine_id = %machine_id,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "Event delivered"
                );
            }
            Err(e) => {
                warn!(
                    machine_id = %machine_id,
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Event delivery failed, retrying"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    shared.drained.send_replace(true);
    debug!(machine_id = %machine_id, "Delivery worker drained");
}
