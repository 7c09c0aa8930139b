//! Control plane API client for the node agent.
//!
//! Lifecycle events are reported one at a time; a 2xx response is the
//! control plane's acknowledgment. Delivery is at least once, and the
//! control plane deduplicates by event id.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_events::{MachineEvent, MachineEventType};
use fleet_id::{MachineId, NodeId};
use tracing::{debug, error};

use crate::config::Config;

/// Upstream sink for lifecycle events.
#[async_trait]
pub trait EventReporter: Send + Sync {
    /// Returns `Ok` only once the event is acknowledged.
    async fn report(&self, event: &MachineEvent) -> Result<()>;
}

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: NodeId,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_base_url(&config.control_plane_url, config.node_id)
    }

    pub fn with_base_url(base_url: &str, node_id: NodeId) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            node_id,
        })
    }

    fn events_url(&self, machine_id: MachineId) -> String {
        format!(
            "{}/v1/nodes/{}/machines/{}/events",
            self.base_url, self.node_id, machine_id
        )
    }
}

#[async_trait]
impl EventReporter for ControlPlaneClient {
    async fn report(&self, event: &MachineEvent) -> Result<()> {
        let url = self.events_url(event.machine_id());
        debug!(
            machine_id = %event.machine_id(),
            event_id = %event.id(),
            event_type = %event.event_type(),
            "Reporting machine event"
        );

        let response = self.client.post(&url).json(event).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to report machine event");
            anyhow::bail!("Failed to report machine event: {} - {}", status, body);
        }

        Ok(())
    }
}

/// Reporter that keeps acknowledged events in memory.
///
/// Deliveries can be refused on demand to exercise the retry path.
#[derive(Default)]
pub struct InMemoryReporter {
    delivered: Mutex<Vec<MachineEvent>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    refusing: AtomicBool,
}

impl InMemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` deliveries.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Refuse every delivery until reset.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Acknowledged events, in delivery order.
    pub fn delivered(&self) -> Vec<MachineEvent> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Acknowledged event types of one machine, in delivery order.
    pub fn event_types(&self, machine_id: MachineId) -> Vec<MachineEventType> {
        self.delivered()
            .iter()
            .filter(|e| e.machine_id() == machine_id)
            .map(MachineEvent::event_type)
            .collect()
    }
}

#[async_trait]
impl EventReporter for InMemoryReporter {
    async fn report(&self, event: &MachineEvent) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.refusing.load(Ordering::SeqCst) {
            anyhow::bail!("reporter refusing deliveries");
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected delivery failure");
        }

        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
