//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::NodeId;

use crate::machine::GuestResources;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Region this node serves.
    pub region: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Schedulable guest capacity of this host.
    pub capacity: GuestResources,

    /// How long an unconfirmed reservation is held.
    pub reservation_ttl: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub timings: LifecycleTimings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Node ID can be provided or auto-generated
        let node_id = match std::env::var("FLEET_NODE_ID") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid FLEET_NODE_ID: {raw}"))?,
            Err(_) => NodeId::new(),
        };

        let region = std::env::var("FLEET_REGION").unwrap_or_else(|_| "local".to_string());

        let control_plane_url = std::env::var("FLEET_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        let data_dir = std::env::var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/fleet"));

        let capacity = GuestResources {
            cpus: env_parse("FLEET_CPUS", 8),
            memory_mb: env_parse("FLEET_MEMORY_MB", 16 * 1024),
        };

        let reservation_ttl = Duration::from_secs(env_parse("FLEET_RESERVATION_TTL_SECS", 30));

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_id,
            region,
            control_plane_url,
            data_dir,
            capacity,
            reservation_ttl,
            log_level,
            timings: LifecycleTimings::default(),
        })
    }

    /// Path of the SQLite database inside the data directory.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Fixed delays of the machine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    /// Backoff between attempts to deliver the head event upstream.
    pub delivery_retry: Duration,

    /// Delay before a failed cluster-store push is retried.
    pub sync_retry: Duration,

    /// Restart delay for the first automatic restart.
    pub first_restart: Duration,

    /// Restart delay for every later automatic restart.
    pub restart: Duration,

    /// Linear backoff step for auto-destroy workloads (`step * restarts`).
    pub auto_destroy_restart_step: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            delivery_retry: Duration::from_secs(1),
            sync_retry: fleet_reconcile::DEFAULT_SYNC_RETRY_DELAY,
            first_restart: Duration::from_secs(1),
            restart: Duration::from_secs(5),
            auto_destroy_restart_step: Duration::from_secs(5),
        }
    }
}
