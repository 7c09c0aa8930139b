//! Fleet Node Agent
//!
//! Restores the machines recorded in the local state database, resumes
//! their lifecycles and keeps running until interrupted.
//!
//! ## Architecture
//!
//! - **State Store**: SQLite database of machine records and undelivered events
//! - **Driver**: Abstracts VM lifecycle operations (mock in dev)
//! - **Allocator**: Node-local resource reservations, expired in the background
//! - **Node Agent**: One controller per machine, each with its own event loop

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_node_agent::allocator::LocalAllocator;
use fleet_node_agent::cluster::InMemoryClusterStore;
use fleet_node_agent::config::Config;
use fleet_node_agent::state::StateStore;
use fleet_node_agent::{AgentServices, ControlPlaneClient, MockDriver, NodeAgent};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet node agent");
    info!(
        node_id = %config.node_id,
        region = %config.region,
        control_plane_url = %config.control_plane_url,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let store = Arc::new(StateStore::open(config.state_db_path())?);

    // Create the driver (mock for now)
    let driver = Arc::new(MockDriver::new().with_latency(std::time::Duration::from_millis(100)));

    let allocator = Arc::new(LocalAllocator::new(config.capacity, config.reservation_ttl));
    let gc_handle = tokio::spawn({
        let allocator = Arc::clone(&allocator);
        let period = config.reservation_ttl.max(std::time::Duration::from_secs(1));
        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let expired = allocator.gc();
                if expired > 0 {
                    debug!(expired, "Expired dangling reservations");
                }
            }
        }
    });

    let services = AgentServices {
        store,
        driver,
        allocator,
        cluster: Arc::new(InMemoryClusterStore::new()),
        reporter: Arc::new(ControlPlaneClient::new(&config)?),
    };

    let agent = NodeAgent::new(config.node_id, services, config.timings);
    let report = agent.boot().await?;
    info!(
        machines = report.machines,
        pending_events = report.pending_events,
        "Machines restored"
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    gc_handle.abort();
    info!(machines = agent.registry().len(), "Node agent shutdown complete");
    Ok(())
}
