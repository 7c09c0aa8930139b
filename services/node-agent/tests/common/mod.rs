//! Node fixtures shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_events::{MachineEventType, MachineStatus, StopConfig};
use fleet_id::{FleetId, InstanceId, MachineId, NodeId, VersionId};
use fleet_node_agent::allocator::LocalAllocator;
use fleet_node_agent::cluster::InMemoryClusterStore;
use fleet_node_agent::config::LifecycleTimings;
use fleet_node_agent::machine::{
    GuestResources, InitOverrides, Machine, MachineController, MachineVersion, RestartPolicy,
};
use fleet_node_agent::state::StateStore;
use fleet_node_agent::{AgentServices, InMemoryReporter, MockDriver, NodeAgent};

pub const WAIT: Duration = Duration::from_secs(60);

pub struct Node {
    pub agent: NodeAgent,
    pub driver: Arc<MockDriver>,
    pub allocator: Arc<LocalAllocator>,
    pub reporter: Arc<InMemoryReporter>,
    pub cluster: Arc<InMemoryClusterStore>,
    pub store: Arc<StateStore>,
}

pub fn timings() -> LifecycleTimings {
    LifecycleTimings {
        delivery_retry: Duration::from_millis(200),
        sync_retry: Duration::from_secs(1),
        first_restart: Duration::from_secs(1),
        restart: Duration::from_secs(5),
        auto_destroy_restart_step: Duration::from_secs(5),
    }
}

pub fn node_with(node_id: NodeId, store: Arc<StateStore>, driver: Arc<MockDriver>) -> Node {
    let allocator = Arc::new(LocalAllocator::new(
        GuestResources {
            cpus: 16,
            memory_mb: 32768,
        },
        Duration::from_secs(30),
    ));
    let reporter = Arc::new(InMemoryReporter::new());
    let cluster = Arc::new(InMemoryClusterStore::new());

    let services = AgentServices {
        store: Arc::clone(&store),
        driver: Arc::clone(&driver) as _,
        allocator: Arc::clone(&allocator) as _,
        cluster: Arc::clone(&cluster) as _,
        reporter: Arc::clone(&reporter) as _,
    };

    Node {
        agent: NodeAgent::new(node_id, services, timings()),
        driver,
        allocator,
        reporter,
        cluster,
        store,
    }
}

pub fn node() -> Node {
    node_with(
        NodeId::new(),
        Arc::new(StateStore::open_in_memory().unwrap()),
        Arc::new(MockDriver::new()),
    )
}

pub fn placement(
    node_id: NodeId,
    restart: RestartPolicy,
    auto_destroy: bool,
) -> (Machine, MachineVersion) {
    let machine = Machine {
        id: MachineId::new(),
        namespace: "default".to_string(),
        fleet_id: FleetId::new(),
        region: "local".to_string(),
        version_id: VersionId::new(),
        node_id,
        instance_id: InstanceId::new(),
    };
    let version = MachineVersion {
        id: machine.version_id,
        machine_id: machine.id,
        image_ref: "registry.local/web:v1".to_string(),
        guest: GuestResources {
            cpus: 1,
            memory_mb: 512,
        },
        restart,
        auto_destroy,
        stop_config: StopConfig::default(),
        init: InitOverrides::default(),
        env: [("PORT".to_string(), "8080".to_string())].into(),
    };
    (machine, version)
}

/// Reserves resources and places a machine, as the scheduler would.
pub async fn place(node: &Node, restart: RestartPolicy, auto_destroy: bool) -> MachineController {
    let (machine, version) = placement(node.agent.node_id(), restart, auto_destroy);
    node.allocator.reserve(machine.id, version.guest).unwrap();
    node.agent.place_machine(machine, version).await.unwrap()
}

pub async fn place_running(node: &Node, restart: RestartPolicy, auto_destroy: bool) -> MachineController {
    let controller = place(node, restart, auto_destroy).await;
    controller
        .wait_for_status(MachineStatus::Running, WAIT)
        .await
        .unwrap();
    controller
}

/// Polls `condition` every 10ms until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Waits until the node released `machine_id`.
pub async fn released(node: &Node, machine_id: MachineId) {
    eventually(|| node.agent.get(machine_id).is_none()).await;
}

pub fn count(types: &[MachineEventType], wanted: MachineEventType) -> usize {
    types.iter().filter(|t| **t == wanted).count()
}

/// Runs `fut` on a fresh paused-clock runtime that is dropped afterwards,
/// taking every task it spawned with it.
pub fn run_paused<F: Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
        .block_on(fut)
}
