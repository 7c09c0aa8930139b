//! Fleet Node Agent Library
//!
//! The node agent runs on each host and drives the lifecycle of the
//! machines placed on it: preparing their microVM instance, starting and
//! stopping it, restarting or destroying it when the workload exits, and
//! resuming all of that after the agent itself restarts.
//!
//! ## Architecture
//!
//! ```text
//! NodeAgent
//! ├── MachineRegistry
//! └── MachineController(machine_id)
//!     ├── MachineState        (transition table, persisted per transition)
//!     ├── event loop          (one side effect per committed event)
//!     ├── DeliveryQueue       (ordered, at-least-once upstream delivery)
//!     └── sync loop           (cluster store projection)
//! ```
//!
//! ## Modules
//!
//! - `agent`: boot, placement and release of machines
//! - `machine`: per-machine lifecycle
//! - `driver`: VM driver contract and the in-process mock
//! - `allocator`: node resource reservations
//! - `cluster`: cluster store contract
//! - `client`: control plane event reporting
//! - `state`: local SQLite state persistence

pub mod agent;
pub mod allocator;
pub mod client;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod machine;
pub mod registry;
pub mod state;

// Re-export commonly used types
pub use agent::{AgentServices, BootReport, NodeAgent};
pub use client::{ControlPlaneClient, EventReporter, InMemoryReporter};
pub use driver::{MockDriver, VmDriver};
pub use error::MachineError;
pub use machine::{MachineController, MachineInstanceState};
