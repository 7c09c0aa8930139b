//! Local state persistence for node agent.
//!
//! This module provides SQLite-based storage for:
//! - Machine records (identity, version, instance state)
//! - Lifecycle events not yet acknowledged by the control plane
//!
//! The state store enables the agent to recover after restarts
//! and to resume delivery of unacknowledged events.

mod store;

pub use store::{MachineRecord, StateStore, StateStoreError};
