//! # fleet-id
//!
//! Typed identifiers for the fleet node agent.
//!
//! Every identifier is rendered as `{prefix}_{ulid}`:
//!
//! - `mach_01HV4Z2WQXKJNM8GPQY6VBKC3D` (a machine)
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` (the VM instance backing it)
//! - `evt_01HV4Z5PZQMUST1KVUB9YENF6G` (a lifecycle event)
//!
//! The prefix keeps ids from being mixed across resource types and the ULID
//! makes them sortable by creation time, which is what event ordering and
//! control-plane deduplication rely on. Ids come from one monotonic
//! generator per process, so two ids minted in the same millisecond still
//! sort in creation order.

mod error;
mod generator;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use generator::next_ulid;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
