//! # fleet-events
//!
//! Lifecycle vocabulary shared by the node agent and the control plane.
//!
//! ## Design Principles
//!
//! - Events are immutable facts about validated lifecycle transitions
//! - Every event records the status the machine ended up in
//! - Event ids are ULIDs, so the control plane can deduplicate redelivered
//!   events and order them per machine
//!
//! ## Lifecycle
//!
//! ```text
//! created -> preparing -> stopped <-> starting -> running <-> stopping -> stopped
//!                |           |                      |
//!                +-----------+---> destroying <-----+ (force)
//!                                       |
//!                                       v
//!                                   destroyed
//! ```

mod error;
mod event;
mod history;
mod types;

pub use error::EventError;
pub use event::*;
pub use history::{EventHistory, HISTORY_CAPACITY};
pub use types::*;
