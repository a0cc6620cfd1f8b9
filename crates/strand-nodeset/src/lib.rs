//! Destination liveness tracking.
//!
//! [`NodeTable`] is the shared, read-mostly view of the configured
//! destination set: which node owns which segment slot, who is currently
//! believed down, and who should stand in for a down primary. A broadcast
//! channel carries up/down transitions to subscribers (the handoff server
//! drains hints on `Up`).

mod sweeper;
mod table;

pub use sweeper::{SweeperConfig, SweeperHandle, start_sweeper};
pub use table::{NodeEvent, NodeStatus, NodeTable};

/// Default number of stand-in destinations per down primary.
pub const DEFAULT_HANDOFF_COUNT: usize = 2;
