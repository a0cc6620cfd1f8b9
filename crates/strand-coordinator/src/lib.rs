//! Fan-out coordinators.
//!
//! One coordinator per verb, each fanning one request out across the
//! destination set (one task per segment number) and collecting arrivals
//! against a completion policy: [`Archiver`] and [`Destroyer`] need every
//! segment (with hinted-handoff substitution for down primaries),
//! [`Retriever`], [`Listmatcher`], and [`StatGetter`] settle for the
//! configured agreement level.

mod archiver;
mod destroyer;
mod error;
mod fanout;
mod listmatch;
mod retriever;
mod stat;
pub mod stream;
#[cfg(test)]
mod tests;

use std::time::Duration;

pub use archiver::{ArchiveRequest, Archiver};
pub use destroyer::Destroyer;
pub use error::CoordinatorError;
pub use fanout::{Arrival, CompletionPolicy};
pub use listmatch::{ListMatchResult, Listmatcher};
pub use retriever::{RetrieveResult, Retriever};
pub use stat::StatGetter;

/// Shared settings for every coordinator on one node.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Minimum segment count a read-side quorum needs (k).
    pub agreement_level: usize,
    /// Payload slice size for streaming transfers.
    pub slice_size: usize,
    /// Deadline for one whole coordinated operation.
    pub op_timeout: Duration,
}

impl CoordinatorConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config(agreement_level: usize) -> Self {
        Self {
            agreement_level,
            slice_size: 1024,
            op_timeout: Duration::from_secs(5),
        }
    }

    /// Create a default config for production use.
    pub fn default_config(agreement_level: usize) -> Self {
        Self {
            agreement_level,
            slice_size: strand_types::DEFAULT_SLICE_SIZE,
            op_timeout: Duration::from_secs(30),
        }
    }
}
