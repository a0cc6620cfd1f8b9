//! Per-node metadata persistence wrapping Fjall.
//!
//! [`MetaStore`] keeps one [`ContentPointer`](strand_types::ContentPointer)
//! row per segment addressing tuple and enforces the timestamp ordering
//! rules for writes and tombstones. It is the only component that decides
//! whether an incoming write is stale; everything above it just carries
//! the verdict back to the caller.

mod error;
mod store;

pub use error::MetaError;
pub use store::{DestroyOutcome, InsertOutcome, ListMatch, MetaStore};
