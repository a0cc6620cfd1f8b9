//! Segment payload storage.
//!
//! This crate defines the [`SegmentStore`] trait for persisting erasure
//! share payloads, along with two concrete backends:
//!
//! - [`MemoryStore`] — in-memory storage backed by a `RwLock<HashMap>`.
//! - [`FileStore`] — one file per segment under a per-avatar directory tree.
//!
//! Payload bytes are opaque here. Checksums and timestamps live in the
//! metadata store; the payload store is addressed purely by
//! [`SegmentIdent`](strand_types::SegmentIdent).

mod error;
mod file_store;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use traits::{SegmentStore, StoreUsage};
