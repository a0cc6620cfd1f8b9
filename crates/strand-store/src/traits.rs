//! Core trait and types for segment payload storage.

use bytes::Bytes;
use strand_types::{AvatarId, SegmentIdent};

use crate::error::StoreError;

/// Aggregate usage reported by a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreUsage {
    /// Total payload bytes currently stored.
    pub bytes_stored: u64,
    /// Number of segment payloads currently stored.
    pub segment_count: u64,
}

/// Trait for storing and retrieving erasure share payloads.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Data is passed as [`Bytes`] to enable zero-copy transfers through the
/// pipeline.
#[async_trait::async_trait]
pub trait SegmentStore: Send + Sync {
    /// Store a segment payload. Overwrites any payload already stored
    /// under the same ident; version-ordering decisions happen in the
    /// metadata layer before this is called.
    async fn put(&self, ident: &SegmentIdent, data: Bytes) -> Result<(), StoreError>;

    /// Retrieve a segment payload. Returns `None` if not found.
    async fn get(&self, ident: &SegmentIdent) -> Result<Option<Bytes>, StoreError>;

    /// Delete a segment payload. Deleting an absent payload is not an error.
    async fn delete(&self, ident: &SegmentIdent) -> Result<(), StoreError>;

    /// Check whether a segment payload exists.
    async fn contains(&self, ident: &SegmentIdent) -> Result<bool, StoreError>;

    /// Delete every stored payload for the given avatar and key, across
    /// all versions and segment numbers. Returns the number of payloads
    /// removed.
    async fn delete_key(&self, avatar_id: AvatarId, key: &str) -> Result<u64, StoreError>;

    /// Report current aggregate usage.
    async fn usage(&self) -> Result<StoreUsage, StoreError>;
}
