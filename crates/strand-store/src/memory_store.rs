//! In-memory segment storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use strand_types::{AvatarId, SegmentIdent};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{SegmentStore, StoreUsage};

/// In-memory segment store backed by a `RwLock<HashMap>`.
///
/// Useful for testing and for nodes configured to run in memory-only mode.
/// Tracks total bytes stored against a configurable maximum.
pub struct MemoryStore {
    segments: RwLock<HashMap<SegmentIdent, Bytes>>,
    max_bytes: u64,
}

impl MemoryStore {
    /// Create a new in-memory store with the given capacity limit.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    fn used_bytes_unlocked(map: &HashMap<SegmentIdent, Bytes>) -> u64 {
        map.values().map(|v| v.len() as u64).sum()
    }
}

#[async_trait::async_trait]
impl SegmentStore for MemoryStore {
    async fn put(&self, ident: &SegmentIdent, data: Bytes) -> Result<(), StoreError> {
        let mut map = self.segments.write().expect("lock poisoned");
        let used = Self::used_bytes_unlocked(&map);
        let data_len = data.len() as u64;

        // If we're replacing an existing payload, account for freed space.
        let existing_len = map.get(ident).map_or(0, |v| v.len() as u64);
        let net_increase = data_len.saturating_sub(existing_len);

        if used + net_increase > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed: net_increase,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        debug!(
            avatar = ident.avatar_id,
            key = %ident.key,
            version = ident.version_number,
            segment = ident.segment_number,
            size = data.len(),
            "storing segment in memory"
        );
        map.insert(ident.clone(), data);
        Ok(())
    }

    async fn get(&self, ident: &SegmentIdent) -> Result<Option<Bytes>, StoreError> {
        let map = self.segments.read().expect("lock poisoned");
        Ok(map.get(ident).cloned())
    }

    async fn delete(&self, ident: &SegmentIdent) -> Result<(), StoreError> {
        let mut map = self.segments.write().expect("lock poisoned");
        map.remove(ident);
        Ok(())
    }

    async fn contains(&self, ident: &SegmentIdent) -> Result<bool, StoreError> {
        let map = self.segments.read().expect("lock poisoned");
        Ok(map.contains_key(ident))
    }

    async fn delete_key(&self, avatar_id: AvatarId, key: &str) -> Result<u64, StoreError> {
        let mut map = self.segments.write().expect("lock poisoned");
        let before = map.len();
        map.retain(|ident, _| !(ident.avatar_id == avatar_id && ident.key == key));
        let removed = (before - map.len()) as u64;
        debug!(avatar = avatar_id, %key, removed, "purged segments from memory");
        Ok(removed)
    }

    async fn usage(&self) -> Result<StoreUsage, StoreError> {
        let map = self.segments.read().expect("lock poisoned");
        Ok(StoreUsage {
            bytes_stored: Self::used_bytes_unlocked(&map),
            segment_count: map.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(key: &str, version: u32, segment: u8) -> SegmentIdent {
        SegmentIdent {
            avatar_id: 7,
            key: key.to_string(),
            version_number: version,
            segment_number: segment,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new(1024 * 1024);
        let id = ident("photos/cat.jpg", 1, 3);
        let data = Bytes::from_static(b"segment payload");

        store.put(&id, data.clone()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryStore::new(1024);
        assert_eq!(store.get(&ident("nope", 1, 1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_then_get_returns_none() {
        let store = MemoryStore::new(1024);
        let id = ident("a", 1, 1);
        store.put(&id, Bytes::from_static(b"x")).await.unwrap();
        store.delete(&id).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_capacity_limit_enforced() {
        let store = MemoryStore::new(10);
        let result = store
            .put(&ident("big", 1, 1), Bytes::from_static(b"0123456789abcdef"))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_replace_frees_old_bytes() {
        let store = MemoryStore::new(16);
        let id = ident("swap", 1, 1);
        store
            .put(&id, Bytes::from_static(b"0123456789ab"))
            .await
            .unwrap();
        // Replacing with a same-size payload must not count twice.
        store
            .put(&id, Bytes::from_static(b"ba9876543210"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_key_removes_all_versions_and_segments() {
        let store = MemoryStore::new(1024);
        store
            .put(&ident("k", 1, 1), Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put(&ident("k", 1, 2), Bytes::from_static(b"b"))
            .await
            .unwrap();
        store
            .put(&ident("k", 2, 1), Bytes::from_static(b"c"))
            .await
            .unwrap();
        store
            .put(&ident("other", 1, 1), Bytes::from_static(b"d"))
            .await
            .unwrap();

        let removed = store.delete_key(7, "k").await.unwrap();
        assert_eq!(removed, 3);
        assert!(store.contains(&ident("other", 1, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_counts_bytes_and_segments() {
        let store = MemoryStore::new(1024);
        store
            .put(&ident("u", 1, 1), Bytes::from_static(b"12345"))
            .await
            .unwrap();
        store
            .put(&ident("u", 1, 2), Bytes::from_static(b"678"))
            .await
            .unwrap();

        let usage = store.usage().await.unwrap();
        assert_eq!(usage.bytes_stored, 8);
        assert_eq!(usage.segment_count, 2);
    }
}
