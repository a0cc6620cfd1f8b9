//! [`HintRepository`] implementation wrapping a Fjall keyspace.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use strand_types::HandoffHint;
use tracing::debug;

use crate::HintError;

type Result<T> = std::result::Result<T, HintError>;

/// Separator after the destination exchange in a storage key. 0xFF never
/// occurs in UTF-8, so a prefix scan for one destination cannot bleed
/// into another whose name shares a prefix.
const KEY_SEP: u8 = 0xFF;

/// Durable store of handoff hints backed by Fjall.
///
/// Rows sort by `destination ++ timestamp (8 bytes BE)`, so a prefix scan
/// per destination yields hints oldest-first. At most one row exists per
/// (destination, avatar, key, version, segment) tuple.
pub struct HintRepository {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// `dest ++ 0xFF ++ timestamp (8 bytes BE) ++ avatar (4 bytes BE) ++
    /// segment ++ key` → serialized [`HandoffHint`].
    hints: Keyspace,
}

impl HintRepository {
    /// Open a persistent repository at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary repository that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let hints = db.keyspace("hints", KeyspaceCreateOptions::default)?;
        Ok(Self { db, hints })
    }

    /// Record a hint. Idempotent: when a hint for the same
    /// (destination, avatar, key, version, segment) tuple already exists,
    /// nothing is written and `Ok(false)` is returned.
    pub fn store(&self, hint: &HandoffHint) -> Result<bool> {
        for guard in self.hints.prefix(dest_prefix(&hint.destination_exchange).as_slice()) {
            let v = guard.value()?;
            let existing: HandoffHint = postcard::from_bytes(&v)?;
            if same_tuple(&existing, hint) {
                return Ok(false);
            }
        }

        let value = postcard::to_allocvec(hint)?;
        self.hints.insert(hint_key(hint).as_slice(), value.as_slice())?;
        debug!(
            dest = %hint.destination_exchange,
            avatar = hint.avatar_id,
            key = %hint.key,
            segment = hint.segment_number,
            "recorded handoff hint"
        );
        Ok(true)
    }

    /// The oldest outstanding hint for a destination, or `None`.
    pub fn next_hint(&self, destination_exchange: &str) -> Result<Option<HandoffHint>> {
        for guard in self.hints.prefix(dest_prefix(destination_exchange).as_slice()) {
            let v = guard.value()?;
            return Ok(Some(postcard::from_bytes(&v)?));
        }
        Ok(None)
    }

    /// Delete the row matching this hint's
    /// (destination, avatar, key, version, segment) tuple.
    pub fn purge(&self, hint: &HandoffHint) -> Result<()> {
        let mut to_remove = Vec::new();
        for guard in self.hints.prefix(dest_prefix(&hint.destination_exchange).as_slice()) {
            let (k, v) = guard.into_inner()?;
            let existing: HandoffHint = postcard::from_bytes(&v)?;
            if same_tuple(&existing, hint) {
                to_remove.push(k);
            }
        }
        for k in to_remove {
            self.hints.remove(k.as_ref())?;
        }
        debug!(
            dest = %hint.destination_exchange,
            avatar = hint.avatar_id,
            key = %hint.key,
            segment = hint.segment_number,
            "purged handoff hint"
        );
        Ok(())
    }

    /// Number of outstanding hints for a destination.
    ///
    /// Note: this is an O(n) scan.
    pub fn count(&self, destination_exchange: &str) -> Result<usize> {
        let mut count = 0;
        for guard in self.hints.prefix(dest_prefix(destination_exchange).as_slice()) {
            let _ = guard.key()?;
            count += 1;
        }
        Ok(count)
    }
}

fn same_tuple(a: &HandoffHint, b: &HandoffHint) -> bool {
    a.destination_exchange == b.destination_exchange
        && a.avatar_id == b.avatar_id
        && a.key == b.key
        && a.version_number == b.version_number
        && a.segment_number == b.segment_number
}

fn dest_prefix(destination_exchange: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(destination_exchange.len() + 1);
    prefix.extend_from_slice(destination_exchange.as_bytes());
    prefix.push(KEY_SEP);
    prefix
}

/// Build the storage key. The big-endian timestamp directly after the
/// destination makes lexicographic order match age order.
fn hint_key(hint: &HandoffHint) -> Vec<u8> {
    let mut key = dest_prefix(&hint.destination_exchange);
    key.extend_from_slice(&hint.timestamp.to_be_bytes());
    key.extend_from_slice(&hint.avatar_id.to_be_bytes());
    key.push(hint.segment_number);
    key.extend_from_slice(hint.key.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(dest: &str, key: &str, timestamp: u64, segment: u8) -> HandoffHint {
        HandoffHint {
            timestamp,
            destination_exchange: dest.to_string(),
            avatar_id: 1,
            key: key.to_string(),
            version_number: 1,
            segment_number: segment,
        }
    }

    #[test]
    fn test_store_and_next_hint() {
        let repo = HintRepository::open_temporary().unwrap();
        let h = hint("storage-03", "k", 100, 3);

        assert!(repo.store(&h).unwrap());
        assert_eq!(repo.next_hint("storage-03").unwrap(), Some(h));
    }

    #[test]
    fn test_next_hint_empty_is_none() {
        let repo = HintRepository::open_temporary().unwrap();
        assert_eq!(repo.next_hint("storage-03").unwrap(), None);
    }

    #[test]
    fn test_duplicate_store_is_noop() {
        let repo = HintRepository::open_temporary().unwrap();
        let h = hint("storage-03", "k", 100, 3);

        assert!(repo.store(&h).unwrap());
        assert!(!repo.store(&h).unwrap());
        // Same tuple at a later time is still the same owed segment.
        assert!(!repo.store(&hint("storage-03", "k", 200, 3)).unwrap());
        assert_eq!(repo.count("storage-03").unwrap(), 1);
    }

    #[test]
    fn test_next_hint_oldest_first() {
        let repo = HintRepository::open_temporary().unwrap();
        repo.store(&hint("storage-03", "newer", 200, 1)).unwrap();
        repo.store(&hint("storage-03", "oldest", 50, 2)).unwrap();
        repo.store(&hint("storage-03", "middle", 100, 3)).unwrap();

        assert_eq!(repo.next_hint("storage-03").unwrap().unwrap().key, "oldest");
    }

    #[test]
    fn test_purge_removes_only_matching_tuple() {
        let repo = HintRepository::open_temporary().unwrap();
        let keep = hint("storage-03", "keep", 100, 1);
        let gone = hint("storage-03", "gone", 100, 2);
        repo.store(&keep).unwrap();
        repo.store(&gone).unwrap();

        repo.purge(&gone).unwrap();
        assert_eq!(repo.count("storage-03").unwrap(), 1);
        assert_eq!(repo.next_hint("storage-03").unwrap(), Some(keep));
    }

    #[test]
    fn test_destinations_are_isolated() {
        let repo = HintRepository::open_temporary().unwrap();
        repo.store(&hint("storage-03", "a", 100, 1)).unwrap();
        repo.store(&hint("storage-04", "b", 50, 1)).unwrap();

        assert_eq!(repo.next_hint("storage-03").unwrap().unwrap().key, "a");
        assert_eq!(repo.next_hint("storage-04").unwrap().unwrap().key, "b");
    }

    #[test]
    fn test_prefix_named_destination_does_not_bleed() {
        let repo = HintRepository::open_temporary().unwrap();
        repo.store(&hint("storage-1", "a", 100, 1)).unwrap();
        repo.store(&hint("storage-10", "b", 50, 1)).unwrap();

        assert_eq!(repo.count("storage-1").unwrap(), 1);
        assert_eq!(repo.next_hint("storage-1").unwrap().unwrap().key, "a");
    }

    #[test]
    fn test_hints_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_path_buf();
        let h = hint("storage-03", "durable", 100, 1);

        {
            let repo = HintRepository::open(&path).unwrap();
            repo.store(&h).unwrap();
        }
        {
            let repo = HintRepository::open(&path).unwrap();
            assert_eq!(repo.next_hint("storage-03").unwrap(), Some(h));
        }
    }
}
