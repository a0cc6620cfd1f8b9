//! [`MetaStore`] implementation wrapping a Fjall keyspace.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use strand_types::{AvatarId, ContentPointer, SegmentIdent, StatRecord, Timestamp};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Separator between the key and the segment number in a storage key.
/// 0xFF never occurs in UTF-8, so prefix scans over keys cannot bleed
/// into a longer key that happens to share a byte prefix.
const KEY_SEP: u8 = 0xFF;

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The pointer was written.
    Inserted {
        /// Segment bytes previously stored under this tuple
        /// (0 when absent or tombstoned).
        previous_size: u64,
    },
    /// The stored entry is at least as new; nothing was written.
    Stale,
}

/// Outcome of a destroy (tombstone) attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// A tombstone was written.
    Destroyed {
        /// Whole-object size previously recorded (0 when the entry was
        /// already a tombstone or absent).
        previous_total_size: u64,
    },
    /// The stored entry is strictly newer than the tombstone.
    TooOld,
}

/// A possibly-truncated listmatch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMatch {
    /// Matching keys in lexicographic order.
    pub keys: Vec<String>,
    /// False when the scan stopped at the limit with matches remaining.
    pub is_complete: bool,
}

/// Metadata store backed by Fjall.
///
/// One row per segment addressing tuple. All data here describes segments
/// physically present on this node (including stand-in copies held for a
/// down destination); it is never a view of the rest of the cluster.
pub struct MetaStore {
    /// The underlying Fjall database handle.
    #[allow(dead_code)]
    db: Database,
    /// `avatar (4 bytes BE) ++ key ++ 0xFF ++ segment` → serialized
    /// [`ContentPointer`].
    pointers: Keyspace,
}

impl MetaStore {
    /// Open a persistent MetaStore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary MetaStore that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self> {
        let pointers = db.keyspace("pointers", KeyspaceCreateOptions::default)?;
        Ok(Self { db, pointers })
    }

    // ----- Writes -----

    /// Insert a content pointer under last-writer-wins ordering.
    ///
    /// Rejected as [`InsertOutcome::Stale`] when the stored entry's
    /// timestamp is newer, or equally new and not a tombstone. An
    /// equal-timestamp write over a tombstone is accepted so that a
    /// retried write lands after its own destroy-and-rewrite.
    pub fn insert(&self, ident: &SegmentIdent, pointer: &ContentPointer) -> Result<InsertOutcome> {
        let storage_key = pointer_key(ident);

        let previous_size = match self.read_pointer(&storage_key)? {
            Some(existing) => {
                let stale = existing.timestamp > pointer.timestamp
                    || (existing.timestamp == pointer.timestamp && !existing.is_tombstone);
                if stale {
                    debug!(
                        avatar = ident.avatar_id,
                        key = %ident.key,
                        segment = ident.segment_number,
                        stored_ts = existing.timestamp,
                        incoming_ts = pointer.timestamp,
                        "rejected stale insert"
                    );
                    return Ok(InsertOutcome::Stale);
                }
                if existing.is_tombstone {
                    0
                } else {
                    existing.segment_size
                }
            }
            None => 0,
        };

        let value = postcard::to_allocvec(pointer)?;
        self.pointers.insert(storage_key.as_slice(), value.as_slice())?;
        Ok(InsertOutcome::Inserted { previous_size })
    }

    /// Write a tombstone at `timestamp`.
    ///
    /// Succeeds unless the stored entry is strictly newer. Destroying an
    /// absent tuple still writes the tombstone, so a write that arrives
    /// late (with an older timestamp) is rejected by [`insert`].
    ///
    /// [`insert`]: MetaStore::insert
    pub fn destroy(
        &self,
        ident: &SegmentIdent,
        timestamp: Timestamp,
    ) -> Result<DestroyOutcome> {
        let storage_key = pointer_key(ident);

        let previous_total_size = match self.read_pointer(&storage_key)? {
            Some(existing) if existing.timestamp > timestamp => {
                return Ok(DestroyOutcome::TooOld);
            }
            Some(existing) if !existing.is_tombstone => existing.total_size,
            _ => 0,
        };

        let tombstone =
            ContentPointer::tombstone(timestamp, ident.segment_number, ident.version_number);
        let value = postcard::to_allocvec(&tombstone)?;
        self.pointers.insert(storage_key.as_slice(), value.as_slice())?;
        debug!(
            avatar = ident.avatar_id,
            key = %ident.key,
            segment = ident.segment_number,
            previous_total_size,
            "wrote tombstone"
        );
        Ok(DestroyOutcome::Destroyed { previous_total_size })
    }

    /// Hard-delete a row, tombstone included. Absent rows are a no-op.
    pub fn purge(&self, ident: &SegmentIdent) -> Result<()> {
        self.pointers.remove(pointer_key(ident).as_slice())?;
        Ok(())
    }

    // ----- Reads -----

    /// Look up the stored pointer for a tuple, tombstones included.
    pub fn lookup(&self, ident: &SegmentIdent) -> Result<Option<ContentPointer>> {
        self.read_pointer(&pointer_key(ident))
    }

    /// Whole-object stat for one key.
    ///
    /// Scans every segment row this node holds for the key and reports
    /// the newest live pointer, or `None` when nothing live is stored.
    pub fn stat(&self, avatar_id: AvatarId, key: &str) -> Result<Option<StatRecord>> {
        let mut prefix = Vec::with_capacity(4 + key.len() + 1);
        prefix.extend_from_slice(&avatar_id.to_be_bytes());
        prefix.extend_from_slice(key.as_bytes());
        prefix.push(KEY_SEP);

        let mut best: Option<ContentPointer> = None;
        for guard in self.pointers.prefix(prefix.as_slice()) {
            let v = guard.value()?;
            let pointer: ContentPointer = postcard::from_bytes(&v)?;
            if pointer.is_tombstone {
                continue;
            }
            let newer = best
                .as_ref()
                .is_none_or(|b| pointer.timestamp > b.timestamp);
            if newer {
                best = Some(pointer);
            }
        }

        Ok(best.map(|p| StatRecord {
            timestamp: p.timestamp,
            total_size: p.total_size,
            file_checksum: p.file_checksum,
            version_number: p.version_number,
        }))
    }

    /// Prefix match over one avatar's live keys.
    ///
    /// Rows sort by key, so distinct keys come out deduplicated and
    /// already ordered. The scan stops after `limit` distinct keys and
    /// reports `is_complete: false` when more matched.
    pub fn list_match(
        &self,
        avatar_id: AvatarId,
        prefix: &str,
        limit: usize,
    ) -> Result<ListMatch> {
        let mut scan_prefix = Vec::with_capacity(4 + prefix.len());
        scan_prefix.extend_from_slice(&avatar_id.to_be_bytes());
        scan_prefix.extend_from_slice(prefix.as_bytes());

        let mut keys: Vec<String> = Vec::new();
        let mut is_complete = true;
        for guard in self.pointers.prefix(scan_prefix.as_slice()) {
            let (k, v) = guard.into_inner()?;
            let pointer: ContentPointer = postcard::from_bytes(&v)?;
            if pointer.is_tombstone {
                continue;
            }
            let Some(key) = parse_pointer_key(&k) else {
                continue;
            };
            if keys.last().is_some_and(|last| *last == key) {
                continue;
            }
            if keys.len() == limit {
                is_complete = false;
                break;
            }
            keys.push(key);
        }
        Ok(ListMatch { keys, is_complete })
    }

    /// Aggregate live segment bytes and row count for one avatar.
    pub fn space_usage(&self, avatar_id: AvatarId) -> Result<(u64, u64)> {
        let scan_prefix = avatar_id.to_be_bytes();

        let mut bytes = 0u64;
        let mut count = 0u64;
        for guard in self.pointers.prefix(scan_prefix.as_slice()) {
            let v = guard.value()?;
            let pointer: ContentPointer = postcard::from_bytes(&v)?;
            if pointer.is_tombstone {
                continue;
            }
            bytes += pointer.segment_size;
            count += 1;
        }
        Ok((bytes, count))
    }

    fn read_pointer(&self, storage_key: &[u8]) -> Result<Option<ContentPointer>> {
        match self.pointers.get(storage_key)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Build the storage key:
/// `avatar (4 bytes BE) ++ key ++ 0xFF ++ segment_number`.
fn pointer_key(ident: &SegmentIdent) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + ident.key.len() + 2);
    key.extend_from_slice(&ident.avatar_id.to_be_bytes());
    key.extend_from_slice(ident.key.as_bytes());
    key.push(KEY_SEP);
    key.push(ident.segment_number);
    key
}

/// Extract the object key from a storage key. Returns `None` for rows
/// that don't parse (which would indicate on-disk corruption).
fn parse_pointer_key(storage_key: &[u8]) -> Option<String> {
    let rest = storage_key.get(4..)?;
    let sep = rest.iter().rposition(|b| *b == KEY_SEP)?;
    String::from_utf8(rest[..sep].to_vec()).ok()
}
