//! File-based segment storage backend.
//!
//! Stores one file per segment payload:
//! `{base_dir}/{avatar_id}/{hex(key)}/v{version}-s{segment}`.
//!
//! The key is hex-encoded in the path because object keys may contain
//! path separators or other characters unsafe in file names.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use strand_types::{AvatarId, SegmentIdent};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{SegmentStore, StoreUsage};

/// File-based segment store with a per-avatar, per-key directory layout.
///
/// Writes are atomic: data is written to a temporary file first, then
/// renamed into place. This prevents partial payloads from surviving a
/// crash mid-write.
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Directory holding every version and segment of one key.
    fn key_dir(&self, avatar_id: AvatarId, key: &str) -> PathBuf {
        self.base_dir
            .join(avatar_id.to_string())
            .join(hex_encode(key.as_bytes()))
    }

    /// Compute the full file path for a segment ident.
    fn segment_path(&self, ident: &SegmentIdent) -> PathBuf {
        // No dot in the name so the `.tmp` staging path stays unique
        // per segment.
        self.key_dir(ident.avatar_id, &ident.key).join(format!(
            "v{}-s{}",
            ident.version_number, ident.segment_number
        ))
    }
}

#[async_trait::async_trait]
impl SegmentStore for FileStore {
    async fn put(&self, ident: &SegmentIdent, data: Bytes) -> Result<(), StoreError> {
        let path = self.segment_path(ident);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic write: write to a temp file in the same directory, then rename.
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(
            avatar = ident.avatar_id,
            key = %ident.key,
            version = ident.version_number,
            segment = ident.segment_number,
            size = data.len(),
            "stored segment to file"
        );
        Ok(())
    }

    async fn get(&self, ident: &SegmentIdent) -> Result<Option<Bytes>, StoreError> {
        let path = self.segment_path(ident);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete(&self, ident: &SegmentIdent) -> Result<(), StoreError> {
        let path = self.segment_path(ident);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn contains(&self, ident: &SegmentIdent) -> Result<bool, StoreError> {
        let path = self.segment_path(ident);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn delete_key(&self, avatar_id: AvatarId, key: &str) -> Result<u64, StoreError> {
        let dir = self.key_dir(avatar_id, key);

        let mut removed = 0u64;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                removed += 1;
            }
        }
        tokio::fs::remove_dir_all(&dir).await?;

        debug!(avatar = avatar_id, %key, removed, "purged segment directory");
        Ok(removed)
    }

    async fn usage(&self) -> Result<StoreUsage, StoreError> {
        let mut usage = StoreUsage::default();

        // Walk base/{avatar}/{hexkey}/{v.s} counting payload files.
        let mut avatars = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(avatar_dir) = avatars.next_entry().await? {
            if !avatar_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut keys = tokio::fs::read_dir(avatar_dir.path()).await?;
            while let Some(key_dir) = keys.next_entry().await? {
                if !key_dir.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(key_dir.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if meta.is_file() {
                        usage.bytes_stored += meta.len();
                        usage.segment_count += 1;
                    }
                }
            }
        }
        Ok(usage)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
