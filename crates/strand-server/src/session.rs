//! In-memory streaming session state.
//!
//! Sessions are keyed by request id and live only for the duration of one
//! transfer. They are deliberately not persisted: a crash drops every
//! open session and the caller retries the whole operation under a fresh
//! request id.

use std::collections::HashMap;

use bytes::Bytes;
use strand_types::{ChecksumAccumulator, RequestId, SegmentIdent, Timestamp};
use tokio::sync::Mutex;

/// State of one in-flight inbound archive transfer.
pub(crate) struct ArchiveSession {
    pub ident: SegmentIdent,
    pub timestamp: Timestamp,
    /// Sequence number the next slice must carry.
    pub next_sequence: u32,
    /// Payload accumulated so far.
    pub buffer: Vec<u8>,
    /// Running adler32/md5 over the slices in order.
    pub checksums: ChecksumAccumulator,
}

/// State of one in-flight outbound retrieve transfer.
pub(crate) struct RetrieveSession {
    /// The whole segment payload, sliced on demand.
    pub data: Bytes,
    /// Slice size this session was opened with.
    pub slice_size: usize,
    /// Total number of slices.
    pub slice_count: u32,
    /// Sequence number the next request must carry.
    pub next_sequence: u32,
}

impl RetrieveSession {
    /// The byte range of slice `sequence`.
    pub fn slice(&self, sequence: u32) -> Bytes {
        let start = sequence as usize * self.slice_size;
        let end = (start + self.slice_size).min(self.data.len());
        self.data.slice(start..end)
    }
}

/// All open sessions of one node, keyed by request id.
///
/// A request id identifies exactly one logical transfer; opening a second
/// session under an id that is still live is rejected by the caller of
/// these maps.
#[derive(Default)]
pub struct SessionTable {
    pub(crate) archives: Mutex<HashMap<RequestId, ArchiveSession>>,
    pub(crate) retrieves: Mutex<HashMap<RequestId, RetrieveSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open sessions (both directions). For tests and logging.
    pub async fn open_count(&self) -> usize {
        self.archives.lock().await.len() + self.retrieves.lock().await.len()
    }
}
