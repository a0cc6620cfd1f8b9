//! Protocol messages for the Strand coordination layer.
//!
//! One typed [`Message`] enum covers every request, reply, and broadcast;
//! messages are postcard-serialized with a 4-byte length prefix on QUIC
//! streams. Every request carries a [`RequestId`]; every reply carries a
//! [`ResultCode`] and, on failure, an `error_message` from the remote.

use serde::{Deserialize, Serialize};
use strand_types::{
    AvatarId, Checksum, ContentPointer, HandoffHint, RequestId, SegmentIdent, StatRecord,
    Timestamp,
};

/// Whole-file and per-segment facts a retrieve start reply carries so the
/// caller knows how many slices to expect and how to verify them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveMeta {
    /// Write time of the stored segment.
    pub timestamp: Timestamp,
    /// Bytes of the whole original object.
    pub total_size: u64,
    /// Whole-file checksums.
    pub file_checksum: Checksum,
    /// Bytes stored for this segment.
    pub segment_size: u64,
    /// Checksums of this segment's bytes.
    pub segment_checksum: Checksum,
    /// Stored version.
    pub version_number: strand_types::VersionNumber,
    /// How many slices the transfer spans (1 means the start reply
    /// already carried everything).
    pub slice_count: u32,
}

/// Node liveness broadcast states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatusKind {
    /// Node is up. Re-announced periodically; doubles as the heartbeat.
    Startup,
    /// Node is shutting down cleanly.
    Shutdown,
}

/// Protocol messages exchanged between Strand nodes.
///
/// Requests are sent on bi-directional streams and answered in place;
/// [`Message::ProcessStatus`] is broadcast on uni-directional streams
/// with no reply. An unrecognized or unhandled kind is logged and
/// dropped by the receiver, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // -- archive (write path, §streaming) --
    /// Archive a segment that fits in one message.
    ArchiveKeyEntire {
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
        total_size: u64,
        file_checksum: Checksum,
        segment_checksum: Checksum,
        data: Vec<u8>,
    },
    ArchiveKeyEntireReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        /// Size of whatever was previously stored for this segment (0 if none).
        previous_size: u64,
        error_message: Option<String>,
    },
    /// First slice of a multi-message archive; opens a session.
    ArchiveKeyStart {
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
        sequence: u32,
        data: Vec<u8>,
    },
    /// Interior slice; `sequence` must increase by exactly one.
    ArchiveKeyNext {
        request_id: RequestId,
        sequence: u32,
        data: Vec<u8>,
    },
    /// Last slice plus caller-computed whole-file facts; closes the session.
    ArchiveKeyFinal {
        request_id: RequestId,
        sequence: u32,
        total_size: u64,
        file_checksum: Checksum,
        segment_checksum: Checksum,
        data: Vec<u8>,
    },
    ArchiveKeyStartReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        error_message: Option<String>,
    },
    ArchiveKeyNextReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        error_message: Option<String>,
    },
    ArchiveKeyFinalReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        /// Size of whatever was previously stored for this segment (0 if none).
        previous_size: u64,
        error_message: Option<String>,
    },

    // -- retrieve (read path) --
    /// Open a retrieve session; the reply carries slice 0 and the counts.
    RetrieveKeyStart {
        request_id: RequestId,
        ident: SegmentIdent,
    },
    /// Fetch an interior slice.
    RetrieveKeyNext {
        request_id: RequestId,
        sequence: u32,
    },
    /// Fetch the last slice; closes the session.
    RetrieveKeyFinal {
        request_id: RequestId,
        sequence: u32,
    },
    RetrieveKeyStartReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        meta: Option<RetrieveMeta>,
        data: Vec<u8>,
        error_message: Option<String>,
    },
    RetrieveKeyNextReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        data: Vec<u8>,
        error_message: Option<String>,
    },
    RetrieveKeyFinalReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        data: Vec<u8>,
        error_message: Option<String>,
    },

    // -- destroy / purge --
    /// Write a tombstone for a segment.
    DestroyKey {
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
    },
    DestroyKeyReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        /// Previously stored total size (0 for tombstone-over-tombstone).
        total_size: u64,
        error_message: Option<String>,
    },
    /// Hard-delete a segment and its pointer (no tombstone).
    PurgeKey {
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
    },
    PurgeKeyReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        error_message: Option<String>,
    },

    // -- hinted handoff --
    /// Record that a segment written here is owed to a down destination.
    HintedHandoff {
        request_id: RequestId,
        hint: HandoffHint,
    },
    HintedHandoffReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        error_message: Option<String>,
    },

    // -- metadata store operations --
    /// Insert a content pointer directly (no payload transfer).
    DatabaseKeyInsert {
        request_id: RequestId,
        ident: SegmentIdent,
        pointer: ContentPointer,
    },
    DatabaseKeyInsertReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        previous_size: u64,
        error_message: Option<String>,
    },
    DatabaseKeyLookup {
        request_id: RequestId,
        ident: SegmentIdent,
    },
    DatabaseKeyLookupReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        pointer: Option<ContentPointer>,
        error_message: Option<String>,
    },
    DatabaseKeyDestroy {
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
    },
    DatabaseKeyDestroyReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        total_size: u64,
        error_message: Option<String>,
    },
    DatabaseKeyPurge {
        request_id: RequestId,
        ident: SegmentIdent,
    },
    DatabaseKeyPurgeReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        error_message: Option<String>,
    },
    /// Prefix match over one avatar's keys.
    DatabaseListMatch {
        request_id: RequestId,
        avatar_id: AvatarId,
        prefix: String,
    },
    DatabaseListMatchReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        /// False when the result was truncated at the server's limit.
        is_complete: bool,
        keys: Vec<String>,
        error_message: Option<String>,
    },

    // -- stat / accounting --
    /// Whole-file stat for one key.
    Stat {
        request_id: RequestId,
        avatar_id: AvatarId,
        path: String,
    },
    StatReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        record: Option<StatRecord>,
        error_message: Option<String>,
    },
    /// Aggregated byte counters for one avatar.
    SpaceUsage {
        request_id: RequestId,
        avatar_id: AvatarId,
    },
    SpaceUsageReply {
        request_id: RequestId,
        result: strand_types::ResultCode,
        bytes_stored: u64,
        segment_count: u64,
        error_message: Option<String>,
    },

    // -- liveness broadcast (no reply) --
    /// Node status announcement; periodic `Startup` re-announce is the
    /// heartbeat the liveness tracker watches for.
    ProcessStatus {
        timestamp: Timestamp,
        /// Exchange name of the announcing node.
        exchange: String,
        /// Reply-routing identity of the announcing node.
        routing_header: String,
        status: ProcessStatusKind,
    },
}

impl Message {
    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ArchiveKeyEntire { .. } => "archive-key-entire",
            Message::ArchiveKeyEntireReply { .. } => "archive-key-entire-reply",
            Message::ArchiveKeyStart { .. } => "archive-key-start",
            Message::ArchiveKeyNext { .. } => "archive-key-next",
            Message::ArchiveKeyFinal { .. } => "archive-key-final",
            Message::ArchiveKeyStartReply { .. } => "archive-key-start-reply",
            Message::ArchiveKeyNextReply { .. } => "archive-key-next-reply",
            Message::ArchiveKeyFinalReply { .. } => "archive-key-final-reply",
            Message::RetrieveKeyStart { .. } => "retrieve-key-start",
            Message::RetrieveKeyNext { .. } => "retrieve-key-next",
            Message::RetrieveKeyFinal { .. } => "retrieve-key-final",
            Message::RetrieveKeyStartReply { .. } => "retrieve-key-start-reply",
            Message::RetrieveKeyNextReply { .. } => "retrieve-key-next-reply",
            Message::RetrieveKeyFinalReply { .. } => "retrieve-key-final-reply",
            Message::DestroyKey { .. } => "destroy-key",
            Message::DestroyKeyReply { .. } => "destroy-key-reply",
            Message::PurgeKey { .. } => "purge-key",
            Message::PurgeKeyReply { .. } => "purge-key-reply",
            Message::HintedHandoff { .. } => "hinted-handoff",
            Message::HintedHandoffReply { .. } => "hinted-handoff-reply",
            Message::DatabaseKeyInsert { .. } => "database-key-insert",
            Message::DatabaseKeyInsertReply { .. } => "database-key-insert-reply",
            Message::DatabaseKeyLookup { .. } => "database-key-lookup",
            Message::DatabaseKeyLookupReply { .. } => "database-key-lookup-reply",
            Message::DatabaseKeyDestroy { .. } => "database-key-destroy",
            Message::DatabaseKeyDestroyReply { .. } => "database-key-destroy-reply",
            Message::DatabaseKeyPurge { .. } => "database-key-purge",
            Message::DatabaseKeyPurgeReply { .. } => "database-key-purge-reply",
            Message::DatabaseListMatch { .. } => "database-list-match",
            Message::DatabaseListMatchReply { .. } => "database-list-match-reply",
            Message::Stat { .. } => "stat",
            Message::StatReply { .. } => "stat-reply",
            Message::SpaceUsage { .. } => "space-usage",
            Message::SpaceUsageReply { .. } => "space-usage-reply",
            Message::ProcessStatus { .. } => "process-status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_types::ResultCode;

    fn ident() -> SegmentIdent {
        SegmentIdent {
            avatar_id: 1001,
            key: "docs/report.pdf".to_string(),
            version_number: 1,
            segment_number: 3,
        }
    }

    #[test]
    fn test_archive_entire_roundtrip_postcard() {
        let msg = Message::ArchiveKeyEntire {
            request_id: RequestId::random(),
            ident: ident(),
            timestamp: 1_700_000_000_000,
            total_size: 4096,
            file_checksum: Checksum::of(b"file"),
            segment_checksum: Checksum::of(b"seg"),
            data: vec![7u8; 512],
        };
        let encoded = postcard::to_allocvec(&msg).unwrap();
        let decoded: Message = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_retrieve_start_reply_roundtrip_postcard() {
        let msg = Message::RetrieveKeyStartReply {
            request_id: RequestId::random(),
            result: ResultCode::Success,
            meta: Some(RetrieveMeta {
                timestamp: 42,
                total_size: 1024,
                file_checksum: Checksum::of(b"f"),
                segment_size: 128,
                segment_checksum: Checksum::of(b"s"),
                version_number: 1,
                slice_count: 3,
            }),
            data: vec![1, 2, 3],
            error_message: None,
        };
        let encoded = postcard::to_allocvec(&msg).unwrap();
        let decoded: Message = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_process_status_roundtrip_postcard() {
        let msg = Message::ProcessStatus {
            timestamp: 9,
            exchange: "storage-01".to_string(),
            routing_header: "storage-01.reply".to_string(),
            status: ProcessStatusKind::Shutdown,
        };
        let encoded = postcard::to_allocvec(&msg).unwrap();
        let decoded: Message = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(msg.kind(), "process-status");
    }
}
