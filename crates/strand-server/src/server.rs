//! [`NodeServer`]: dispatches every inbound message to storage,
//! metadata, and hint handling.

use std::sync::Arc;

use bytes::Bytes;
use strand_hints::HintRepository;
use strand_meta::{DestroyOutcome, InsertOutcome, MetaStore};
use strand_net::{Message, ProcessStatusKind, RetrieveMeta};
use strand_nodeset::NodeTable;
use strand_store::SegmentStore;
use strand_types::{
    Checksum, ChecksumAccumulator, ContentPointer, HandoffHint, NodeRef, RequestId, ResultCode,
    SegmentIdent, Timestamp,
};
use tracing::{debug, warn};

use crate::session::{ArchiveSession, RetrieveSession, SessionTable};

/// Most keys a single listmatch reply will carry; longer results are
/// truncated with `is_complete: false`.
pub const LIST_MATCH_LIMIT: usize = 1000;

/// The message handler of one storage node.
///
/// Owns the streaming session table; storage, metadata, and hints are
/// shared with the rest of the daemon. Every request produces exactly one
/// reply; failures are mapped to a [`ResultCode`] and an `error_message`
/// rather than closing the stream.
pub struct NodeServer {
    exchange: String,
    store: Arc<dyn SegmentStore>,
    meta: Arc<MetaStore>,
    hints: Arc<HintRepository>,
    table: Arc<NodeTable>,
    slice_size: usize,
    sessions: SessionTable,
}

impl NodeServer {
    pub fn new(
        exchange: impl Into<String>,
        store: Arc<dyn SegmentStore>,
        meta: Arc<MetaStore>,
        hints: Arc<HintRepository>,
        table: Arc<NodeTable>,
        slice_size: usize,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            store,
            meta,
            hints,
            table,
            slice_size,
            sessions: SessionTable::new(),
        }
    }

    /// This node's exchange name.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Open streaming sessions (for tests and logging).
    pub async fn open_sessions(&self) -> usize {
        self.sessions.open_count().await
    }

    /// Handle one inbound message. Returns the reply, or `None` for
    /// broadcasts and unhandled kinds.
    pub async fn handle(&self, msg: Message) -> Option<Message> {
        debug!(node = %self.exchange, kind = msg.kind(), "handling message");
        match msg {
            Message::ArchiveKeyEntire {
                request_id,
                ident,
                timestamp,
                total_size,
                file_checksum,
                segment_checksum,
                data,
            } => Some(
                self.archive_entire(
                    request_id,
                    ident,
                    timestamp,
                    total_size,
                    file_checksum,
                    segment_checksum,
                    data,
                )
                .await,
            ),
            Message::ArchiveKeyStart {
                request_id,
                ident,
                timestamp,
                sequence,
                data,
            } => Some(
                self.archive_start(request_id, ident, timestamp, sequence, data)
                    .await,
            ),
            Message::ArchiveKeyNext {
                request_id,
                sequence,
                data,
            } => Some(self.archive_next(request_id, sequence, data).await),
            Message::ArchiveKeyFinal {
                request_id,
                sequence,
                total_size,
                file_checksum,
                segment_checksum,
                data,
            } => Some(
                self.archive_final(
                    request_id,
                    sequence,
                    total_size,
                    file_checksum,
                    segment_checksum,
                    data,
                )
                .await,
            ),
            Message::RetrieveKeyStart { request_id, ident } => {
                Some(self.retrieve_start(request_id, ident).await)
            }
            Message::RetrieveKeyNext {
                request_id,
                sequence,
            } => Some(self.retrieve_next(request_id, sequence).await),
            Message::RetrieveKeyFinal {
                request_id,
                sequence,
            } => Some(self.retrieve_final(request_id, sequence).await),
            Message::DestroyKey {
                request_id,
                ident,
                timestamp,
            } => Some(self.destroy_key(request_id, ident, timestamp).await),
            Message::PurgeKey {
                request_id, ident, ..
            } => Some(self.purge_key(request_id, ident).await),
            Message::HintedHandoff { request_id, hint } => {
                Some(self.hinted_handoff(request_id, hint))
            }
            Message::DatabaseKeyInsert {
                request_id,
                ident,
                pointer,
            } => Some(self.db_insert(request_id, ident, pointer)),
            Message::DatabaseKeyLookup { request_id, ident } => {
                Some(self.db_lookup(request_id, ident))
            }
            Message::DatabaseKeyDestroy {
                request_id,
                ident,
                timestamp,
            } => Some(self.db_destroy(request_id, ident, timestamp)),
            Message::DatabaseKeyPurge { request_id, ident } => {
                Some(self.db_purge(request_id, ident))
            }
            Message::DatabaseListMatch {
                request_id,
                avatar_id,
                prefix,
            } => Some(self.db_list_match(request_id, avatar_id, &prefix)),
            Message::Stat {
                request_id,
                avatar_id,
                path,
            } => Some(self.stat(request_id, avatar_id, &path)),
            Message::SpaceUsage {
                request_id,
                avatar_id,
            } => Some(self.space_usage(request_id, avatar_id)),
            Message::ProcessStatus {
                exchange, status, ..
            } => {
                self.process_status(&exchange, status).await;
                None
            }
            other => {
                warn!(node = %self.exchange, kind = other.kind(), "unhandled message kind, dropping");
                None
            }
        }
    }

    // -------------------------------------------------------------------
    // Archive path
    // -------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn archive_entire(
        &self,
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
        total_size: u64,
        file_checksum: Checksum,
        segment_checksum: Checksum,
        data: Vec<u8>,
    ) -> Message {
        let reply = |result, previous_size, error_message| Message::ArchiveKeyEntireReply {
            request_id,
            result,
            previous_size,
            error_message,
        };

        if Checksum::of(&data) != segment_checksum {
            return reply(
                ResultCode::Internal,
                0,
                Some("segment checksum mismatch".to_string()),
            );
        }

        let pointer = ContentPointer {
            timestamp,
            is_tombstone: false,
            segment_number: ident.segment_number,
            segment_size: data.len() as u64,
            total_size,
            file_checksum,
            segment_checksum,
            version_number: ident.version_number,
        };
        match self.persist_segment(&ident, &pointer, Bytes::from(data)).await {
            Ok(Some(previous_size)) => reply(ResultCode::Success, previous_size, None),
            Ok(None) => reply(ResultCode::InvalidDuplicate, 0, None),
            Err(e) => reply(ResultCode::Internal, 0, Some(e)),
        }
    }

    async fn archive_start(
        &self,
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
        sequence: u32,
        data: Vec<u8>,
    ) -> Message {
        let reply = |result, error_message| Message::ArchiveKeyStartReply {
            request_id,
            result,
            error_message,
        };

        if sequence != 0 {
            return reply(ResultCode::OutOfSequence, None);
        }

        let mut archives = self.sessions.archives.lock().await;
        if archives.contains_key(&request_id) {
            return reply(ResultCode::InvalidDuplicate, None);
        }

        let mut checksums = ChecksumAccumulator::new();
        checksums.update(&data);
        archives.insert(
            request_id,
            ArchiveSession {
                ident,
                timestamp,
                next_sequence: 1,
                buffer: data,
                checksums,
            },
        );
        reply(ResultCode::Success, None)
    }

    async fn archive_next(&self, request_id: RequestId, sequence: u32, data: Vec<u8>) -> Message {
        let reply = |result, error_message| Message::ArchiveKeyNextReply {
            request_id,
            result,
            error_message,
        };

        let mut archives = self.sessions.archives.lock().await;
        let Some(session) = archives.get_mut(&request_id) else {
            return reply(ResultCode::NotFound, None);
        };
        if sequence != session.next_sequence {
            // A bad sequence poisons the whole transfer; the caller
            // retries under a fresh request id.
            archives.remove(&request_id);
            return reply(ResultCode::OutOfSequence, None);
        }
        session.next_sequence += 1;
        session.checksums.update(&data);
        session.buffer.extend_from_slice(&data);
        reply(ResultCode::Success, None)
    }

    async fn archive_final(
        &self,
        request_id: RequestId,
        sequence: u32,
        total_size: u64,
        file_checksum: Checksum,
        segment_checksum: Checksum,
        data: Vec<u8>,
    ) -> Message {
        let reply = |result, previous_size, error_message| Message::ArchiveKeyFinalReply {
            request_id,
            result,
            previous_size,
            error_message,
        };

        let mut session = {
            let mut archives = self.sessions.archives.lock().await;
            let Some(session) = archives.get(&request_id) else {
                return reply(ResultCode::NotFound, 0, None);
            };
            if sequence != session.next_sequence {
                archives.remove(&request_id);
                return reply(ResultCode::OutOfSequence, 0, None);
            }
            archives.remove(&request_id).expect("checked above")
        };

        session.checksums.update(&data);
        session.buffer.extend_from_slice(&data);
        if session.checksums.clone().finish() != segment_checksum {
            return reply(
                ResultCode::Internal,
                0,
                Some("segment checksum mismatch".to_string()),
            );
        }

        let pointer = ContentPointer {
            timestamp: session.timestamp,
            is_tombstone: false,
            segment_number: session.ident.segment_number,
            segment_size: session.buffer.len() as u64,
            total_size,
            file_checksum,
            segment_checksum,
            version_number: session.ident.version_number,
        };
        let data = Bytes::from(std::mem::take(&mut session.buffer));
        match self.persist_segment(&session.ident, &pointer, data).await {
            Ok(Some(previous_size)) => reply(ResultCode::Success, previous_size, None),
            Ok(None) => reply(ResultCode::InvalidDuplicate, 0, None),
            Err(e) => reply(ResultCode::Internal, 0, Some(e)),
        }
    }

    /// Run the metadata ordering decision, then persist the payload.
    ///
    /// `Ok(Some(previous_size))` on success, `Ok(None)` when the write is
    /// stale, `Err` with a message on storage failure.
    async fn persist_segment(
        &self,
        ident: &SegmentIdent,
        pointer: &ContentPointer,
        data: Bytes,
    ) -> Result<Option<u64>, String> {
        match self.meta.insert(ident, pointer) {
            Ok(InsertOutcome::Inserted { previous_size }) => {
                self.store
                    .put(ident, data)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Some(previous_size))
            }
            Ok(InsertOutcome::Stale) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    // -------------------------------------------------------------------
    // Retrieve path
    // -------------------------------------------------------------------

    async fn retrieve_start(&self, request_id: RequestId, ident: SegmentIdent) -> Message {
        let reply = |result, meta, data, error_message| Message::RetrieveKeyStartReply {
            request_id,
            result,
            meta,
            data,
            error_message,
        };

        let pointer = match self.meta.lookup(&ident) {
            Ok(Some(p)) if !p.is_tombstone => p,
            Ok(_) => return reply(ResultCode::NotFound, None, Vec::new(), None),
            Err(e) => {
                return reply(ResultCode::Internal, None, Vec::new(), Some(e.to_string()));
            }
        };
        let data = match self.store.get(&ident).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                return reply(
                    ResultCode::Internal,
                    None,
                    Vec::new(),
                    Some("segment payload missing".to_string()),
                );
            }
            Err(e) => {
                return reply(ResultCode::Internal, None, Vec::new(), Some(e.to_string()));
            }
        };

        let slice_count = data.len().div_ceil(self.slice_size).max(1) as u32;
        let meta = RetrieveMeta {
            timestamp: pointer.timestamp,
            total_size: pointer.total_size,
            file_checksum: pointer.file_checksum,
            segment_size: pointer.segment_size,
            segment_checksum: pointer.segment_checksum,
            version_number: pointer.version_number,
            slice_count,
        };

        if slice_count == 1 {
            return reply(ResultCode::Success, Some(meta), data.to_vec(), None);
        }

        let session = RetrieveSession {
            data,
            slice_size: self.slice_size,
            slice_count,
            next_sequence: 1,
        };
        let first = session.slice(0).to_vec();
        let mut retrieves = self.sessions.retrieves.lock().await;
        if retrieves.contains_key(&request_id) {
            return reply(ResultCode::InvalidDuplicate, None, Vec::new(), None);
        }
        retrieves.insert(request_id, session);
        reply(ResultCode::Success, Some(meta), first, None)
    }

    async fn retrieve_next(&self, request_id: RequestId, sequence: u32) -> Message {
        let reply = |result, data, error_message| Message::RetrieveKeyNextReply {
            request_id,
            result,
            data,
            error_message,
        };

        let mut retrieves = self.sessions.retrieves.lock().await;
        let Some(session) = retrieves.get_mut(&request_id) else {
            return reply(ResultCode::NotFound, Vec::new(), None);
        };
        // Interior slices only; the last one must come through Final.
        if sequence != session.next_sequence || sequence + 1 >= session.slice_count {
            retrieves.remove(&request_id);
            return reply(ResultCode::OutOfSequence, Vec::new(), None);
        }
        session.next_sequence += 1;
        let data = session.slice(sequence).to_vec();
        reply(ResultCode::Success, data, None)
    }

    async fn retrieve_final(&self, request_id: RequestId, sequence: u32) -> Message {
        let reply = |result, data, error_message| Message::RetrieveKeyFinalReply {
            request_id,
            result,
            data,
            error_message,
        };

        let mut retrieves = self.sessions.retrieves.lock().await;
        let Some(session) = retrieves.get(&request_id) else {
            return reply(ResultCode::NotFound, Vec::new(), None);
        };
        if sequence != session.next_sequence || sequence + 1 != session.slice_count {
            retrieves.remove(&request_id);
            return reply(ResultCode::OutOfSequence, Vec::new(), None);
        }
        let session = retrieves.remove(&request_id).expect("checked above");
        reply(ResultCode::Success, session.slice(sequence).to_vec(), None)
    }

    // -------------------------------------------------------------------
    // Destroy / purge / hints
    // -------------------------------------------------------------------

    async fn destroy_key(
        &self,
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
    ) -> Message {
        let reply = |result, total_size, error_message| Message::DestroyKeyReply {
            request_id,
            result,
            total_size,
            error_message,
        };

        match self.meta.destroy(&ident, timestamp) {
            Ok(DestroyOutcome::Destroyed {
                previous_total_size,
            }) => {
                // Drop every locally held payload for the key; the
                // tombstone row is what survives.
                if let Err(e) = self.store.delete_key(ident.avatar_id, &ident.key).await {
                    return reply(ResultCode::Internal, 0, Some(e.to_string()));
                }
                reply(ResultCode::Success, previous_total_size, None)
            }
            Ok(DestroyOutcome::TooOld) => reply(ResultCode::TooOld, 0, None),
            Err(e) => reply(ResultCode::Internal, 0, Some(e.to_string())),
        }
    }

    async fn purge_key(&self, request_id: RequestId, ident: SegmentIdent) -> Message {
        let reply = |result, error_message| Message::PurgeKeyReply {
            request_id,
            result,
            error_message,
        };

        if let Err(e) = self.meta.purge(&ident) {
            return reply(ResultCode::Internal, Some(e.to_string()));
        }
        if let Err(e) = self.store.delete(&ident).await {
            return reply(ResultCode::Internal, Some(e.to_string()));
        }
        reply(ResultCode::Success, None)
    }

    fn hinted_handoff(&self, request_id: RequestId, hint: HandoffHint) -> Message {
        let reply = |result, error_message| Message::HintedHandoffReply {
            request_id,
            result,
            error_message,
        };

        match self.hints.store(&hint) {
            // A duplicate is the same owed segment already on file.
            Ok(_) => reply(ResultCode::Success, None),
            Err(e) => reply(ResultCode::Internal, Some(e.to_string())),
        }
    }

    // -------------------------------------------------------------------
    // Metadata operations
    // -------------------------------------------------------------------

    fn db_insert(
        &self,
        request_id: RequestId,
        ident: SegmentIdent,
        pointer: ContentPointer,
    ) -> Message {
        let reply = |result, previous_size, error_message| Message::DatabaseKeyInsertReply {
            request_id,
            result,
            previous_size,
            error_message,
        };

        match self.meta.insert(&ident, &pointer) {
            Ok(InsertOutcome::Inserted { previous_size }) => {
                reply(ResultCode::Success, previous_size, None)
            }
            Ok(InsertOutcome::Stale) => reply(ResultCode::InvalidDuplicate, 0, None),
            Err(e) => reply(ResultCode::Internal, 0, Some(e.to_string())),
        }
    }

    fn db_lookup(&self, request_id: RequestId, ident: SegmentIdent) -> Message {
        let reply = |result, pointer, error_message| Message::DatabaseKeyLookupReply {
            request_id,
            result,
            pointer,
            error_message,
        };

        match self.meta.lookup(&ident) {
            Ok(Some(pointer)) => reply(ResultCode::Success, Some(pointer), None),
            Ok(None) => reply(ResultCode::NotFound, None, None),
            Err(e) => reply(ResultCode::Internal, None, Some(e.to_string())),
        }
    }

    fn db_destroy(
        &self,
        request_id: RequestId,
        ident: SegmentIdent,
        timestamp: Timestamp,
    ) -> Message {
        let reply = |result, total_size, error_message| Message::DatabaseKeyDestroyReply {
            request_id,
            result,
            total_size,
            error_message,
        };

        match self.meta.destroy(&ident, timestamp) {
            Ok(DestroyOutcome::Destroyed {
                previous_total_size,
            }) => reply(ResultCode::Success, previous_total_size, None),
            Ok(DestroyOutcome::TooOld) => reply(ResultCode::TooOld, 0, None),
            Err(e) => reply(ResultCode::Internal, 0, Some(e.to_string())),
        }
    }

    fn db_purge(&self, request_id: RequestId, ident: SegmentIdent) -> Message {
        let reply = |result, error_message| Message::DatabaseKeyPurgeReply {
            request_id,
            result,
            error_message,
        };

        match self.meta.purge(&ident) {
            Ok(()) => reply(ResultCode::Success, None),
            Err(e) => reply(ResultCode::Internal, Some(e.to_string())),
        }
    }

    fn db_list_match(&self, request_id: RequestId, avatar_id: u32, prefix: &str) -> Message {
        let reply =
            |result, is_complete, keys, error_message| Message::DatabaseListMatchReply {
                request_id,
                result,
                is_complete,
                keys,
                error_message,
            };

        match self.meta.list_match(avatar_id, prefix, LIST_MATCH_LIMIT) {
            Ok(matched) => reply(ResultCode::Success, matched.is_complete, matched.keys, None),
            Err(e) => reply(ResultCode::Internal, true, Vec::new(), Some(e.to_string())),
        }
    }

    fn stat(&self, request_id: RequestId, avatar_id: u32, path: &str) -> Message {
        let reply = |result, record, error_message| Message::StatReply {
            request_id,
            result,
            record,
            error_message,
        };

        match self.meta.stat(avatar_id, path) {
            Ok(Some(record)) => reply(ResultCode::Success, Some(record), None),
            Ok(None) => reply(ResultCode::NotFound, None, None),
            Err(e) => reply(ResultCode::Internal, None, Some(e.to_string())),
        }
    }

    fn space_usage(&self, request_id: RequestId, avatar_id: u32) -> Message {
        let reply =
            |result, bytes_stored, segment_count, error_message| Message::SpaceUsageReply {
                request_id,
                result,
                bytes_stored,
                segment_count,
                error_message,
            };

        match self.meta.space_usage(avatar_id) {
            Ok((bytes_stored, segment_count)) => {
                reply(ResultCode::Success, bytes_stored, segment_count, None)
            }
            Err(e) => reply(ResultCode::Internal, 0, 0, Some(e.to_string())),
        }
    }

    // -------------------------------------------------------------------
    // Liveness
    // -------------------------------------------------------------------

    async fn process_status(&self, exchange: &str, status: ProcessStatusKind) {
        match status {
            ProcessStatusKind::Startup => {
                self.table.record_heartbeat(exchange).await;
            }
            ProcessStatusKind::Shutdown => {
                self.table.mark_down(&NodeRef::new(exchange)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strand_store::MemoryStore;

    use super::*;

    fn server() -> NodeServer {
        let table = NodeTable::new(
            vec![NodeRef::new("storage-01"), NodeRef::new("storage-02")],
            2,
        );
        NodeServer::new(
            "storage-01",
            Arc::new(MemoryStore::new(64 * 1024 * 1024)),
            Arc::new(MetaStore::open_temporary().unwrap()),
            Arc::new(HintRepository::open_temporary().unwrap()),
            table,
            1024,
        )
    }

    fn ident(key: &str) -> SegmentIdent {
        SegmentIdent {
            avatar_id: 1,
            key: key.to_string(),
            version_number: 1,
            segment_number: 1,
        }
    }

    fn entire(request_id: RequestId, key: &str, timestamp: u64, data: &[u8]) -> Message {
        Message::ArchiveKeyEntire {
            request_id,
            ident: ident(key),
            timestamp,
            total_size: data.len() as u64 * 4,
            file_checksum: Checksum::of(b"whole file"),
            segment_checksum: Checksum::of(data),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_entire_archive_then_retrieve() {
        let srv = server();
        let data = b"small segment";

        let reply = srv
            .handle(entire(RequestId::random(), "k", 100, data))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyEntireReply {
                result: ResultCode::Success,
                previous_size: 0,
                ..
            }
        ));

        let reply = srv
            .handle(Message::RetrieveKeyStart {
                request_id: RequestId::random(),
                ident: ident("k"),
            })
            .await
            .unwrap();
        match reply {
            Message::RetrieveKeyStartReply {
                result,
                meta,
                data: got,
                ..
            } => {
                assert_eq!(result, ResultCode::Success);
                assert_eq!(meta.unwrap().slice_count, 1);
                assert_eq!(got, data.to_vec());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_entire_archive_rejected() {
        let srv = server();
        srv.handle(entire(RequestId::random(), "k", 200, b"newer"))
            .await
            .unwrap();
        let reply = srv
            .handle(entire(RequestId::random(), "k", 100, b"older"))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyEntireReply {
                result: ResultCode::InvalidDuplicate,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rejected() {
        let srv = server();
        let reply = srv
            .handle(Message::ArchiveKeyEntire {
                request_id: RequestId::random(),
                ident: ident("k"),
                timestamp: 100,
                total_size: 10,
                file_checksum: Checksum::of(b"file"),
                segment_checksum: Checksum::of(b"not the payload"),
                data: b"payload".to_vec(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyEntireReply {
                result: ResultCode::Internal,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_streaming_archive_roundtrip() {
        let srv = server();
        let request_id = RequestId::random();
        // Three slices of the 1024-byte test slice size.
        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let checksum = Checksum::of(&payload);

        let reply = srv
            .handle(Message::ArchiveKeyStart {
                request_id,
                ident: ident("streamed"),
                timestamp: 100,
                sequence: 0,
                data: payload[..1024].to_vec(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyStartReply {
                result: ResultCode::Success,
                ..
            }
        ));

        srv.handle(Message::ArchiveKeyNext {
            request_id,
            sequence: 1,
            data: payload[1024..2048].to_vec(),
        })
        .await
        .unwrap();

        let reply = srv
            .handle(Message::ArchiveKeyFinal {
                request_id,
                sequence: 2,
                total_size: 10_000,
                file_checksum: Checksum::of(b"file"),
                segment_checksum: checksum,
                data: payload[2048..].to_vec(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyFinalReply {
                result: ResultCode::Success,
                ..
            }
        ));
        assert_eq!(srv.open_sessions().await, 0);

        // Retrieve comes back in three slices.
        let rid = RequestId::random();
        let reply = srv
            .handle(Message::RetrieveKeyStart {
                request_id: rid,
                ident: ident("streamed"),
            })
            .await
            .unwrap();
        let (meta, mut collected) = match reply {
            Message::RetrieveKeyStartReply {
                result: ResultCode::Success,
                meta,
                data,
                ..
            } => (meta.unwrap(), data),
            other => panic!("unexpected reply: {other:?}"),
        };
        assert_eq!(meta.slice_count, 3);

        match srv
            .handle(Message::RetrieveKeyNext {
                request_id: rid,
                sequence: 1,
            })
            .await
            .unwrap()
        {
            Message::RetrieveKeyNextReply {
                result: ResultCode::Success,
                data,
                ..
            } => collected.extend_from_slice(&data),
            other => panic!("unexpected reply: {other:?}"),
        }
        match srv
            .handle(Message::RetrieveKeyFinal {
                request_id: rid,
                sequence: 2,
            })
            .await
            .unwrap()
        {
            Message::RetrieveKeyFinalReply {
                result: ResultCode::Success,
                data,
                ..
            } => collected.extend_from_slice(&data),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(collected, payload);
        assert_eq!(srv.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_reused_request_id_rejected() {
        let srv = server();
        let request_id = RequestId::random();
        let start = Message::ArchiveKeyStart {
            request_id,
            ident: ident("k"),
            timestamp: 100,
            sequence: 0,
            data: vec![0u8; 16],
        };

        srv.handle(start.clone()).await.unwrap();
        let reply = srv.handle(start).await.unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyStartReply {
                result: ResultCode::InvalidDuplicate,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_out_of_sequence_slice_rejected() {
        let srv = server();
        let request_id = RequestId::random();
        srv.handle(Message::ArchiveKeyStart {
            request_id,
            ident: ident("k"),
            timestamp: 100,
            sequence: 0,
            data: vec![0u8; 16],
        })
        .await
        .unwrap();

        let reply = srv
            .handle(Message::ArchiveKeyNext {
                request_id,
                sequence: 5,
                data: vec![0u8; 16],
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::ArchiveKeyNextReply {
                result: ResultCode::OutOfSequence,
                ..
            }
        ));
        // The session is gone; a fresh start under the same id works.
        assert_eq!(srv.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_retrieve_missing_key_not_found() {
        let srv = server();
        let reply = srv
            .handle(Message::RetrieveKeyStart {
                request_id: RequestId::random(),
                ident: ident("ghost"),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::RetrieveKeyStartReply {
                result: ResultCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_destroy_then_stat_not_found() {
        let srv = server();
        srv.handle(entire(RequestId::random(), "k", 100, b"data"))
            .await
            .unwrap();

        let reply = srv
            .handle(Message::DestroyKey {
                request_id: RequestId::random(),
                ident: ident("k"),
                timestamp: 200,
            })
            .await
            .unwrap();
        match reply {
            Message::DestroyKeyReply {
                result, total_size, ..
            } => {
                assert_eq!(result, ResultCode::Success);
                assert_eq!(total_size, 16);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::Stat {
                request_id: RequestId::random(),
                avatar_id: 1,
                path: "k".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::StatReply {
                result: ResultCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_hinted_handoff_recorded() {
        let srv = server();
        let hint = HandoffHint {
            timestamp: 100,
            destination_exchange: "storage-02".to_string(),
            avatar_id: 1,
            key: "k".to_string(),
            version_number: 1,
            segment_number: 2,
        };
        let reply = srv
            .handle(Message::HintedHandoff {
                request_id: RequestId::random(),
                hint: hint.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Message::HintedHandoffReply {
                result: ResultCode::Success,
                ..
            }
        ));
        assert_eq!(srv.hints.next_hint("storage-02").unwrap(), Some(hint));
    }

    #[tokio::test]
    async fn test_process_status_heartbeat_and_shutdown() {
        let srv = server();
        let node = NodeRef::new("storage-02");
        srv.table.mark_down(&node).await;

        let status = |status| Message::ProcessStatus {
            timestamp: 1,
            exchange: "storage-02".to_string(),
            routing_header: "storage-02".to_string(),
            status,
        };
        assert!(srv.handle(status(ProcessStatusKind::Startup)).await.is_none());
        assert!(!srv.table.is_down(&node).await);

        srv.handle(status(ProcessStatusKind::Shutdown)).await;
        assert!(srv.table.is_down(&node).await);
    }

    #[tokio::test]
    async fn test_reply_kind_is_dropped() {
        let srv = server();
        let reply = srv
            .handle(Message::ArchiveKeyStartReply {
                request_id: RequestId::random(),
                result: ResultCode::Success,
                error_message: None,
            })
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_database_key_operations() {
        let srv = server();
        let pointer = ContentPointer {
            timestamp: 100,
            is_tombstone: false,
            segment_number: 1,
            segment_size: 4,
            total_size: 16,
            file_checksum: Checksum::of(b"whole file"),
            segment_checksum: Checksum::of(b"data"),
            version_number: 1,
        };

        let reply = srv
            .handle(Message::DatabaseKeyInsert {
                request_id: RequestId::random(),
                ident: ident("k"),
                pointer: pointer.clone(),
            })
            .await
            .unwrap();
        match reply {
            Message::DatabaseKeyInsertReply {
                result,
                previous_size,
                ..
            } => {
                assert_eq!(result, ResultCode::Success);
                assert_eq!(previous_size, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::DatabaseKeyLookup {
                request_id: RequestId::random(),
                ident: ident("k"),
            })
            .await
            .unwrap();
        match reply {
            Message::DatabaseKeyLookupReply {
                result, pointer: p, ..
            } => {
                assert_eq!(result, ResultCode::Success);
                assert_eq!(p, Some(pointer));
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::DatabaseKeyDestroy {
                request_id: RequestId::random(),
                ident: ident("k"),
                timestamp: 200,
            })
            .await
            .unwrap();
        match reply {
            Message::DatabaseKeyDestroyReply {
                result, total_size, ..
            } => {
                assert_eq!(result, ResultCode::Success);
                assert_eq!(total_size, 16);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::DatabaseKeyPurge {
                request_id: RequestId::random(),
                ident: ident("k"),
            })
            .await
            .unwrap();
        match reply {
            Message::DatabaseKeyPurgeReply { result, .. } => {
                assert_eq!(result, ResultCode::Success)
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::DatabaseKeyLookup {
                request_id: RequestId::random(),
                ident: ident("k"),
            })
            .await
            .unwrap();
        match reply {
            Message::DatabaseKeyLookupReply { result, .. } => {
                assert_eq!(result, ResultCode::NotFound)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_purge_key_removes_payload_and_pointer() {
        let srv = server();
        srv.handle(entire(RequestId::random(), "k", 100, b"payload"))
            .await
            .unwrap();

        let reply = srv
            .handle(Message::PurgeKey {
                request_id: RequestId::random(),
                ident: ident("k"),
                timestamp: 100,
            })
            .await
            .unwrap();
        match reply {
            Message::PurgeKeyReply { result, .. } => assert_eq!(result, ResultCode::Success),
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::RetrieveKeyStart {
                request_id: RequestId::random(),
                ident: ident("k"),
            })
            .await
            .unwrap();
        match reply {
            Message::RetrieveKeyStartReply { result, .. } => {
                assert_eq!(result, ResultCode::NotFound)
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_match_and_space_usage() {
        let srv = server();
        srv.handle(entire(RequestId::random(), "photos/a.jpg", 100, b"aaaa"))
            .await
            .unwrap();
        srv.handle(entire(RequestId::random(), "photos/b.jpg", 100, b"bbbbbb"))
            .await
            .unwrap();
        srv.handle(entire(RequestId::random(), "docs/c.pdf", 100, b"cc"))
            .await
            .unwrap();

        let reply = srv
            .handle(Message::DatabaseListMatch {
                request_id: RequestId::random(),
                avatar_id: 1,
                prefix: "photos/".to_string(),
            })
            .await
            .unwrap();
        match reply {
            Message::DatabaseListMatchReply {
                result,
                is_complete,
                keys,
                ..
            } => {
                assert_eq!(result, ResultCode::Success);
                assert!(is_complete);
                assert_eq!(keys, vec!["photos/a.jpg", "photos/b.jpg"]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply = srv
            .handle(Message::SpaceUsage {
                request_id: RequestId::random(),
                avatar_id: 1,
            })
            .await
            .unwrap();
        match reply {
            Message::SpaceUsageReply {
                bytes_stored,
                segment_count,
                ..
            } => {
                assert_eq!(bytes_stored, 12);
                assert_eq!(segment_count, 3);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
