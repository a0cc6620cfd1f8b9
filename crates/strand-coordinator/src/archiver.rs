//! Write-path coordinator.

use std::sync::Arc;

use bytes::Bytes;
use strand_net::{Bus, Message};
use strand_nodeset::NodeTable;
use strand_types::{
    AvatarId, Checksum, HandoffHint, NodeRef, RequestId, SegmentIdent, SegmentNumber, Timestamp,
    VersionNumber,
};
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::fanout::{self, CompletionPolicy};
use crate::{CoordinatorConfig, stream};

/// One coordinated write: the pre-split segment payloads plus the
/// whole-object facts every destination records.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub avatar_id: AvatarId,
    pub key: String,
    pub version_number: VersionNumber,
    /// Write time; decides last-writer-wins everywhere downstream.
    pub timestamp: Timestamp,
    /// Bytes of the whole original object.
    pub total_size: u64,
    /// Checksums of the whole original object.
    pub file_checksum: Checksum,
    /// `segments[i]` goes to segment number `i + 1`.
    pub segments: Vec<Bytes>,
}

/// Fans one write out to every segment destination.
///
/// A write must land on all N slots. A down (or failing) primary is
/// substituted within the operation: the segment is written to each
/// sampled stand-in and one hint per stand-in records the debt. Every
/// stand-in write and hint must succeed for the segment to count.
pub struct Archiver {
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    config: CoordinatorConfig,
    busy: tokio::sync::Mutex<()>,
}

impl Archiver {
    pub fn new(bus: Arc<dyn Bus>, table: Arc<NodeTable>, config: CoordinatorConfig) -> Self {
        Self {
            bus,
            table,
            config,
            busy: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one coordinated write. Returns the sum of previously stored
    /// sizes across all segments (0 for a fresh key).
    pub async fn archive(&self, request: ArchiveRequest) -> Result<u64, CoordinatorError> {
        let _guard = self
            .busy
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyInProgress)?;

        let expected = self.table.destination_count().await;
        if request.segments.len() != expected {
            return Err(CoordinatorError::SegmentCountMismatch {
                expected,
                actual: request.segments.len(),
            });
        }

        info!(
            avatar = request.avatar_id,
            key = %request.key,
            version = request.version_number,
            segments = expected,
            "archiving key"
        );

        let mut tasks = Vec::with_capacity(expected);
        for (i, data) in request.segments.iter().enumerate() {
            let segment = (i + 1) as SegmentNumber;
            let ident = SegmentIdent {
                avatar_id: request.avatar_id,
                key: request.key.clone(),
                version_number: request.version_number,
                segment_number: segment,
            };
            tasks.push((
                segment,
                archive_one(
                    self.bus.clone(),
                    self.table.clone(),
                    ident,
                    request.timestamp,
                    request.total_size,
                    request.file_checksum,
                    data.clone(),
                    self.config.slice_size,
                ),
            ));
        }

        let arrivals =
            fanout::drive(CompletionPolicy::All, self.config.op_timeout, tasks).await?;
        Ok(arrivals.iter().map(|a| a.value).sum())
    }
}

/// Write one segment: to its primary, or to the stand-ins plus one hint
/// per stand-in when the primary is down.
#[allow(clippy::too_many_arguments)]
async fn archive_one(
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    ident: SegmentIdent,
    timestamp: Timestamp,
    total_size: u64,
    file_checksum: Checksum,
    data: Bytes,
    slice_size: usize,
) -> Result<u64, CoordinatorError> {
    let segment = ident.segment_number;
    let primary = table
        .primary_for(segment)
        .await
        .ok_or(CoordinatorError::NoDestination { segment })?;

    if !table.is_down(&primary).await {
        match stream::archive_segment(
            bus.as_ref(),
            &primary,
            &ident,
            timestamp,
            total_size,
            file_checksum,
            &data,
            slice_size,
        )
        .await
        {
            Ok(previous_size) => return Ok(previous_size),
            Err(CoordinatorError::Net(e)) => {
                // Transport failure: the primary is now considered down
                // and this write redirects to stand-ins.
                warn!(
                    dest = %primary.exchange,
                    segment,
                    error = %e,
                    "primary unreachable, redirecting to stand-ins"
                );
                table.mark_down(&primary).await;
            }
            // The destination processed and rejected; surface as-is.
            Err(other) => return Err(other),
        }
    }

    let standins = table.destinations_for(segment).await;
    if standins.is_empty() {
        return Err(CoordinatorError::NoDestination { segment });
    }

    let mut previous_size = None;
    for standin in &standins {
        let size = stream::archive_segment(
            bus.as_ref(),
            standin,
            &ident,
            timestamp,
            total_size,
            file_checksum,
            &data,
            slice_size,
        )
        .await?;
        previous_size.get_or_insert(size);
        record_hint(bus.as_ref(), standin, &primary, &ident, timestamp).await?;
    }
    Ok(previous_size.unwrap_or(0))
}

/// Record one hint at `standin` for the segment owed to `primary`.
pub(crate) async fn record_hint(
    bus: &dyn Bus,
    standin: &NodeRef,
    primary: &NodeRef,
    ident: &SegmentIdent,
    timestamp: Timestamp,
) -> Result<(), CoordinatorError> {
    let hint = HandoffHint {
        timestamp,
        destination_exchange: primary.exchange.clone(),
        avatar_id: ident.avatar_id,
        key: ident.key.clone(),
        version_number: ident.version_number,
        segment_number: ident.segment_number,
    };
    let reply = bus
        .request(
            standin,
            Message::HintedHandoff {
                request_id: RequestId::random(),
                hint,
            },
        )
        .await?;
    match reply {
        Message::HintedHandoffReply {
            result,
            error_message,
            ..
        } => {
            if result.is_success() {
                Ok(())
            } else {
                Err(CoordinatorError::rejected(result, error_message))
            }
        }
        other => Err(CoordinatorError::UnexpectedReply(other.kind())),
    }
}
