//! Sender side of the streaming transfer protocol.
//!
//! A payload that fits in one slice goes out as a single
//! `ArchiveKeyEntire`; anything larger walks Start → Next… → Final with a
//! strictly increasing sequence number. Two slices skip straight from
//! Start to Final. Retrieve mirrors the same shape in the other
//! direction.

use strand_net::{Bus, Message, RetrieveMeta};
use strand_types::{Checksum, NodeRef, RequestId, SegmentIdent, Timestamp};
use tracing::debug;

use crate::error::CoordinatorError;

/// Write one segment payload to `dest`, slicing at `slice_size`.
///
/// Returns the destination's previously stored size for this segment.
#[allow(clippy::too_many_arguments)]
pub async fn archive_segment(
    bus: &dyn Bus,
    dest: &NodeRef,
    ident: &SegmentIdent,
    timestamp: Timestamp,
    total_size: u64,
    file_checksum: Checksum,
    data: &[u8],
    slice_size: usize,
) -> Result<u64, CoordinatorError> {
    let request_id = RequestId::random();
    let segment_checksum = Checksum::of(data);
    let n_slices = data.len().div_ceil(slice_size).max(1);
    debug!(
        dest = %dest.exchange,
        segment = ident.segment_number,
        %request_id,
        n_slices,
        "archiving segment"
    );

    if n_slices == 1 {
        let reply = bus
            .request(
                dest,
                Message::ArchiveKeyEntire {
                    request_id,
                    ident: ident.clone(),
                    timestamp,
                    total_size,
                    file_checksum,
                    segment_checksum,
                    data: data.to_vec(),
                },
            )
            .await?;
        return match reply {
            Message::ArchiveKeyEntireReply {
                result,
                previous_size,
                error_message,
                ..
            } => {
                if result.is_success() {
                    Ok(previous_size)
                } else {
                    Err(CoordinatorError::rejected(result, error_message))
                }
            }
            other => Err(CoordinatorError::UnexpectedReply(other.kind())),
        };
    }

    let reply = bus
        .request(
            dest,
            Message::ArchiveKeyStart {
                request_id,
                ident: ident.clone(),
                timestamp,
                sequence: 0,
                data: data[..slice_size].to_vec(),
            },
        )
        .await?;
    match reply {
        Message::ArchiveKeyStartReply {
            result,
            error_message,
            ..
        } => {
            if !result.is_success() {
                return Err(CoordinatorError::rejected(result, error_message));
            }
        }
        other => return Err(CoordinatorError::UnexpectedReply(other.kind())),
    }

    for sequence in 1..(n_slices - 1) as u32 {
        let start = sequence as usize * slice_size;
        let reply = bus
            .request(
                dest,
                Message::ArchiveKeyNext {
                    request_id,
                    sequence,
                    data: data[start..start + slice_size].to_vec(),
                },
            )
            .await?;
        match reply {
            Message::ArchiveKeyNextReply {
                result,
                error_message,
                ..
            } => {
                if !result.is_success() {
                    return Err(CoordinatorError::rejected(result, error_message));
                }
            }
            other => return Err(CoordinatorError::UnexpectedReply(other.kind())),
        }
    }

    let last = n_slices - 1;
    let reply = bus
        .request(
            dest,
            Message::ArchiveKeyFinal {
                request_id,
                sequence: last as u32,
                total_size,
                file_checksum,
                segment_checksum,
                data: data[last * slice_size..].to_vec(),
            },
        )
        .await?;
    match reply {
        Message::ArchiveKeyFinalReply {
            result,
            previous_size,
            error_message,
            ..
        } => {
            if result.is_success() {
                Ok(previous_size)
            } else {
                Err(CoordinatorError::rejected(result, error_message))
            }
        }
        other => Err(CoordinatorError::UnexpectedReply(other.kind())),
    }
}

/// Read one segment payload from `dest`.
///
/// Walks the retrieve session to completion and verifies the assembled
/// bytes against the advertised segment checksum.
pub async fn retrieve_segment(
    bus: &dyn Bus,
    dest: &NodeRef,
    ident: &SegmentIdent,
) -> Result<(RetrieveMeta, Vec<u8>), CoordinatorError> {
    let request_id = RequestId::random();

    let reply = bus
        .request(
            dest,
            Message::RetrieveKeyStart {
                request_id,
                ident: ident.clone(),
            },
        )
        .await?;
    let (meta, mut buffer) = match reply {
        Message::RetrieveKeyStartReply {
            result,
            meta,
            data,
            error_message,
            ..
        } => {
            if !result.is_success() {
                return Err(CoordinatorError::rejected(result, error_message));
            }
            let Some(meta) = meta else {
                return Err(CoordinatorError::UnexpectedReply("retrieve-key-start-reply"));
            };
            (meta, data)
        }
        other => return Err(CoordinatorError::UnexpectedReply(other.kind())),
    };
    debug!(
        dest = %dest.exchange,
        segment = ident.segment_number,
        %request_id,
        slice_count = meta.slice_count,
        "retrieving segment"
    );

    for sequence in 1..meta.slice_count.saturating_sub(1) {
        let reply = bus
            .request(
                dest,
                Message::RetrieveKeyNext {
                    request_id,
                    sequence,
                },
            )
            .await?;
        match reply {
            Message::RetrieveKeyNextReply {
                result,
                data,
                error_message,
                ..
            } => {
                if !result.is_success() {
                    return Err(CoordinatorError::rejected(result, error_message));
                }
                buffer.extend_from_slice(&data);
            }
            other => return Err(CoordinatorError::UnexpectedReply(other.kind())),
        }
    }

    if meta.slice_count > 1 {
        let reply = bus
            .request(
                dest,
                Message::RetrieveKeyFinal {
                    request_id,
                    sequence: meta.slice_count - 1,
                },
            )
            .await?;
        match reply {
            Message::RetrieveKeyFinalReply {
                result,
                data,
                error_message,
                ..
            } => {
                if !result.is_success() {
                    return Err(CoordinatorError::rejected(result, error_message));
                }
                buffer.extend_from_slice(&data);
            }
            other => return Err(CoordinatorError::UnexpectedReply(other.kind())),
        }
    }

    if Checksum::of(&buffer) != meta.segment_checksum {
        return Err(CoordinatorError::ChecksumMismatch);
    }
    Ok((meta, buffer))
}
