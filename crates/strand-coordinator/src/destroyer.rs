//! Delete-path coordinator.

use std::sync::Arc;

use strand_net::{Bus, Message};
use strand_nodeset::NodeTable;
use strand_types::{
    AvatarId, NodeRef, RequestId, SegmentIdent, SegmentNumber, Timestamp, VersionNumber,
};
use tracing::{info, warn};

use crate::archiver::record_hint;
use crate::error::CoordinatorError;
use crate::fanout::{self, CompletionPolicy};
use crate::CoordinatorConfig;

/// Fans one destroy out to every segment destination.
///
/// Every slot gets a tombstone. A down primary gets the destroy forwarded
/// to its stand-ins together with one hint per stand-in, so the tombstone
/// reaches the primary on recovery.
pub struct Destroyer {
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    config: CoordinatorConfig,
    busy: tokio::sync::Mutex<()>,
}

impl Destroyer {
    pub fn new(bus: Arc<dyn Bus>, table: Arc<NodeTable>, config: CoordinatorConfig) -> Self {
        Self {
            bus,
            table,
            config,
            busy: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one coordinated destroy. Returns the minimum previously
    /// stored whole-object size any destination reported (0 when the key
    /// was already gone anywhere).
    pub async fn destroy(
        &self,
        avatar_id: AvatarId,
        key: &str,
        version_number: VersionNumber,
        timestamp: Timestamp,
    ) -> Result<u64, CoordinatorError> {
        let _guard = self
            .busy
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyInProgress)?;

        let n = self.table.destination_count().await;
        info!(avatar = avatar_id, %key, segments = n, "destroying key");

        let mut tasks = Vec::with_capacity(n);
        for segment in 1..=n as SegmentNumber {
            let ident = SegmentIdent {
                avatar_id,
                key: key.to_string(),
                version_number,
                segment_number: segment,
            };
            tasks.push((
                segment,
                destroy_one(self.bus.clone(), self.table.clone(), ident, timestamp),
            ));
        }

        let arrivals =
            fanout::drive(CompletionPolicy::All, self.config.op_timeout, tasks).await?;
        Ok(arrivals.iter().map(|a| a.value).min().unwrap_or(0))
    }
}

/// Tombstone one segment: at its primary, or at the stand-ins plus one
/// hint per stand-in when the primary is down.
async fn destroy_one(
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    ident: SegmentIdent,
    timestamp: Timestamp,
) -> Result<u64, CoordinatorError> {
    let segment = ident.segment_number;
    let primary = table
        .primary_for(segment)
        .await
        .ok_or(CoordinatorError::NoDestination { segment })?;

    if !table.is_down(&primary).await {
        match send_destroy(bus.as_ref(), &primary, &ident, timestamp).await {
            Ok(total_size) => return Ok(total_size),
            Err(CoordinatorError::Net(e)) => {
                warn!(
                    dest = %primary.exchange,
                    segment,
                    error = %e,
                    "primary unreachable, forwarding destroy to stand-ins"
                );
                table.mark_down(&primary).await;
            }
            Err(other) => return Err(other),
        }
    }

    let standins = table.destinations_for(segment).await;
    if standins.is_empty() {
        return Err(CoordinatorError::NoDestination { segment });
    }

    let mut total_size = None;
    for standin in &standins {
        let size = send_destroy(bus.as_ref(), standin, &ident, timestamp).await?;
        let best = total_size.get_or_insert(size);
        *best = (*best).min(size);
        record_hint(bus.as_ref(), standin, &primary, &ident, timestamp).await?;
    }
    Ok(total_size.unwrap_or(0))
}

async fn send_destroy(
    bus: &dyn Bus,
    dest: &NodeRef,
    ident: &SegmentIdent,
    timestamp: Timestamp,
) -> Result<u64, CoordinatorError> {
    let reply = bus
        .request(
            dest,
            Message::DestroyKey {
                request_id: RequestId::random(),
                ident: ident.clone(),
                timestamp,
            },
        )
        .await?;
    match reply {
        Message::DestroyKeyReply {
            result,
            total_size,
            error_message,
            ..
        } => {
            if result.is_success() {
                Ok(total_size)
            } else {
                Err(CoordinatorError::rejected(result, error_message))
            }
        }
        other => Err(CoordinatorError::UnexpectedReply(other.kind())),
    }
}
