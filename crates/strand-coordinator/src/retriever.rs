//! Read-path coordinator.

use std::sync::Arc;

use strand_net::Bus;
use strand_nodeset::NodeTable;
use strand_types::{
    AvatarId, Checksum, SegmentIdent, SegmentNumber, Timestamp, VersionNumber,
};
use tracing::info;

use crate::error::CoordinatorError;
use crate::fanout::{self, CompletionPolicy};
use crate::{CoordinatorConfig, stream};

/// Outcome of one coordinated read: whole-object facts plus the first k
/// segment payloads in arrival order.
#[derive(Debug, Clone)]
pub struct RetrieveResult {
    pub timestamp: Timestamp,
    pub total_size: u64,
    pub file_checksum: Checksum,
    pub version_number: VersionNumber,
    /// The arrived segments, in arrival order. Exactly the agreement
    /// level many.
    pub segments: Vec<(SegmentNumber, Vec<u8>)>,
}

/// Fans one read out to every segment primary.
///
/// Succeeds with the first k arrivals; fails the moment k becomes
/// provably unreachable. Segments whose primary is down are not chased
/// to stand-ins; the quorum absorbs them.
pub struct Retriever {
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    config: CoordinatorConfig,
    busy: tokio::sync::Mutex<()>,
}

impl Retriever {
    pub fn new(bus: Arc<dyn Bus>, table: Arc<NodeTable>, config: CoordinatorConfig) -> Self {
        Self {
            bus,
            table,
            config,
            busy: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one coordinated read.
    pub async fn retrieve(
        &self,
        avatar_id: AvatarId,
        key: &str,
        version_number: VersionNumber,
    ) -> Result<RetrieveResult, CoordinatorError> {
        let _guard = self
            .busy
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyInProgress)?;

        let n = self.table.destination_count().await;
        let k = self.config.agreement_level;
        info!(avatar = avatar_id, %key, needed = k, "retrieving key");

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
                retrieve_one(self.bus.clone(), self.table.clone(), ident),
            ));
        }

        let arrivals =
            fanout::drive(CompletionPolicy::Agreement(k), self.config.op_timeout, tasks)
                .await?;

        // Whole-object facts come from the first arrival; every segment
        // of one version carries the same ones.
        let Some(first) = arrivals.first() else {
            return Err(CoordinatorError::QuorumUnreachable {
                needed: k,
                failed: n,
                total: n,
            });
        };
        let (meta, _) = &first.value;
        let result = RetrieveResult {
            timestamp: meta.timestamp,
            total_size: meta.total_size,
            file_checksum: meta.file_checksum,
            version_number: meta.version_number,
            segments: arrivals
                .iter()
                .map(|a| (a.segment, a.value.1.clone()))
                .collect(),
        };
        Ok(result)
    }
}

/// Read one segment from its primary.
async fn retrieve_one(
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    ident: SegmentIdent,
) -> Result<(strand_net::RetrieveMeta, Vec<u8>), CoordinatorError> {
    let segment = ident.segment_number;
    let primary = table
        .primary_for(segment)
        .await
        .ok_or(CoordinatorError::NoDestination { segment })?;
    if table.is_down(&primary).await {
        return Err(CoordinatorError::NoDestination { segment });
    }

    match stream::retrieve_segment(bus.as_ref(), &primary, &ident).await {
        Ok(retrieved) => Ok(retrieved),
        Err(CoordinatorError::Net(e)) => {
            table.mark_down(&primary).await;
            Err(CoordinatorError::Net(e))
        }
        Err(other) => Err(other),
    }
}
