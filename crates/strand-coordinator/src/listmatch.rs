//! Cluster-wide prefix listing.

use std::collections::HashMap;
use std::sync::Arc;

use strand_net::{Bus, Message};
use strand_nodeset::NodeTable;
use strand_types::{AvatarId, RequestId, ResultCode, SegmentNumber};
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::fanout::{self, CompletionPolicy};
use crate::CoordinatorConfig;

/// Merged listing across the node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMatchResult {
    /// Keys reported by at least the agreement level many distinct
    /// destinations, sorted.
    pub keys: Vec<String>,
    /// False when any contributing destination truncated its listing.
    pub is_complete: bool,
}

/// Fans a prefix listing out to every primary and merges by quorum.
///
/// A key makes the merged listing only when enough distinct destinations
/// report it, so a key that exists on a single straggler node (a write
/// that never reached quorum) stays invisible, matching the read path.
pub struct Listmatcher {
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    config: CoordinatorConfig,
    busy: tokio::sync::Mutex<()>,
}

impl Listmatcher {
    pub fn new(bus: Arc<dyn Bus>, table: Arc<NodeTable>, config: CoordinatorConfig) -> Self {
        Self {
            bus,
            table,
            config,
            busy: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn list_match(
        &self,
        avatar_id: AvatarId,
        prefix: &str,
    ) -> Result<ListMatchResult, CoordinatorError> {
        let _guard = self
            .busy
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyInProgress)?;

        let n = self.table.destination_count().await;
        let k = self.config.agreement_level;
        info!(avatar = avatar_id, %prefix, "listing keys");

        let mut tasks = Vec::with_capacity(n);
        for segment in 1..=n as SegmentNumber {
            tasks.push((
                segment,
                list_one(
                    self.bus.clone(),
                    self.table.clone(),
                    avatar_id,
                    prefix.to_string(),
                    segment,
                ),
            ));
        }

        let arrivals =
            fanout::drive(CompletionPolicy::Gather(k), self.config.op_timeout, tasks).await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut is_complete = true;
        for arrival in &arrivals {
            let (keys, complete) = &arrival.value;
            is_complete &= complete;
            for key in keys {
                *counts.entry(key.clone()).or_default() += 1;
            }
        }
        let mut keys: Vec<String> = counts
            .into_iter()
            .filter(|(_, seen)| *seen >= k)
            .map(|(key, _)| key)
            .collect();
        keys.sort_unstable();
        Ok(ListMatchResult { keys, is_complete })
    }
}

async fn list_one(
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    avatar_id: AvatarId,
    prefix: String,
    segment: SegmentNumber,
) -> Result<(Vec<String>, bool), CoordinatorError> {
    let primary = table
        .primary_for(segment)
        .await
        .ok_or(CoordinatorError::NoDestination { segment })?;
    if table.is_down(&primary).await {
        return Err(CoordinatorError::NoDestination { segment });
    }

    let request = Message::DatabaseListMatch {
        request_id: RequestId::random(),
        avatar_id,
        prefix,
    };
    let reply = match bus.request(&primary, request).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(node = %primary, error = %e, "listing request failed, marking node down");
            table.mark_down(&primary).await;
            return Err(e.into());
        }
    };
    match reply {
        Message::DatabaseListMatchReply {
            result: ResultCode::Success,
            keys,
            is_complete,
            ..
        } => Ok((keys, is_complete)),
        Message::DatabaseListMatchReply {
            result,
            error_message,
            ..
        } => Err(CoordinatorError::rejected(result, error_message)),
        other => Err(CoordinatorError::UnexpectedReply(other.kind())),
    }
}
