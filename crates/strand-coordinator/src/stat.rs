//! Quorum stat queries.

use std::collections::HashMap;
use std::sync::Arc;

use strand_net::{Bus, Message};
use strand_nodeset::NodeTable;
use strand_types::{AvatarId, RequestId, ResultCode, SegmentNumber, StatRecord};
use tracing::{info, warn};

use crate::error::CoordinatorError;
use crate::fanout::{self, CompletionPolicy};
use crate::CoordinatorConfig;

/// Asks every primary for a key's whole-file record and answers with the
/// record the quorum agrees on.
///
/// Records are grouped bit for bit; a quorum of `None` answers means the
/// key does not exist and surfaces as a `NotFound` rejection. When no
/// group reaches the agreement level the cluster is mid-write or
/// mid-repair and the caller gets a disagreement error rather than a
/// guess.
pub struct StatGetter {
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    config: CoordinatorConfig,
    busy: tokio::sync::Mutex<()>,
}

impl StatGetter {
    pub fn new(bus: Arc<dyn Bus>, table: Arc<NodeTable>, config: CoordinatorConfig) -> Self {
        Self {
            bus,
            table,
            config,
            busy: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn stat(
        &self,
        avatar_id: AvatarId,
        path: &str,
    ) -> Result<StatRecord, CoordinatorError> {
        let _guard = self
            .busy
            .try_lock()
            .map_err(|_| CoordinatorError::AlreadyInProgress)?;

        let n = self.table.destination_count().await;
        let k = self.config.agreement_level;
        info!(avatar = avatar_id, %path, "stat query");

        let mut tasks = Vec::with_capacity(n);
        for segment in 1..=n as SegmentNumber {
            tasks.push((
                segment,
                stat_one(
                    self.bus.clone(),
                    self.table.clone(),
                    avatar_id,
                    path.to_string(),
                    segment,
                ),
            ));
        }

        let arrivals =
            fanout::drive(CompletionPolicy::Gather(k), self.config.op_timeout, tasks).await?;

        let mut groups: HashMap<Option<StatRecord>, usize> = HashMap::new();
        for arrival in &arrivals {
            *groups.entry(arrival.value.clone()).or_default() += 1;
        }
        match groups.into_iter().find(|(_, seen)| *seen >= k) {
            Some((Some(record), _)) => Ok(record),
            Some((None, _)) => Err(CoordinatorError::Rejected {
                code: ResultCode::NotFound,
                message: Some(format!("no stored version of {path}")),
            }),
            None => Err(CoordinatorError::StatDisagreement { needed: k }),
        }
    }
}

async fn stat_one(
    bus: Arc<dyn Bus>,
    table: Arc<NodeTable>,
    avatar_id: AvatarId,
    path: String,
    segment: SegmentNumber,
) -> Result<Option<StatRecord>, CoordinatorError> {
    let primary = table
        .primary_for(segment)
        .await
        .ok_or(CoordinatorError::NoDestination { segment })?;
    if table.is_down(&primary).await {
        return Err(CoordinatorError::NoDestination { segment });
    }

    let request = Message::Stat {
        request_id: RequestId::random(),
        avatar_id,
        path,
    };
    let reply = match bus.request(&primary, request).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(node = %primary, error = %e, "stat request failed, marking node down");
            table.mark_down(&primary).await;
            return Err(e.into());
        }
    };
    match reply {
        Message::StatReply {
            result: ResultCode::Success,
            record,
            ..
        } => Ok(record),
        Message::StatReply {
            result,
            error_message,
            ..
        } => Err(CoordinatorError::rejected(result, error_message)),
        other => Err(CoordinatorError::UnexpectedReply(other.kind())),
    }
}
