//! Hint replay toward recovered nodes.
//!
//! [`HintDrainer`] watches liveness events and, when a destination comes
//! back up, replays every hint owed to it oldest-first: live segments are
//! streamed over, tombstones are forwarded as destroys. After a
//! successful replay the stand-in's local copy and the hint row are
//! purged, so a segment is never counted twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use strand_coordinator::{stream, CoordinatorError};
use strand_hints::HintRepository;
use strand_meta::MetaStore;
use strand_net::{Bus, Message};
use strand_nodeset::NodeEvent;
use strand_store::SegmentStore;
use strand_types::{
    ContentPointer, HandoffHint, NodeRef, RequestId, ResultCode, SegmentIdent,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::HandoffError;

/// Drains owed segments from this node to recovered destinations.
pub struct HintDrainer {
    bus: Arc<dyn Bus>,
    meta: Arc<MetaStore>,
    store: Arc<dyn SegmentStore>,
    hints: Arc<HintRepository>,
    slice_size: usize,
    /// Destinations with a drain already running; a second `Up` for the
    /// same node while its drain is in flight is a no-op.
    draining: Mutex<HashSet<String>>,
}

impl HintDrainer {
    pub fn new(
        bus: Arc<dyn Bus>,
        meta: Arc<MetaStore>,
        store: Arc<dyn SegmentStore>,
        hints: Arc<HintRepository>,
        slice_size: usize,
    ) -> Self {
        Self {
            bus,
            meta,
            store,
            hints,
            slice_size,
            draining: Mutex::new(HashSet::new()),
        }
    }

    /// Run the drain loop, processing liveness events until the sender
    /// is dropped. This should be spawned as a background task.
    pub async fn run(&self, mut events: broadcast::Receiver<NodeEvent>) {
        info!("hint drainer started");

        loop {
            match events.recv().await {
                Ok(NodeEvent::Up(node)) => {
                    if let Err(e) = self.drain(&node).await {
                        warn!(node = %node, error = %e, "hint drain interrupted");
                    }
                }
                Ok(NodeEvent::Down(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "hint drainer lagged behind event stream");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("hint drainer shutting down, event channel closed");
                    break;
                }
            }
        }
    }

    /// Replay every hint owed to `node`, oldest first. Returns the number
    /// of hints settled. Stops at the first failure, leaving the failed
    /// hint and everything behind it in place for the next attempt.
    pub async fn drain(&self, node: &NodeRef) -> Result<usize, HandoffError> {
        {
            let mut draining = self.draining.lock().unwrap();
            if !draining.insert(node.exchange.clone()) {
                debug!(node = %node, "drain already in flight");
                return Ok(0);
            }
        }
        let result = self.drain_inner(node).await;
        self.draining.lock().unwrap().remove(&node.exchange);
        result
    }

    async fn drain_inner(&self, node: &NodeRef) -> Result<usize, HandoffError> {
        let mut settled = 0usize;
        while let Some(hint) = self.hints.next_hint(&node.exchange)? {
            self.replay(node, &hint).await?;
            self.hints.purge(&hint)?;
            settled += 1;
        }
        if settled > 0 {
            info!(node = %node, settled, "hint drain complete");
        }
        Ok(settled)
    }

    /// Replay one hint. On return the destination holds what it is owed
    /// and the local stand-in copy is gone.
    async fn replay(&self, node: &NodeRef, hint: &HandoffHint) -> Result<(), HandoffError> {
        let ident = SegmentIdent {
            avatar_id: hint.avatar_id,
            key: hint.key.clone(),
            version_number: hint.version_number,
            segment_number: hint.segment_number,
        };

        let Some(pointer) = self.meta.lookup(&ident)? else {
            // The local pointer is gone (a purge raced the hint); there
            // is nothing left to forward.
            debug!(node = %node, %ident, "hint without local pointer, dropping");
            return Ok(());
        };

        if pointer.is_tombstone {
            self.forward_destroy(node, &ident, &pointer).await?;
        } else {
            self.forward_segment(node, &ident, &pointer).await?;
        }

        // The debt is settled; remove the stand-in copy.
        self.store.delete(&ident).await?;
        self.meta.purge(&ident)?;
        Ok(())
    }

    async fn forward_segment(
        &self,
        node: &NodeRef,
        ident: &SegmentIdent,
        pointer: &ContentPointer,
    ) -> Result<(), HandoffError> {
        let Some(data) = self.store.get(ident).await? else {
            debug!(node = %node, %ident, "hint without local payload, dropping");
            return Ok(());
        };

        debug!(node = %node, %ident, size = data.len(), "replaying segment");
        match stream::archive_segment(
            self.bus.as_ref(),
            node,
            ident,
            pointer.timestamp,
            pointer.total_size,
            pointer.file_checksum,
            &data,
            self.slice_size,
        )
        .await
        {
            Ok(_) => Ok(()),
            // The destination already holds this or something newer; the
            // debt is void.
            Err(CoordinatorError::Rejected {
                code: ResultCode::InvalidDuplicate | ResultCode::TooOld,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn forward_destroy(
        &self,
        node: &NodeRef,
        ident: &SegmentIdent,
        pointer: &ContentPointer,
    ) -> Result<(), HandoffError> {
        debug!(node = %node, %ident, "replaying destroy");
        let reply = self
            .bus
            .request(
                node,
                Message::DestroyKey {
                    request_id: RequestId::random(),
                    ident: ident.clone(),
                    timestamp: pointer.timestamp,
                },
            )
            .await
            .map_err(CoordinatorError::from)?;
        match reply {
            Message::DestroyKeyReply { result, .. }
                if result.is_success() || result == ResultCode::TooOld =>
            {
                Ok(())
            }
            Message::DestroyKeyReply {
                result,
                error_message,
                ..
            } => Err(CoordinatorError::rejected(result, error_message).into()),
            other => Err(CoordinatorError::UnexpectedReply(other.kind()).into()),
        }
    }
}
