//! [`NodeTable`]: configured destinations, liveness flags, stand-in choice.

use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use strand_types::{NodeRef, SegmentNumber};
use tokio::sync::{RwLock, broadcast};
use tracing::info;

/// Liveness transition broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node previously marked down is reachable again.
    Up(NodeRef),
    /// A node stopped responding or missed its heartbeat window.
    Down(NodeRef),
}

/// Snapshot of one tracked destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// The destination.
    pub node: NodeRef,
    /// Whether it is currently believed down.
    pub is_down: bool,
}

/// Per-destination tracking state. Entries are created once from the
/// configured list and never removed; only the flags change.
struct SlotState {
    node: NodeRef,
    is_down: bool,
    last_heartbeat: Instant,
}

/// The configured, ordered destination set with liveness flags.
///
/// Slot `i` of the configured list owns segment number `i + 1`. The table
/// never grows or shrinks at runtime; membership is configuration, not
/// gossip.
pub struct NodeTable {
    slots: RwLock<Vec<SlotState>>,
    handoff_count: usize,
    /// Broadcast channel for liveness transitions.
    ///
    /// Subscribers: handoff server.
    event_tx: broadcast::Sender<NodeEvent>,
}

impl NodeTable {
    /// Create a table from the ordered destination list.
    pub fn new(destinations: Vec<NodeRef>, handoff_count: usize) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        let now = Instant::now();
        let slots = destinations
            .into_iter()
            .map(|node| SlotState {
                node,
                is_down: false,
                last_heartbeat: now,
            })
            .collect();
        Arc::new(Self {
            slots: RwLock::new(slots),
            handoff_count,
            event_tx,
        })
    }

    /// Subscribe to liveness transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Number of configured destinations (the erasure width N).
    pub async fn destination_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// The primary destination for a segment number (1-based).
    pub async fn primary_for(&self, segment: SegmentNumber) -> Option<NodeRef> {
        let slots = self.slots.read().await;
        slots
            .get(segment.checked_sub(1)? as usize)
            .map(|s| s.node.clone())
    }

    /// Destinations a write for this segment should go to.
    ///
    /// The primary alone when it is up; otherwise a random sample of up
    /// to `handoff_count` other up nodes (the stand-ins). An empty result
    /// means the write cannot be placed at all.
    pub async fn destinations_for(&self, segment: SegmentNumber) -> Vec<NodeRef> {
        let slots = self.slots.read().await;
        let Some(slot_index) = segment.checked_sub(1).map(usize::from) else {
            return Vec::new();
        };
        let Some(primary) = slots.get(slot_index) else {
            return Vec::new();
        };
        if !primary.is_down {
            return vec![primary.node.clone()];
        }

        let candidates: Vec<NodeRef> = slots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != slot_index && !s.is_down)
            .map(|(_, s)| s.node.clone())
            .collect();
        let mut rng = rand::thread_rng();
        candidates
            .choose_multiple(&mut rng, self.handoff_count)
            .cloned()
            .collect()
    }

    /// Mark a node down. Idempotent; broadcasts only on transition.
    pub async fn mark_down(&self, node: &NodeRef) {
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut() {
            if slot.node == *node && !slot.is_down {
                slot.is_down = true;
                info!(exchange = %node.exchange, "node marked down");
                let _ = self.event_tx.send(NodeEvent::Down(node.clone()));
            }
        }
    }

    /// Mark a node up. Idempotent; broadcasts only on transition.
    pub async fn mark_up(&self, node: &NodeRef) {
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut() {
            if slot.node == *node {
                slot.last_heartbeat = Instant::now();
                if slot.is_down {
                    slot.is_down = false;
                    info!(exchange = %node.exchange, "node marked up");
                    let _ = self.event_tx.send(NodeEvent::Up(node.clone()));
                }
            }
        }
    }

    /// Record a heartbeat for an exchange. A heartbeat from a down node
    /// flips it back up (and broadcasts the `Up` event).
    pub async fn record_heartbeat(&self, exchange: &str) {
        self.mark_up(&NodeRef::new(exchange)).await;
    }

    /// Whether a node is currently believed down. Unknown nodes report
    /// down: nothing should be sent to a destination outside the set.
    pub async fn is_down(&self, node: &NodeRef) -> bool {
        let slots = self.slots.read().await;
        slots
            .iter()
            .find(|s| s.node == *node)
            .is_none_or(|s| s.is_down)
    }

    /// Snapshot of every tracked destination.
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .map(|s| NodeStatus {
                node: s.node.clone(),
                is_down: s.is_down,
            })
            .collect()
    }

    /// Mark down every node whose last heartbeat is older than `timeout`.
    ///
    /// Called by the background sweeper.
    pub async fn sweep_stale(&self, timeout: std::time::Duration) {
        let now = Instant::now();
        let stale: Vec<NodeRef> = {
            let slots = self.slots.read().await;
            slots
                .iter()
                .filter(|s| !s.is_down && now.duration_since(s.last_heartbeat) >= timeout)
                .map(|s| s.node.clone())
                .collect()
        };
        for node in stale {
            self.mark_down(&node).await;
        }
    }
}
