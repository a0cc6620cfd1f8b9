//! Background heartbeat sweeper.
//!
//! Periodically marks down any destination whose last heartbeat is older
//! than the configured timeout. Heartbeats arrive as periodic startup
//! announcements recorded via [`NodeTable::record_heartbeat`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::table::NodeTable;

/// Configuration for the heartbeat sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweep rounds.
    pub sweep_interval: Duration,
    /// Age after which a silent node is marked down.
    pub heartbeat_timeout: Duration,
}

impl SweeperConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            sweep_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(200),
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Start the sweeper and return a handle.
pub fn start_sweeper(table: Arc<NodeTable>, config: SweeperConfig) -> SweeperHandle {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn(async move {
        info!("heartbeat sweeper started");
        let mut interval = tokio::time::interval(config.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    table.sweep_stale(config.heartbeat_timeout).await;
                }
                _ = shutdown_rx.changed() => {
                    info!("heartbeat sweeper shutting down");
                    break;
                }
            }
        }
    });

    SweeperHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use strand_types::NodeRef;

    use super::*;

    #[tokio::test]
    async fn test_sweeper_marks_silent_node_down() {
        let table = NodeTable::new(
            vec![NodeRef::new("storage-01"), NodeRef::new("storage-02")],
            2,
        );
        let handle = start_sweeper(table.clone(), SweeperConfig::test_config());

        // No heartbeats arrive; both nodes must go down within the window.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(table.is_down(&NodeRef::new("storage-01")).await);
        assert!(table.is_down(&NodeRef::new("storage-02")).await);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_sweeper_spares_heartbeating_node() {
        let table = NodeTable::new(vec![NodeRef::new("storage-01")], 2);
        let handle = start_sweeper(table.clone(), SweeperConfig::test_config());

        for _ in 0..6 {
            table.record_heartbeat("storage-01").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!table.is_down(&NodeRef::new("storage-01")).await);

        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_running());
    }
}
