//! TOML configuration for the Strand daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use iroh::EndpointAddr;
use serde::Deserialize;
use strand_types::NodeRef;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// This node's identity and data directory.
    pub node: NodeSection,
    /// The ordered destination set.
    pub cluster: ClusterSection,
    /// Segment payload storage backend.
    pub storage: StorageSection,
    /// Heartbeat and operation timing.
    pub timing: TimingSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Exchange name this node answers to. Must appear in
    /// `cluster.destinations`.
    pub exchange: String,
    /// Directory for persistent data (pointer DB, hint DB, segment files,
    /// node key).
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".strand"))
            .unwrap_or_else(|| PathBuf::from(".strand"));
        Self {
            exchange: "storage-1".to_string(),
            data_dir,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Ordered destination list; slot i is the primary for segment i+1.
    ///
    /// Format per entry: `"exchange"` (address learned from status
    /// broadcasts) or `"exchange=endpoint_id"` or
    /// `"exchange=endpoint_id@host:port"`.
    pub destinations: Vec<String>,
    /// Segments a read quorum needs (k). Defaults to a majority.
    pub agreement_level: Option<usize>,
    /// Stand-ins per down primary on the write path.
    pub handoff_count: Option<usize>,
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend type: `"file"` (default) or `"memory"`.
    pub backend: String,
    /// Streaming slice size in bytes.
    pub slice_size: Option<usize>,
    /// Capacity cap for the memory backend, in bytes.
    pub memory_max_bytes: Option<u64>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            slice_size: None,
            memory_max_bytes: None,
        }
    }
}

/// `[timing]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    /// Seconds between status re-announcements (the heartbeat).
    pub heartbeat_interval_secs: Option<u64>,
    /// Silence after which a destination is marked down.
    pub heartbeat_timeout_secs: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One parsed destination entry.
#[derive(Debug, Clone)]
pub struct Destination {
    pub node: NodeRef,
    /// Known address, when the config names one. Entries without an
    /// address are resolved from their status broadcasts.
    pub addr: Option<EndpointAddr>,
}

impl CliConfig {
    /// Load config from a TOML file, or defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Parse the ordered destination list.
    pub fn destinations(&self) -> anyhow::Result<Vec<Destination>> {
        anyhow::ensure!(
            !self.cluster.destinations.is_empty(),
            "cluster.destinations must not be empty"
        );
        self.cluster
            .destinations
            .iter()
            .map(|s| parse_destination(s))
            .collect()
    }

    /// Effective agreement level (config value or a strict majority).
    pub fn agreement_level(&self) -> usize {
        self.cluster
            .agreement_level
            .unwrap_or(self.cluster.destinations.len() / 2 + 1)
    }

    /// Effective stand-in count per down primary.
    pub fn handoff_count(&self) -> usize {
        self.cluster
            .handoff_count
            .unwrap_or(strand_nodeset::DEFAULT_HANDOFF_COUNT)
    }

    /// Effective streaming slice size.
    pub fn slice_size(&self) -> usize {
        self.storage
            .slice_size
            .unwrap_or(strand_types::DEFAULT_SLICE_SIZE)
    }

    /// Effective capacity cap for the memory backend (default 1 GiB).
    pub fn memory_max_bytes(&self) -> u64 {
        self.storage.memory_max_bytes.unwrap_or(1 << 30)
    }

    /// Effective heartbeat re-announce interval.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timing.heartbeat_interval_secs.unwrap_or(5))
    }

    /// Effective heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timing.heartbeat_timeout_secs.unwrap_or(30))
    }
}

/// Parse one destination entry.
///
/// Formats:
/// - `exchange`: address learned later from status broadcasts
/// - `exchange=endpoint_id`: hex public key (relay used for dialing)
/// - `exchange=endpoint_id@host:port`: with an explicit direct address
fn parse_destination(s: &str) -> anyhow::Result<Destination> {
    let Some((exchange, rest)) = s.split_once('=') else {
        anyhow::ensure!(!s.is_empty(), "empty destination entry");
        return Ok(Destination {
            node: NodeRef::new(s),
            addr: None,
        });
    };

    let (id_str, addr_str) = match rest.split_once('@') {
        Some((id, addr)) => (id, Some(addr)),
        None => (rest, None),
    };

    let endpoint_id: iroh::EndpointId = id_str
        .parse()
        .context("invalid endpoint ID (expected hex-encoded public key)")?;

    let mut endpoint_addr = EndpointAddr::new(endpoint_id);
    if let Some(addr) = addr_str {
        let socket_addr: SocketAddr = addr
            .parse()
            .context("invalid socket address in destination (expected host:port)")?;
        endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
    }

    Ok(Destination {
        node: NodeRef::new(exchange),
        addr: Some(endpoint_addr),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[node]
exchange = "storage-2"
data_dir = "/tmp/strand-test"

[cluster]
destinations = ["storage-1", "storage-2", "storage-3"]
agreement_level = 2
handoff_count = 2

[storage]
backend = "file"
slice_size = 65536

[timing]
heartbeat_interval_secs = 3
heartbeat_timeout_secs = 12

[log]
level = "debug"
"#;

        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.node.exchange, "storage-2");
        assert_eq!(config.destinations().unwrap().len(), 3);
        assert_eq!(config.agreement_level(), 2);
        assert_eq!(config.slice_size(), 65536);
        assert_eq!(config.heartbeat_interval().as_secs(), 3);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::from_toml("").unwrap();
        assert_eq!(config.storage.backend, "file");
        assert_eq!(config.slice_size(), strand_types::DEFAULT_SLICE_SIZE);
        assert_eq!(config.log.level, "info");
        assert!(config.destinations().is_err());
    }

    #[test]
    fn test_agreement_defaults_to_majority() {
        let toml = r#"
[cluster]
destinations = ["a", "b", "c", "d", "e"]
"#;
        let config = CliConfig::from_toml(toml).unwrap();
        assert_eq!(config.agreement_level(), 3);
    }

    #[test]
    fn test_parse_destination_forms() {
        let plain = parse_destination("storage-1").unwrap();
        assert_eq!(plain.node.exchange, "storage-1");
        assert!(plain.addr.is_none());

        assert!(parse_destination("storage-1=not-a-key").is_err());
        assert!(parse_destination("").is_err());
    }
}
