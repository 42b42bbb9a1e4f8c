//! Node configuration

use anyhow::Context;
use dchain_consensus::{ChainId, ConsensusConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node configuration, loadable from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name used in log lines
    pub node_name: String,
    /// Lanes per height
    pub lanes: usize,
    /// Scheduling tick in milliseconds
    pub tick_ms: u64,
    /// Minute length in milliseconds
    pub minute_ms: u64,
    /// Heights past the working height a process list may be opened for
    pub lookahead: u32,
    /// Hex chain ids of the federated servers. Empty means this node alone.
    pub federated_servers: Vec<String>,
    /// Hex seed for the node identity. Random when absent.
    pub identity_seed: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "dchain".to_string(),
            lanes: 1,
            tick_ms: 10,
            minute_ms: 6_000,
            lookahead: 10,
            federated_servers: Vec::new(),
            identity_seed: None,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn seed(&self) -> anyhow::Result<Option<[u8; 32]>> {
        self.identity_seed.as_deref().map(parse_hash).transpose()
    }

    pub fn consensus(&self) -> anyhow::Result<ConsensusConfig> {
        let federated_servers = self
            .federated_servers
            .iter()
            .map(|s| parse_hash(s))
            .collect::<anyhow::Result<Vec<ChainId>>>()?;
        Ok(ConsensusConfig {
            node_name: self.node_name.clone(),
            lanes: self.lanes.max(1),
            federated_servers,
            lookahead: self.lookahead,
        })
    }
}

fn parse_hash(s: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(s.trim()).with_context(|| format!("Invalid hex {}", s))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("Expected 32 bytes, got {}", b.len()))
}
