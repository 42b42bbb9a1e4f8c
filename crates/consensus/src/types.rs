//! Core types shared by the admission pipeline

use serde::{Deserialize, Serialize};

/// 32-byte content hash
pub type Hash = [u8; 32];

/// Identity of a chain (or of a server, whose identity chain is its verifying key)
pub type ChainId = [u8; 32];

/// Number of ordering windows in a block. Minute 10 is finalization.
pub const MINUTES_PER_BLOCK: usize = 10;

/// Default number of parallel lanes in a process list
pub const DEFAULT_LANES: usize = 10;

/// Admin chain
pub const ADMIN_CHAINID: ChainId = fixed_chain(0x0a);

/// Entry credit chain
pub const EC_CHAINID: ChainId = fixed_chain(0x0c);

/// Factoid (value transfer) chain
pub const FACTOID_CHAINID: ChainId = fixed_chain(0x0f);

const fn fixed_chain(last: u8) -> ChainId {
    let mut id = [0u8; 32];
    id[31] = last;
    id
}

/// Hash arbitrary bytes
pub fn hash_bytes(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Combine two hashes into one (used to link acknowledgments)
pub fn create_hash(a: &Hash, b: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    *hasher.finalize().as_bytes()
}

/// Route a key onto one of `lanes` lanes by summing its bytes
pub fn lane_for_key(key: &[u8], lanes: usize) -> usize {
    if lanes == 0 {
        return 0;
    }
    let sum: u64 = key.iter().map(|b| *b as u64).sum();
    (sum % lanes as u64) as usize
}

/// Short hex prefix for log lines
pub fn short(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

/// Current time in unix millis
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Outcome of validating a message against the current node state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Message may proceed to execution
    Accept,
    /// Message is permanently invalid
    Reject,
    /// Node cannot judge the message yet (missing dependency)
    Indeterminate,
}

/// Node role for the current minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    /// Leads one lane in the current minute
    Leader,
    /// Only follows acknowledgments from leaders
    Follower,
}

/// Configuration for the consensus core
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Name used in log lines
    pub node_name: String,
    /// Number of lanes per process list
    pub lanes: usize,
    /// Federated servers for the first height built
    pub federated_servers: Vec<ChainId>,
    /// How many heights past the working height a process list may be opened for
    pub lookahead: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            node_name: "dchain".to_string(),
            lanes: DEFAULT_LANES,
            federated_servers: Vec::new(),
            lookahead: 10,
        }
    }
}

/// Stats about the consensus core
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub leader_height: u32,
    pub leader_minute: usize,
    pub highest_recorded_block: Option<u32>,
    pub messages_processed: u64,
    pub messages_stalled: u64,
    pub messages_invalid: u64,
    pub acks_issued: u64,
    pub blocks_finalized: u64,
    pub holding: usize,
}
