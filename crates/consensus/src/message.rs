//! Protocol messages handled by the admission pipeline
//!
//! A [`Message`] is an envelope around a closed set of payload kinds. The
//! envelope flags (`local`, `stalled`, `count`) are node-local bookkeeping and
//! never contribute to the message hash.

use crate::blocks::{AdminBlock, DirectoryBlock, Entry, EntryCreditBlock, FactoidBlock};
use crate::identity::{verify_signature, Identity};
use crate::types::{hash_bytes, lane_for_key, short, ChainId, Hash};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Messages carrying a signature from a named identity
pub trait Signable: BorshSerialize + Clone {
    fn signer(&self) -> &ChainId;
    fn signature(&self) -> &[u8];
    fn signature_mut(&mut self) -> &mut Vec<u8>;

    /// Bytes covered by the signature (the message with an empty signature)
    fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature_mut().clear();
        borsh::to_vec(&unsigned).expect("message serialization should not fail")
    }

    fn sign_with(&mut self, identity: &Identity) {
        let signature = identity.sign(&self.signing_bytes());
        *self.signature_mut() = signature;
    }

    fn verify(&self) -> bool {
        verify_signature(self.signer(), &self.signing_bytes(), self.signature())
    }
}

macro_rules! signable {
    ($ty:ty, $signer:ident) => {
        impl Signable for $ty {
            fn signer(&self) -> &ChainId {
                &self.$signer
            }
            fn signature(&self) -> &[u8] {
                &self.signature
            }
            fn signature_mut(&mut self) -> &mut Vec<u8> {
                &mut self.signature
            }
        }
    };
}

/// End of minute marker issued by the leader of a lane
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Eom {
    pub dbheight: u32,
    pub vm_index: u32,
    /// Minute this marker closes
    pub minute: u8,
    pub timestamp: u64,
    pub server: ChainId,
    pub signature: Vec<u8>,
}

/// Receipt binding a message hash to a position in a lane
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Ack {
    /// Block height the message is ordered into
    pub dbheight: u32,
    pub vm_index: u32,
    pub minute: u8,
    pub timestamp: u64,
    /// Hash of the acknowledged message
    pub message_hash: Hash,
    pub leader_chain_id: ChainId,
    /// Sequence number within the lane
    pub height: u32,
    /// Running hash over the lane's acknowledgment history
    pub serial_hash: Hash,
    pub signature: Vec<u8>,
}

/// Signature by a server over the previous height's directory block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DirectoryBlockSignature {
    /// Height being built; the signed block is `dbheight - 1`
    pub dbheight: u32,
    pub vm_index: u32,
    pub directory_block_key_mr: Hash,
    pub server: ChainId,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// Pays for a new chain and its first entry
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct CommitChain {
    pub chain_id: ChainId,
    pub entry_hash: Hash,
    pub credits: u8,
    pub timestamp: u64,
    pub ec_public_key: ChainId,
    pub signature: Vec<u8>,
}

/// Pays for an entry in an existing chain
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct CommitEntry {
    pub entry_hash: Hash,
    pub credits: u8,
    pub timestamp: u64,
    pub ec_public_key: ChainId,
    pub signature: Vec<u8>,
}

/// Supplies the content for a committed entry
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct RevealEntry {
    pub entry: Entry,
    pub timestamp: u64,
}

impl RevealEntry {
    pub fn entry_hash(&self) -> Hash {
        self.entry.hash()
    }
}

/// Request to add a server to the authority set
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct AddServer {
    pub server_chain_id: ChainId,
    /// 0 = federated
    pub server_type: u8,
    pub timestamp: u64,
    /// Existing federated server endorsing the request
    pub sponsor: ChainId,
    pub signature: Vec<u8>,
}

/// Data type tag for an entry payload
pub const DATA_TYPE_ENTRY: u8 = 0;
/// Data type tag for an entry block payload
pub const DATA_TYPE_EBLOCK: u8 = 1;

/// Answer to a data request: an entry or an entry block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DataResponse {
    pub data_type: u8,
    /// Hash the object was requested under
    pub data_hash: Hash,
    /// Borsh encoded object
    pub data: Vec<u8>,
}

/// Finalized block received from the network
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DbStateMsg {
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    pub timestamp: u64,
}

signable!(Eom, server);
signable!(Ack, leader_chain_id);
signable!(DirectoryBlockSignature, server);
signable!(CommitChain, ec_public_key);
signable!(CommitEntry, ec_public_key);
signable!(AddServer, sponsor);

/// Closed set of message kinds
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum Payload {
    Eom(Eom),
    Ack(Ack),
    DirectoryBlockSignature(DirectoryBlockSignature),
    CommitChain(CommitChain),
    CommitEntry(CommitEntry),
    RevealEntry(RevealEntry),
    AddServer(AddServer),
    DataResponse(DataResponse),
    DbState(DbStateMsg),
}

/// A message plus node-local bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Payload,
    /// Originated by this node
    pub local: bool,
    /// Came back through the stall queue at least once
    pub stalled: bool,
    /// Repeat count for countable submissions
    pub count: u32,
}

impl Message {
    /// Wrap a payload received from the network
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            local: false,
            stalled: false,
            count: 0,
        }
    }

    /// Wrap a payload generated by this node
    pub fn local(payload: Payload) -> Self {
        Self {
            local: true,
            ..Self::new(payload)
        }
    }

    /// End of minute request from the local timer. The leader fills in
    /// height, lane and minute when it executes it.
    pub fn local_eom() -> Self {
        Self::local(Payload::Eom(Eom {
            dbheight: 0,
            vm_index: 0,
            minute: 0,
            timestamp: 0,
            server: [0u8; 32],
            signature: Vec::new(),
        }))
    }

    /// Identity of the message. Acks are identified by the message they order.
    pub fn hash(&self) -> Hash {
        match &self.payload {
            Payload::Ack(ack) => ack.message_hash,
            payload => hash_bytes(&borsh::to_vec(payload).expect("message serialization should not fail")),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.payload {
            Payload::Eom(_) => "eom",
            Payload::Ack(_) => "ack",
            Payload::DirectoryBlockSignature(_) => "dbsig",
            Payload::CommitChain(_) => "commit-chain",
            Payload::CommitEntry(_) => "commit-entry",
            Payload::RevealEntry(_) => "reveal-entry",
            Payload::AddServer(_) => "add-server",
            Payload::DataResponse(_) => "data-response",
            Payload::DbState(_) => "dbstate",
        }
    }

    /// Height the message names explicitly, if any
    pub fn target_height(&self) -> Option<u32> {
        match &self.payload {
            Payload::Eom(m) => Some(m.dbheight),
            Payload::Ack(m) => Some(m.dbheight),
            Payload::DirectoryBlockSignature(m) => Some(m.dbheight),
            Payload::DbState(m) => Some(m.directory_block.height),
            _ => None,
        }
    }

    /// Lane this message is ordered in
    pub fn vm_index(&self, lanes: usize) -> usize {
        match &self.payload {
            Payload::Eom(m) => m.vm_index as usize,
            Payload::Ack(m) => m.vm_index as usize,
            Payload::DirectoryBlockSignature(m) => m.vm_index as usize,
            Payload::CommitChain(m) => lane_for_key(&m.chain_id, lanes),
            Payload::CommitEntry(m) => lane_for_key(&m.entry_hash, lanes),
            Payload::RevealEntry(m) => lane_for_key(&m.entry.chain_id, lanes),
            Payload::AddServer(m) => lane_for_key(&m.server_chain_id, lanes),
            Payload::DataResponse(m) => lane_for_key(&m.data_hash, lanes),
            Payload::DbState(m) => lane_for_key(&m.directory_block.key_mr(), lanes),
        }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_eom(&self) -> bool {
        matches!(self.payload, Payload::Eom(_))
    }

    /// Kinds that carry a repeat count
    pub fn is_countable(&self) -> bool {
        matches!(
            self.payload,
            Payload::CommitChain(_) | Payload::CommitEntry(_) | Payload::RevealEntry(_)
        )
    }

    /// Kinds a leader orders itself. Everything else is only followed.
    pub fn leader_path(&self) -> bool {
        !matches!(
            self.payload,
            Payload::Ack(_) | Payload::DataResponse(_) | Payload::DbState(_)
        )
    }

    /// Entry hash for commit/reveal kinds
    pub fn entry_hash(&self) -> Option<Hash> {
        match &self.payload {
            Payload::CommitChain(m) => Some(m.entry_hash),
            Payload::CommitEntry(m) => Some(m.entry_hash),
            Payload::RevealEntry(m) => Some(m.entry_hash()),
            _ => None,
        }
    }

    /// Serialize the payload for network transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(&self.payload).expect("message serialization should not fail")
    }

    /// Deserialize a payload from the network
    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        Ok(Self::new(borsh::from_slice(data)?))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind(), short(&self.hash()))
    }
}

impl From<Ack> for Message {
    fn from(ack: Ack) -> Self {
        Message::new(Payload::Ack(ack))
    }
}
