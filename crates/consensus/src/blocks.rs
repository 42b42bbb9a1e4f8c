//! Sub-blocks accumulated by a process list
//!
//! These are the collaborator blocks the core feeds at minute boundaries.
//! Only the hooks the core needs are modelled; binary layouts are not.

use crate::message::{CommitChain, CommitEntry};
use crate::types::{hash_bytes, ChainId, Hash};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

fn borsh_hash<T: BorshSerialize>(value: &T) -> Hash {
    hash_bytes(&borsh::to_vec(value).expect("block serialization should not fail"))
}

/// A (chain, key) pair recorded in the directory block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DBlockEntry {
    pub chain_id: ChainId,
    pub key_mr: Hash,
}

/// Directory block: the top-level index of everything in a height
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct DirectoryBlock {
    /// Block height
    pub height: u32,
    /// Key of the previous directory block
    pub prev_key_mr: Hash,
    /// Timestamp (unix millis) when sealed
    pub timestamp: u64,
    /// Chains updated in this height
    pub entries: Vec<DBlockEntry>,
}

impl DirectoryBlock {
    pub fn new(height: u32, prev_key_mr: Hash) -> Self {
        Self {
            height,
            prev_key_mr,
            timestamp: 0,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, chain_id: ChainId, key_mr: Hash) {
        self.entries.push(DBlockEntry { chain_id, key_mr });
    }

    /// Content key. The seal timestamp is not part of it.
    pub fn key_mr(&self) -> Hash {
        borsh_hash(&(self.height, self.prev_key_mr, &self.entries))
    }
}

/// Admin block entries
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum AdminEntry {
    EndOfMinute(u8),
    AddFederatedServer(ChainId),
    DirectoryBlockSignature {
        server: ChainId,
        key_mr: Hash,
        signature: Vec<u8>,
    },
}

/// Admin block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct AdminBlock {
    pub height: u32,
    pub entries: Vec<AdminEntry>,
}

impl AdminBlock {
    pub fn new(height: u32) -> Self {
        Self {
            height,
            entries: Vec::new(),
        }
    }

    pub fn add_end_of_minute_marker(&mut self, minute: u8) {
        self.entries.push(AdminEntry::EndOfMinute(minute));
    }

    pub fn add_fed_server(&mut self, server: ChainId) {
        self.entries.push(AdminEntry::AddFederatedServer(server));
    }

    pub fn add_dbsig(&mut self, server: ChainId, key_mr: Hash, signature: Vec<u8>) {
        self.entries.push(AdminEntry::DirectoryBlockSignature {
            server,
            key_mr,
            signature,
        });
    }

    /// Servers promoted to federated status in this block
    pub fn added_fed_servers(&self) -> impl Iterator<Item = &ChainId> {
        self.entries.iter().filter_map(|e| match e {
            AdminEntry::AddFederatedServer(id) => Some(id),
            _ => None,
        })
    }

    pub fn hash(&self) -> Hash {
        borsh_hash(self)
    }
}

/// Factoid (value transfer) block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct FactoidBlock {
    pub height: u32,
    /// Minutes whose end-of-period settlement has run
    pub period_marks: Vec<u8>,
}

impl FactoidBlock {
    pub fn new(height: u32) -> Self {
        Self {
            height,
            period_marks: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        borsh_hash(self)
    }
}

/// Entry credit block body entries
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum EcEntry {
    CommitChain(CommitChain),
    CommitEntry(CommitEntry),
    MinuteNumber(u8),
}

/// Entry credit block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct EntryCreditBlock {
    pub height: u32,
    pub entries: Vec<EcEntry>,
}

impl EntryCreditBlock {
    pub fn new(height: u32) -> Self {
        Self {
            height,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: EcEntry) {
        self.entries.push(entry);
    }

    pub fn hash(&self) -> Hash {
        borsh_hash(self)
    }
}

/// User entry content
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Entry {
    pub chain_id: ChainId,
    pub ext_ids: Vec<Vec<u8>>,
    pub content: Vec<u8>,
}

impl Entry {
    pub fn hash(&self) -> Hash {
        borsh_hash(self)
    }
}

/// Entry block entries
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum EbEntry {
    Entry(Hash),
    EndOfMinute(u8),
}

/// Per-chain block of entry hashes
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct EntryBlock {
    pub chain_id: ChainId,
    pub height: u32,
    pub entries: Vec<EbEntry>,
}

impl EntryBlock {
    pub fn new(chain_id: ChainId, height: u32) -> Self {
        Self {
            chain_id,
            height,
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry_hash: Hash) {
        self.entries.push(EbEntry::Entry(entry_hash));
    }

    pub fn add_end_of_minute_marker(&mut self, minute: u8) {
        self.entries.push(EbEntry::EndOfMinute(minute));
    }

    /// Hashes of the entries this block references
    pub fn entry_hashes(&self) -> impl Iterator<Item = &Hash> {
        self.entries.iter().filter_map(|e| match e {
            EbEntry::Entry(h) => Some(h),
            EbEntry::EndOfMinute(_) => None,
        })
    }

    pub fn key_mr(&self) -> Hash {
        borsh_hash(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mr_ignores_timestamp() {
        let mut a = DirectoryBlock::new(4, [1u8; 32]);
        a.add_entry([2u8; 32], [3u8; 32]);
        let mut b = a.clone();
        b.timestamp = 99;
        assert_eq!(a.key_mr(), b.key_mr());

        b.add_entry([4u8; 32], [5u8; 32]);
        assert_ne!(a.key_mr(), b.key_mr());
    }

    #[test]
    fn test_added_fed_servers() {
        let mut ab = AdminBlock::new(1);
        ab.add_end_of_minute_marker(0);
        ab.add_fed_server([9u8; 32]);
        ab.add_dbsig([1u8; 32], [2u8; 32], vec![]);

        let added: Vec<_> = ab.added_fed_servers().copied().collect();
        assert_eq!(added, vec![[9u8; 32]]);
    }

    #[test]
    fn test_entry_hashes_skip_markers() {
        let mut eb = EntryBlock::new([1u8; 32], 3);
        eb.add_entry([5u8; 32]);
        eb.add_end_of_minute_marker(1);
        eb.add_entry([6u8; 32]);
        assert_eq!(eb.entry_hashes().count(), 2);
    }
}
