//! Database overlay used by the core for entries and entry blocks

use crate::blocks::{Entry, EntryBlock};
use crate::error::Result;
use crate::types::Hash;
use std::collections::HashMap;

/// Block/entry persistence the core writes through.
///
/// Entries are keyed by content hash, entry blocks by key.
pub trait DbOverlay: Send {
    fn insert_entry(&mut self, entry: &Entry) -> Result<()>;

    fn fetch_entry(&self, hash: &Hash) -> Result<Option<Entry>>;

    /// Store an entry block. `check_entries` logs missing entries.
    fn process_eblock_batch(&mut self, eblock: &EntryBlock, check_entries: bool) -> Result<()>;

    fn fetch_eblock(&self, key_mr: &Hash) -> Result<Option<EntryBlock>>;
}

/// In-memory overlay
#[derive(Debug, Default)]
pub struct MapOverlay {
    entries: HashMap<Hash, Entry>,
    eblocks: HashMap<Hash, EntryBlock>,
}

impl MapOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn eblock_count(&self) -> usize {
        self.eblocks.len()
    }
}

impl DbOverlay for MapOverlay {
    fn insert_entry(&mut self, entry: &Entry) -> Result<()> {
        self.entries.insert(entry.hash(), entry.clone());
        Ok(())
    }

    fn fetch_entry(&self, hash: &Hash) -> Result<Option<Entry>> {
        Ok(self.entries.get(hash).cloned())
    }

    fn process_eblock_batch(&mut self, eblock: &EntryBlock, check_entries: bool) -> Result<()> {
        if check_entries {
            let missing = eblock
                .entry_hashes()
                .filter(|h| !self.entries.contains_key(*h))
                .count();
            if missing > 0 {
                tracing::debug!("Entry block stored with {} entries not yet present", missing);
            }
        }
        self.eblocks.insert(eblock.key_mr(), eblock.clone());
        Ok(())
    }

    fn fetch_eblock(&self, key_mr: &Hash) -> Result<Option<EntryBlock>> {
        Ok(self.eblocks.get(key_mr).cloned())
    }
}
