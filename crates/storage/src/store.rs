use dchain_consensus::{ConsensusError, DbOverlay, DbState, Entry, EntryBlock, Hash};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;

/// Summary of the last block written
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainMetadata {
    /// Highest finalized height on disk
    pub height: u32,
    /// Its directory block key
    pub key_mr: Hash,
    /// Stored block count
    pub block_count: u64,
    /// Last save timestamp
    pub last_save_ts: i64,
}

/// Persistent block store.
///
/// Clones share the same database, so one handle can serve as the
/// consensus overlay while another records finalized blocks.
#[derive(Clone)]
pub struct BlockStore {
    db: Db,
    entries: sled::Tree,
    eblocks: sled::Tree,
    dbstates: sled::Tree,
    metadata: sled::Tree,
}

impl BlockStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let db = sled::open(&path)?;
        let entries = db.open_tree("entries")?;
        let eblocks = db.open_tree("eblocks")?;
        let dbstates = db.open_tree("dbstates")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened block store at {:?}", path.as_ref());

        Ok(Self {
            db,
            entries,
            eblocks,
            dbstates,
            metadata,
        })
    }

    pub fn put_entry(&self, entry: &Entry) -> anyhow::Result<()> {
        let bytes = bincode::serialize(entry)?;
        self.entries.insert(entry.hash(), bytes)?;
        Ok(())
    }

    pub fn get_entry(&self, hash: &Hash) -> anyhow::Result<Option<Entry>> {
        match self.entries.get(hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_eblock(&self, eblock: &EntryBlock) -> anyhow::Result<()> {
        let bytes = bincode::serialize(eblock)?;
        self.eblocks.insert(eblock.key_mr(), bytes)?;
        Ok(())
    }

    pub fn get_eblock(&self, key_mr: &Hash) -> anyhow::Result<Option<EntryBlock>> {
        match self.eblocks.get(key_mr)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a finalized block and move the chain head to it
    pub fn save_dbstate(&self, dbstate: &DbState) -> anyhow::Result<()> {
        let height = dbstate.height();
        let bytes = bincode::serialize(dbstate)?;
        // Big-endian keys iterate in height order
        self.dbstates.insert(height.to_be_bytes(), bytes)?;

        let head = self.load_metadata()?.unwrap_or_default();
        if self.dbstates.len() == 1 || height >= head.height {
            self.save_metadata(&ChainMetadata {
                height,
                key_mr: dbstate.directory_block.key_mr(),
                block_count: self.dbstates.len() as u64,
                last_save_ts: chrono::Utc::now().timestamp(),
            })?;
        }
        Ok(())
    }

    pub fn get_dbstate(&self, height: u32) -> anyhow::Result<Option<DbState>> {
        match self.dbstates.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All finalized blocks, lowest height first
    pub fn load_dbstates(&self) -> anyhow::Result<Vec<DbState>> {
        let mut states = Vec::new();
        for result in self.dbstates.iter() {
            let (_, value) = result?;
            states.push(bincode::deserialize(&value)?);
        }
        Ok(states)
    }

    pub fn save_metadata(&self, metadata: &ChainMetadata) -> anyhow::Result<()> {
        let bytes = bincode::serialize(metadata)?;
        self.metadata.insert("chain", bytes)?;
        Ok(())
    }

    pub fn load_metadata(&self) -> anyhow::Result<Option<ChainMetadata>> {
        match self.metadata.get("chain")? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn eblock_count(&self) -> usize {
        self.eblocks.len()
    }

    pub fn block_count(&self) -> usize {
        self.dbstates.len()
    }
}

fn storage_err(e: anyhow::Error) -> ConsensusError {
    ConsensusError::Storage(e.to_string())
}

impl DbOverlay for BlockStore {
    fn insert_entry(&mut self, entry: &Entry) -> dchain_consensus::Result<()> {
        self.put_entry(entry).map_err(storage_err)
    }

    fn fetch_entry(&self, hash: &Hash) -> dchain_consensus::Result<Option<Entry>> {
        self.get_entry(hash).map_err(storage_err)
    }

    fn process_eblock_batch(
        &mut self,
        eblock: &EntryBlock,
        check_entries: bool,
    ) -> dchain_consensus::Result<()> {
        if check_entries {
            for hash in eblock.entry_hashes() {
                let present = self
                    .entries
                    .contains_key(hash)
                    .map_err(|e| ConsensusError::Storage(e.to_string()))?;
                if !present {
                    tracing::warn!("Entry {} missing for stored entry block", hex::encode(hash));
                }
            }
        }
        self.put_eblock(eblock).map_err(storage_err)
    }

    fn fetch_eblock(&self, key_mr: &Hash) -> dchain_consensus::Result<Option<EntryBlock>> {
        self.get_eblock(key_mr).map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dchain_consensus::{AdminBlock, DirectoryBlock, EntryCreditBlock, FactoidBlock};
    use tempfile::tempdir;

    fn entry(content: &[u8]) -> Entry {
        Entry {
            chain_id: [7u8; 32],
            ext_ids: Vec::new(),
            content: content.to_vec(),
        }
    }

    fn dbstate(height: u32, prev: Hash) -> DbState {
        DbState {
            is_new: true,
            directory_block: DirectoryBlock::new(height, prev),
            admin_block: AdminBlock::new(height),
            factoid_block: FactoidBlock::new(height),
            entry_credit_block: EntryCreditBlock::new(height),
            saved_at: 0,
        }
    }

    #[test]
    fn test_store_and_load_entry() {
        let dir = tempdir().unwrap();
        let mut store = BlockStore::open(dir.path()).unwrap();
        let entry = entry(b"hello");

        store.insert_entry(&entry).unwrap();
        store.flush().unwrap();

        assert_eq!(store.fetch_entry(&entry.hash()).unwrap(), Some(entry));
        assert_eq!(store.fetch_entry(&[0u8; 32]).unwrap(), None);
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_eblock_by_key() {
        let dir = tempdir().unwrap();
        let mut store = BlockStore::open(dir.path()).unwrap();
        let entry = entry(b"in a block");

        let mut eblock = EntryBlock::new([7u8; 32], 3);
        eblock.add_entry(entry.hash());
        eblock.add_end_of_minute_marker(0);

        store.process_eblock_batch(&eblock, true).unwrap();
        let loaded = store.fetch_eblock(&eblock.key_mr()).unwrap().unwrap();
        assert_eq!(loaded, eblock);
        assert_eq!(store.eblock_count(), 1);
    }

    #[test]
    fn test_dbstates_load_in_height_order() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();

        let first = dbstate(0, [0u8; 32]);
        let second = dbstate(1, first.directory_block.key_mr());
        let far = dbstate(300, [1u8; 32]);
        store.save_dbstate(&far).unwrap();
        store.save_dbstate(&second).unwrap();
        store.save_dbstate(&first).unwrap();

        let heights: Vec<u32> = store.load_dbstates().unwrap().iter().map(|d| d.height()).collect();
        assert_eq!(heights, vec![0, 1, 300]);
        assert_eq!(store.get_dbstate(1).unwrap(), Some(second));

        let head = store.load_metadata().unwrap().unwrap();
        assert_eq!(head.height, 300);
        assert_eq!(head.key_mr, far.directory_block.key_mr());
    }

    #[test]
    fn test_reopen_keeps_blocks() {
        let dir = tempdir().unwrap();
        {
            let store = BlockStore::open(dir.path()).unwrap();
            store.save_dbstate(&dbstate(0, [0u8; 32])).unwrap();
            store.flush().unwrap();
        }
        let store = BlockStore::open(dir.path()).unwrap();
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.load_metadata().unwrap().map(|m| m.height), Some(0));
    }
}
