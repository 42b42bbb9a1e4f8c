//! Finalized blocks (DBStates) and the height-ordered history

use crate::blocks::{AdminBlock, DirectoryBlock, EntryCreditBlock, FactoidBlock};
use crate::state::NodeState;
use crate::types::{now_millis, short};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Unanswered data requests are dropped this long after they were made
pub const DATA_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// The four sub-blocks of one finalized height. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbState {
    /// Produced locally (true) or received from the network (false)
    pub is_new: bool,
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub factoid_block: FactoidBlock,
    pub entry_credit_block: EntryCreditBlock,
    /// Unix millis when finalized here
    pub saved_at: u64,
}

impl DbState {
    pub fn height(&self) -> u32 {
        self.directory_block.height
    }
}

/// History of finalized blocks
#[derive(Debug, Default)]
pub struct DbStateList {
    states: BTreeMap<u32, Arc<DbState>>,
    /// Last time a DBState arrived from the network
    pub last_time: u64,
}

impl DbStateList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_dbstate(
        &self,
        is_new: bool,
        directory_block: DirectoryBlock,
        admin_block: AdminBlock,
        factoid_block: FactoidBlock,
        entry_credit_block: EntryCreditBlock,
    ) -> DbState {
        DbState {
            is_new,
            directory_block,
            admin_block,
            factoid_block,
            entry_credit_block,
            saved_at: now_millis(),
        }
    }

    /// Insert a state. The first state recorded for a height wins.
    pub fn put(&mut self, dbstate: DbState) -> Option<Arc<DbState>> {
        let height = dbstate.height();
        if self.states.contains_key(&height) {
            return None;
        }
        let dbstate = Arc::new(dbstate);
        self.states.insert(height, dbstate.clone());
        Some(dbstate)
    }

    pub fn get(&self, height: u32) -> Option<&Arc<DbState>> {
        self.states.get(&height)
    }

    pub fn last(&self) -> Option<&Arc<DbState>> {
        self.states.values().next_back()
    }

    /// Highest finalized height, if any block has been finalized
    pub fn highest_recorded_block(&self) -> Option<u32> {
        self.states.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl NodeState {
    /// Record a finalized block.
    ///
    /// Validation is the caller's job; this only keeps the history monotonic,
    /// retires superseded process lists and raises the working height.
    pub fn add_dbstate(
        &mut self,
        is_new: bool,
        directory_block: DirectoryBlock,
        admin_block: AdminBlock,
        factoid_block: FactoidBlock,
        entry_credit_block: EntryCreditBlock,
    ) -> bool {
        let dbstate = self.dbstates.new_dbstate(
            is_new,
            directory_block,
            admin_block,
            factoid_block,
            entry_credit_block,
        );
        let height = dbstate.height();

        let Some(dbstate) = self.dbstates.put(dbstate) else {
            tracing::debug!("DBState for height {} already recorded", height);
            return false;
        };

        self.process_lists.retire_through(height);

        for server in dbstate.admin_block.added_fed_servers() {
            if !self.federated_servers.contains(server) {
                tracing::info!("Federated server {} added at height {}", short(server), height);
                self.federated_servers.push(*server);
            }
            for pl in self.process_lists.iter_mut() {
                if !pl.is_fed_server(server) {
                    pl.fed_servers.push(*server);
                }
            }
        }

        self.matcher.purge_before(height);
        self.acks.retain(|_, ack| ack.dbheight > height);
        let cutoff = now_millis().saturating_sub(DATA_REQUEST_TIMEOUT_MS);
        self.data_requests.retain(|_, requested| *requested >= cutoff);

        if height > self.leader_height {
            self.leader_height = height;
        }

        self.stats.blocks_finalized += 1;
        tracing::info!(
            "{}: DBState {} recorded ({}), key {}",
            self.config.node_name,
            height,
            if is_new { "new" } else { "received" },
            short(&dbstate.directory_block.key_mr())
        );

        true
    }
}
