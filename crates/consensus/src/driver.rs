//! Consensus driver - one call per scheduling tick
//!
//! Each tick refreshes leadership, rolls the working height forward past the
//! last finalized block, advances the minute once every lane has finished it,
//! finalizes the block after minute 9, and drains one message.

use crate::blocks::{Entry, EntryBlock};
use crate::error::Result;
use crate::message::{DirectoryBlockSignature, Message, Payload, Signable};
use crate::process_list::ProcessList;
use crate::state::NodeState;
use crate::types::{
    now_millis, short, ChainId, Hash, ADMIN_CHAINID, EC_CHAINID, FACTOID_CHAINID, MINUTES_PER_BLOCK,
};
use std::collections::{BTreeMap, HashMap};

impl NodeState {
    /// Run one tick. Returns whether a message was processed.
    pub fn process(&mut self) -> bool {
        if self.eom < MINUTES_PER_BLOCK {
            let minute = self.leader_minute;
            self.refresh_leader(minute);
        }

        self.advance_height();
        self.advance_minute();

        let height = self.leader_height;
        self.process_pass(height);

        self.process_queues()
    }

    /// Move the working height past the highest finalized block and sign
    /// the block just vacated
    pub(crate) fn advance_height(&mut self) -> bool {
        let Some(highest) = self.highest_recorded_block() else {
            return false;
        };
        if self.leader_height > highest {
            return false;
        }
        let Some(next) = highest.checked_add(1) else {
            tracing::error!("{}: no height after {}", self.config.node_name, highest);
            return false;
        };

        self.leader_height = next;
        self.refresh_leader(0);
        self.leader_minute = 0;
        self.eom = 0;
        self.factoid_state.begin_block(self.leader_height);

        tracing::info!(
            "{}: building height {} (leader={}, lane {})",
            self.config.node_name,
            self.leader_height,
            self.leader,
            self.leader_vm_index
        );

        let identity = self.identity.chain_id();
        if !self.is_fed_server(&identity) {
            return true;
        }
        if let Some(signed) = self.dbstates.get(highest).cloned() {
            let mut dbsig = DirectoryBlockSignature {
                dbheight: self.leader_height,
                vm_index: self.leader_vm_index as u32,
                directory_block_key_mr: signed.directory_block.key_mr(),
                server: identity,
                timestamp: now_millis(),
                signature: Vec::new(),
            };
            dbsig.sign_with(&self.identity);
            self.queues
                .leader
                .push(Message::local(Payload::DirectoryBlockSignature(dbsig)));
        }
        true
    }

    /// Close the minute once every lane has executed the EOM that started
    /// the transition. Everything held is re-offered against the new state.
    pub(crate) fn advance_minute(&mut self) -> bool {
        if self.eom == 0 {
            return false;
        }
        let eom = self.eom;
        let sealed = self
            .process_lists
            .get(self.leader_height)
            .is_some_and(|pl| pl.unseal(eom));
        if !sealed {
            return false;
        }

        self.leader_minute += 1;
        if self.leader_minute < MINUTES_PER_BLOCK {
            let minute = self.leader_minute;
            self.refresh_leader(minute);
            self.eom = 0;
            tracing::debug!(
                "{}: height {} minute {}",
                self.config.node_name,
                self.leader_height,
                minute
            );
        } else {
            self.finalize_height();
            self.advance_height();
        }

        let held: Vec<Message> = self.holding.drain().map(|(_, msg)| msg).collect();
        for msg in held {
            self.stall_msg(msg);
        }
        true
    }

    /// Seal the working height's blocks into a DBState
    fn finalize_height(&mut self) {
        let height = self.leader_height;
        let pl = match self.process_lists.remove(height) {
            Some(pl) => pl,
            None => {
                tracing::warn!("{}: no process list to finalize at height {}", self.config.node_name, height);
                ProcessList::new(height, self.config.lanes, self.federated_servers.clone())
            }
        };

        let ProcessList {
            mut directory_block,
            admin_block,
            entry_credit_block,
            new_eblocks,
            new_entries,
            ..
        } = pl;
        let factoid_block = self.factoid_state.current_block().clone();

        directory_block.prev_key_mr = self.directory_block().map_or([0u8; 32], |d| d.key_mr());
        directory_block.timestamp = now_millis();
        directory_block.add_entry(ADMIN_CHAINID, admin_block.hash());
        directory_block.add_entry(EC_CHAINID, entry_credit_block.hash());
        directory_block.add_entry(FACTOID_CHAINID, factoid_block.hash());
        for (chain_id, eblock) in &new_eblocks {
            directory_block.add_entry(*chain_id, eblock.key_mr());
        }

        if let Err(e) = self.persist_height(&new_entries, &new_eblocks) {
            tracing::error!("{}: failed to store height {}: {}", self.config.node_name, height, e);
        }

        tracing::info!(
            "{}: finalized height {} with {} entries in {} chains, key {}",
            self.config.node_name,
            height,
            new_entries.len(),
            new_eblocks.len(),
            short(&directory_block.key_mr())
        );
        self.add_dbstate(true, directory_block, admin_block, factoid_block, entry_credit_block);
    }

    fn persist_height(
        &mut self,
        entries: &HashMap<Hash, Entry>,
        eblocks: &BTreeMap<ChainId, EntryBlock>,
    ) -> Result<()> {
        for entry in entries.values() {
            self.db.insert_entry(entry)?;
        }
        for eblock in eblocks.values() {
            self.db.process_eblock_batch(eblock, false)?;
        }
        Ok(())
    }
}
