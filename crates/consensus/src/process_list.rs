//! Process lists - one per block height
//!
//! A process list holds one append-only lane per virtual server. Each lane
//! carries the admitted (ack, message) pairs in acknowledgment order, how far
//! the node has executed them, and the minute markers seen on the lane.

use crate::ack;
use crate::blocks::{AdminBlock, DirectoryBlock, Entry, EntryBlock, EntryCreditBlock};
use crate::message::{Ack, Message};
use crate::types::{lane_for_key, short, ChainId, Hash};
use std::collections::{BTreeMap, HashMap};

/// One lane ("virtual machine") of a process list
#[derive(Debug, Clone, Default)]
pub struct Lane {
    /// Admitted pairs; index == ack sequence number
    pub list: Vec<(Ack, Message)>,
    /// How many entries of `list` have been executed
    pub processed: usize,
    /// Highest minute an EOM on this lane has reported
    pub minute_complete: usize,
    /// Minute after the last EOM fully executed on this lane
    pub minute_finished: usize,
    /// Last ack admitted into the lane
    pub last_ack: Option<Ack>,
    /// Last ack this node issued as leader of the lane
    pub last_leader_ack: Option<Ack>,
}

impl Lane {
    /// Sequence number the next admitted ack must carry
    pub fn next_height(&self) -> u32 {
        self.list.len() as u32
    }
}

/// Everything accumulated for one block height
#[derive(Debug)]
pub struct ProcessList {
    pub dbheight: u32,
    pub lanes: Vec<Lane>,
    /// Federated servers, in leadership order
    pub fed_servers: Vec<ChainId>,
    /// Permanent record of admitted messages, by message hash
    pub old_msgs: HashMap<Hash, Message>,
    pub old_acks: HashMap<Hash, Ack>,
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub entry_credit_block: EntryCreditBlock,
    /// Entry blocks opened in this height, by chain
    pub new_eblocks: BTreeMap<ChainId, EntryBlock>,
    pub new_entries: HashMap<Hash, Entry>,
}

impl ProcessList {
    pub fn new(dbheight: u32, lanes: usize, fed_servers: Vec<ChainId>) -> Self {
        Self {
            dbheight,
            lanes: vec![Lane::default(); lanes.max(1)],
            fed_servers,
            old_msgs: HashMap::new(),
            old_acks: HashMap::new(),
            directory_block: DirectoryBlock::new(dbheight, [0u8; 32]),
            admin_block: AdminBlock::new(dbheight),
            entry_credit_block: EntryCreditBlock::new(dbheight),
            new_eblocks: BTreeMap::new(),
            new_entries: HashMap::new(),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane(&self, vm_index: usize) -> Option<&Lane> {
        self.lanes.get(vm_index)
    }

    /// Lane serving a chain
    pub fn vm_index_for(&self, chain_id: &ChainId) -> usize {
        lane_for_key(chain_id, self.lanes.len())
    }

    pub fn is_fed_server(&self, identity: &ChainId) -> bool {
        self.fed_servers.contains(identity)
    }

    /// Whether `identity` leads a lane in `minute`, and which one.
    ///
    /// Federated server `i` leads lane `(i + minute) % lanes`. Servers past the
    /// lane count lead nothing.
    pub fn get_virtual_servers(&self, minute: usize, identity: &ChainId) -> (bool, usize) {
        let lanes = self.lanes.len();
        match self.fed_servers.iter().position(|s| s == identity) {
            Some(i) if i < lanes => (true, (i + minute) % lanes),
            _ => (false, 0),
        }
    }

    /// Leader-side gap check: every ack this node issued for the lane has
    /// been admitted and executed.
    pub fn good_to(&self, vm_index: usize) -> bool {
        let Some(lane) = self.lanes.get(vm_index) else {
            return false;
        };
        let issued = lane
            .last_leader_ack
            .as_ref()
            .map_or(0, |a| a.height as usize + 1);
        issued <= lane.list.len() && lane.processed == lane.list.len()
    }

    /// Append a pair if its ack is the next in the lane's sequence.
    pub fn add_to_process_list(&mut self, ack: Ack, msg: Message) -> bool {
        let Some(lane) = self.lanes.get_mut(ack.vm_index as usize) else {
            return false;
        };

        if ack.height != lane.next_height() {
            tracing::debug!(
                "Height {} lane {}: ack {} out of sequence (lane at {})",
                self.dbheight,
                ack.vm_index,
                ack.height,
                lane.next_height()
            );
            return false;
        }

        let prev = lane.list.last().map(|(a, _)| a);
        if !ack::follows(prev, &ack) {
            tracing::warn!(
                "Height {} lane {}: serial hash mismatch for {}",
                self.dbheight,
                ack.vm_index,
                short(&ack.message_hash)
            );
            return false;
        }

        lane.last_ack = Some(ack.clone());
        lane.list.push((ack, msg));
        true
    }

    /// Record the minute an EOM reported for a lane
    pub fn set_minute(&mut self, vm_index: usize, minute: usize) {
        if let Some(lane) = self.lanes.get_mut(vm_index) {
            lane.minute_complete = minute;
        }
    }

    /// Lowest minute reported across lanes
    pub fn minute_complete(&self) -> usize {
        self.lanes.iter().map(|l| l.minute_complete).min().unwrap_or(0)
    }

    /// Lowest finished minute across lanes
    pub fn minute_finished(&self) -> usize {
        self.lanes.iter().map(|l| l.minute_finished).min().unwrap_or(0)
    }

    /// True once every lane has executed the EOM that ends transition `eom`
    pub fn unseal(&self, eom: usize) -> bool {
        self.minute_finished() >= eom
    }

    pub fn get_last_leader_ack(&self, vm_index: usize) -> Option<&Ack> {
        self.lanes.get(vm_index)?.last_leader_ack.as_ref()
    }

    pub fn set_last_leader_ack(&mut self, vm_index: usize, ack: Ack) {
        if let Some(lane) = self.lanes.get_mut(vm_index) {
            lane.last_leader_ack = Some(ack);
        }
    }

    /// Catch leader bookkeeping up with what the lanes have admitted
    pub fn update_last_leader_acks(&mut self) {
        for lane in &mut self.lanes {
            let Some(last) = &lane.last_ack else {
                continue;
            };
            let behind = match &lane.last_leader_ack {
                None => true,
                Some(leader) => last.height >= leader.height,
            };
            if behind {
                lane.last_leader_ack = Some(last.clone());
            }
        }
    }

    /// Whether a message hash is already part of this height
    pub fn has_old_msg(&self, hash: &Hash) -> bool {
        self.old_msgs.contains_key(hash)
    }

    /// Next admitted but unexecuted message on a lane
    pub fn next_unprocessed(&self, vm_index: usize) -> Option<Message> {
        let lane = self.lanes.get(vm_index)?;
        lane.list.get(lane.processed).map(|(_, m)| m.clone())
    }

    pub fn mark_processed(&mut self, vm_index: usize) {
        if let Some(lane) = self.lanes.get_mut(vm_index) {
            lane.processed += 1;
        }
    }

    pub fn get_new_eblocks(&self, chain_id: &ChainId) -> Option<&EntryBlock> {
        self.new_eblocks.get(chain_id)
    }

    pub fn put_new_eblocks(&mut self, eblock: EntryBlock) {
        self.new_eblocks.insert(eblock.chain_id, eblock);
    }

    pub fn put_new_entries(&mut self, hash: Hash, entry: Entry) {
        self.new_entries.insert(hash, entry);
    }

    /// Total admitted pairs across lanes
    pub fn len(&self) -> usize {
        self.lanes.iter().map(|l| l.list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process lists by height
#[derive(Debug, Default)]
pub struct ProcessLists {
    lists: BTreeMap<u32, ProcessList>,
}

impl ProcessLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dbheight: u32) -> Option<&ProcessList> {
        self.lists.get(&dbheight)
    }

    pub fn get_mut(&mut self, dbheight: u32) -> Option<&mut ProcessList> {
        self.lists.get_mut(&dbheight)
    }

    pub fn get_or_insert_with<F>(&mut self, dbheight: u32, create: F) -> &mut ProcessList
    where
        F: FnOnce() -> ProcessList,
    {
        self.lists.entry(dbheight).or_insert_with(create)
    }

    pub fn remove(&mut self, dbheight: u32) -> Option<ProcessList> {
        self.lists.remove(&dbheight)
    }

    /// Drop every list at or below `dbheight`
    pub fn retire_through(&mut self, dbheight: u32) {
        match dbheight.checked_add(1) {
            Some(next) => self.lists = self.lists.split_off(&next),
            None => self.lists.clear(),
        }
    }

    /// Whether any open height has admitted the message
    pub fn has_old_msg(&self, hash: &Hash) -> bool {
        self.lists.values().any(|pl| pl.has_old_msg(hash))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessList> {
        self.lists.values_mut()
    }

    /// Highest height a list exists for
    pub fn highest(&self) -> Option<u32> {
        self.lists.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}
