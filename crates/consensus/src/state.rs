//! Node state - the single owner of everything the driver mutates
//!
//! Producers on other threads only reach the state through the queues
//! ([`MessageSender`]); every other field is touched by the driver alone.

use crate::blocks::{DirectoryBlock, Entry, EntryBlock};
use crate::commits::EntryMatcher;
use crate::dbstate::DbStateList;
use crate::factoid::FactoidState;
use crate::identity::Identity;
use crate::message::{Ack, Message};
use crate::overlay::{DbOverlay, MapOverlay};
use crate::process_list::{ProcessList, ProcessLists};
use crate::queues::{MessageQueues, MessageSender, Queue};
use crate::types::{ChainId, ConsensusConfig, ConsensusStats, Hash, NodeRole};
use std::collections::HashMap;

/// Ticks of continuous "caught up" before [`NodeState::green`] latches
const GREEN_LATCH: u32 = 1000;

pub struct NodeState {
    pub(crate) config: ConsensusConfig,
    pub(crate) identity: Identity,
    pub(crate) queues: MessageQueues,
    pub(crate) process_lists: ProcessLists,
    pub(crate) dbstates: DbStateList,
    pub(crate) factoid_state: FactoidState,
    pub(crate) matcher: EntryMatcher,
    pub(crate) db: Box<dyn DbOverlay>,
    /// Current authority set
    pub(crate) federated_servers: Vec<ChainId>,

    /// Height under construction
    pub(crate) leader_height: u32,
    pub(crate) leader_minute: usize,
    /// Non-zero while a minute transition is in progress: minute + 1 of the
    /// EOM that started it
    pub(crate) eom: usize,
    pub(crate) leader: bool,
    pub(crate) leader_vm_index: usize,

    /// Acks waiting for their message
    pub(crate) acks: HashMap<Hash, Ack>,
    /// Messages waiting for their ack
    pub(crate) holding: HashMap<Hash, Message>,
    /// Requested objects and when they were requested
    pub(crate) data_requests: HashMap<Hash, u64>,
    pub(crate) eb_db_height_complete: u32,

    pub(crate) green_cnt: u32,
    pub(crate) green_flag: bool,
    /// Which of stall/follower goes first when both are ready
    pub(crate) prefer_stalled: bool,
    /// Guards the processing pass against re-entry
    pub(crate) processing: bool,
    pub(crate) stats: ConsensusStats,
}

impl NodeState {
    pub fn new(config: ConsensusConfig, identity: Identity, db: Box<dyn DbOverlay>, start_height: u32) -> Self {
        let federated_servers = config.federated_servers.clone();
        tracing::info!(
            "{}: node state at height {} with {} lanes, {} federated servers",
            config.node_name,
            start_height,
            config.lanes,
            federated_servers.len()
        );

        Self {
            config,
            identity,
            queues: MessageQueues::new(),
            process_lists: ProcessLists::new(),
            dbstates: DbStateList::new(),
            factoid_state: FactoidState::new(start_height),
            matcher: EntryMatcher::new(),
            db,
            federated_servers,
            leader_height: start_height,
            leader_minute: 0,
            eom: 0,
            leader: false,
            leader_vm_index: 0,
            acks: HashMap::new(),
            holding: HashMap::new(),
            data_requests: HashMap::new(),
            eb_db_height_complete: 0,
            green_cnt: 0,
            green_flag: false,
            prefer_stalled: true,
            processing: false,
            stats: ConsensusStats::default(),
        }
    }

    pub fn builder() -> NodeStateBuilder {
        NodeStateBuilder::new()
    }

    /// Process list for `dbheight`, created on first use.
    ///
    /// Lists are never created at or below the highest finalized height, nor
    /// further ahead of the working height than the configured lookahead.
    pub(crate) fn process_list_mut(&mut self, dbheight: u32) -> Option<&mut ProcessList> {
        if let Some(highest) = self.dbstates.highest_recorded_block() {
            if dbheight <= highest {
                return None;
            }
        }
        if dbheight > self.leader_height.saturating_add(self.config.lookahead) {
            return None;
        }

        let lanes = self.config.lanes;
        let fed_servers = &self.federated_servers;
        Some(
            self.process_lists
                .get_or_insert_with(dbheight, || ProcessList::new(dbheight, lanes, fed_servers.clone())),
        )
    }

    /// Lane a message is ordered in. Local EOMs belong to the lane this node
    /// leads.
    pub(crate) fn lane_of(&self, msg: &Message) -> usize {
        if msg.is_local() && msg.is_eom() {
            self.leader_vm_index
        } else {
            msg.vm_index(self.config.lanes)
        }
    }

    /// Recompute leadership for `minute` at the working height and catch
    /// leader bookkeeping up with the lanes.
    pub(crate) fn refresh_leader(&mut self, minute: usize) {
        let identity = self.identity.chain_id();
        let height = self.leader_height;
        let assignment = self.process_list_mut(height).map(|pl| {
            pl.update_last_leader_acks();
            pl.get_virtual_servers(minute, &identity)
        });

        let (leader, vm_index) = assignment.unwrap_or((false, 0));
        if leader != self.leader || vm_index != self.leader_vm_index {
            tracing::debug!(
                "{}: height {} minute {}: leader={} lane={}",
                self.config.node_name,
                height,
                minute,
                leader,
                vm_index
            );
        }
        self.leader = leader;
        self.leader_vm_index = vm_index;
    }

    /// Put a message back for a later pass
    pub(crate) fn stall_msg(&mut self, msg: Message) {
        self.stats.messages_stalled += 1;
        self.queues.stall.push(msg);
    }

    /// Whether this node's identity is in the current authority set
    pub fn is_fed_server(&self, identity: &ChainId) -> bool {
        self.federated_servers.contains(identity)
    }

    /// Authority set for a height: the process list's if one exists,
    /// otherwise the current set
    pub(crate) fn fed_servers_at(&self, dbheight: u32) -> &[ChainId] {
        self.process_lists
            .get(dbheight)
            .map_or(&self.federated_servers, |pl| &pl.fed_servers)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn leader_height(&self) -> u32 {
        self.leader_height
    }

    pub fn leader_minute(&self) -> usize {
        self.leader_minute
    }

    pub fn eom(&self) -> usize {
        self.eom
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    pub fn leader_vm_index(&self) -> usize {
        self.leader_vm_index
    }

    pub fn role(&self) -> NodeRole {
        if self.leader {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        }
    }

    pub fn federated_servers(&self) -> &[ChainId] {
        &self.federated_servers
    }

    pub fn process_list(&self, dbheight: u32) -> Option<&ProcessList> {
        self.process_lists.get(dbheight)
    }

    pub fn dbstates(&self) -> &DbStateList {
        &self.dbstates
    }

    /// Highest block finalized and recorded
    pub fn highest_recorded_block(&self) -> Option<u32> {
        self.dbstates.highest_recorded_block()
    }

    /// Highest height this node has seen a message for
    pub fn highest_known_block(&self) -> u32 {
        self.process_lists
            .highest()
            .map_or(self.leader_height, |h| h.max(self.leader_height))
    }

    /// Directory block of the last finalized height
    pub fn directory_block(&self) -> Option<&DirectoryBlock> {
        self.dbstates.last().map(|s| &s.directory_block)
    }

    pub fn db_height_complete(&self) -> u32 {
        self.directory_block().map_or(0, |d| d.height)
    }

    /// Whether the node believes it is caught up with the network: the
    /// highest recorded block is at most one behind the highest known one.
    /// Latches after a long enough streak.
    pub fn green(&mut self) -> bool {
        if self.green_cnt > GREEN_LATCH {
            return true;
        }

        let high = self.highest_known_block();
        self.green_flag = match self.highest_recorded_block() {
            Some(rec) => rec.saturating_add(1) >= high,
            None => high == 0,
        };
        if self.green_flag {
            self.green_cnt += 1;
        } else {
            self.green_cnt = 0;
        }
        self.green_flag
    }

    pub fn holding_len(&self) -> usize {
        self.holding.len()
    }

    pub fn get_f(&self, address: &ChainId) -> i64 {
        self.factoid_state.get_f(address)
    }

    pub fn put_f(&mut self, rt: bool, address: ChainId, value: i64) {
        self.factoid_state.put_f(rt, address, value);
    }

    pub fn get_e(&self, address: &ChainId) -> i64 {
        self.factoid_state.get_e(address)
    }

    pub fn put_e(&mut self, rt: bool, address: ChainId, value: i64) {
        self.factoid_state.put_e(rt, address, value);
    }

    pub fn factoid_state(&self) -> &FactoidState {
        &self.factoid_state
    }

    pub fn get_new_eblocks(&self, dbheight: u32, chain_id: &ChainId) -> Option<&EntryBlock> {
        self.process_lists.get(dbheight)?.get_new_eblocks(chain_id)
    }

    pub fn put_new_eblocks(&mut self, dbheight: u32, eblock: EntryBlock) {
        if let Some(pl) = self.process_list_mut(dbheight) {
            pl.put_new_eblocks(eblock);
        }
    }

    pub fn put_new_entries(&mut self, dbheight: u32, hash: Hash, entry: Entry) {
        if let Some(pl) = self.process_list_mut(dbheight) {
            pl.put_new_entries(hash, entry);
        }
    }

    pub fn put_commits(&mut self, hash: Hash, msg: Message) {
        let height = self.leader_height;
        self.matcher.put_commits(hash, msg, height);
    }

    pub fn put_reveals(&mut self, hash: Hash, msg: Message) {
        let height = self.leader_height;
        self.matcher.put_reveals(hash, msg, height);
    }

    pub fn get_commits(&self, hash: &Hash) -> Option<&Message> {
        self.matcher.get_commits(hash)
    }

    pub fn get_reveals(&self, hash: &Hash) -> Option<&Message> {
        self.matcher.get_reveals(hash)
    }

    pub fn add_data_request(&mut self, hash: Hash) {
        self.data_requests
            .entry(hash)
            .or_insert_with(crate::types::now_millis);
    }

    pub fn has_data_request(&self, hash: &Hash) -> bool {
        self.data_requests.contains_key(hash)
    }

    pub fn eb_db_height_complete(&self) -> u32 {
        self.eb_db_height_complete
    }

    pub fn db(&self) -> &dyn DbOverlay {
        self.db.as_ref()
    }

    pub fn message_sender(&self) -> MessageSender {
        self.queues.sender()
    }

    /// Messages to broadcast
    pub fn network_out(&self) -> &Queue {
        &self.queues.network_out
    }

    /// Messages dropped as invalid
    pub fn invalid_messages(&self) -> &Queue {
        &self.queues.invalid
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            leader_height: self.leader_height,
            leader_minute: self.leader_minute,
            highest_recorded_block: self.highest_recorded_block(),
            holding: self.holding.len(),
            ..self.stats.clone()
        }
    }
}

/// Builder for NodeState
pub struct NodeStateBuilder {
    config: ConsensusConfig,
    identity: Option<Identity>,
    overlay: Option<Box<dyn DbOverlay>>,
    start_height: u32,
}

impl NodeStateBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsensusConfig::default(),
            identity: None,
            overlay: None,
            start_height: 0,
        }
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    pub fn lanes(mut self, lanes: usize) -> Self {
        self.config.lanes = lanes.max(1);
        self
    }

    pub fn federated_servers(mut self, servers: Vec<ChainId>) -> Self {
        self.config.federated_servers = servers;
        self
    }

    pub fn lookahead(mut self, heights: u32) -> Self {
        self.config.lookahead = heights;
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn overlay<D: DbOverlay + 'static>(mut self, overlay: D) -> Self {
        self.overlay = Some(Box::new(overlay));
        self
    }

    /// Height to start building when nothing has been finalized yet
    pub fn start_height(mut self, height: u32) -> Self {
        self.start_height = height;
        self
    }

    pub fn build(self) -> NodeState {
        let identity = self.identity.unwrap_or_else(Identity::generate);
        let db = self
            .overlay
            .unwrap_or_else(|| Box::new(MapOverlay::new()));
        NodeState::new(self.config, identity, db, self.start_height)
    }
}

impl Default for NodeStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
