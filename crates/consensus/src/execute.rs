//! Leader and follower execution, and the process-list side effects of each
//! message kind
//!
//! A leader executes a message by acknowledging it; the acknowledged message
//! waits in Holding until its ack comes back through the follower queue, at
//! which point both are admitted into the process list. Admitted messages
//! apply their side effects in lane order during the processing pass.

use crate::blocks::{EcEntry, Entry, EntryBlock};
use crate::error::{ConsensusError, Result};
use crate::message::{Message, Payload, Signable, DATA_TYPE_EBLOCK, DATA_TYPE_ENTRY};
use crate::state::NodeState;
use crate::types::{now_millis, short, Validity, ADMIN_CHAINID, EC_CHAINID, FACTOID_CHAINID};

impl Message {
    /// Order this message as leader of its lane. Returns the message as
    /// executed, ready for broadcast.
    pub fn leader_execute(self, state: &mut NodeState) -> Result<Message> {
        match self.payload {
            Payload::Eom(_) => state.leader_execute_eom(self),
            Payload::RevealEntry(_) => state.leader_execute_reveal(self),
            Payload::Ack(_) | Payload::DataResponse(_) | Payload::DbState(_) => {
                Err(ConsensusError::NotLeaderExecutable)
            }
            _ => state.leader_execute(self),
        }
    }

    pub fn follower_execute(self, state: &mut NodeState) -> Result<()> {
        match self.payload {
            Payload::Ack(_) => state.follower_execute_ack(self).map(|_| ()),
            Payload::DbState(_) => state.follower_execute_dbstate(self),
            Payload::DataResponse(_) => state.follower_execute_add_data(self),
            _ => state.follower_execute_msg(self).map(|_| ()),
        }
    }
}

impl NodeState {
    /// Acknowledge `msg` at the working height, hold it, and queue the ack
    pub fn leader_execute(&mut self, msg: Message) -> Result<Message> {
        let dbheight = self.leader_height;
        let ack = self.new_ack(dbheight, &msg)?;
        msg.clone().follower_execute(self)?;
        self.queues.follower.push(Message::from(ack));
        Ok(msg)
    }

    /// Close the current minute on the lane this node leads
    pub fn leader_execute_eom(&mut self, mut msg: Message) -> Result<Message> {
        if self.eom > 0 {
            return Err(ConsensusError::EomInProgress);
        }

        let dbheight = self.leader_height;
        let minute = self.leader_minute;
        let kind = msg.kind();
        let Payload::Eom(eom) = &mut msg.payload else {
            panic!("leader_execute_eom requires an EOM, got {}", kind);
        };
        eom.dbheight = dbheight;
        eom.vm_index = self.leader_vm_index as u32;
        eom.minute = minute as u8;
        eom.timestamp = now_millis();
        eom.server = self.identity.chain_id();
        eom.sign_with(&self.identity);
        msg.local = false;

        let ack = self.new_ack(dbheight, &msg)?;
        self.eom = minute + 1;
        tracing::debug!(
            "{}: EOM for minute {} at height {} on lane {}",
            self.config.node_name,
            minute,
            dbheight,
            self.leader_vm_index
        );

        msg.clone().follower_execute(self)?;
        self.queues.follower.push(Message::from(ack));
        Ok(msg)
    }

    /// A reveal is only ordered once its commit has been processed; until
    /// then it is buffered.
    pub(crate) fn leader_execute_reveal(&mut self, msg: Message) -> Result<Message> {
        let Some(hash) = msg.entry_hash() else {
            return Err(ConsensusError::NotLeaderExecutable);
        };
        if self.get_commits(&hash).is_none() {
            tracing::trace!("Buffering reveal {} until its commit arrives", short(&hash));
            self.put_reveals(hash, msg.clone());
            return Ok(msg);
        }
        self.leader_execute(msg)
    }

    /// Match a message against its ack. Without an ack the message is held.
    ///
    /// Returns true if an ack was found, whether or not the pair could be
    /// admitted.
    pub fn follower_execute_msg(&mut self, msg: Message) -> Result<bool> {
        let hash = msg.hash();
        let Some(ack) = self.acks.remove(&hash) else {
            self.holding.insert(hash, msg);
            return Ok(false);
        };
        self.holding.remove(&hash);

        if ack.dbheight < self.leader_height {
            return Ok(true);
        }

        let dbheight = ack.dbheight;
        let admitted = match self.process_list_mut(dbheight) {
            Some(pl) => {
                if pl.add_to_process_list(ack.clone(), msg.clone()) {
                    pl.old_acks.insert(hash, ack.clone());
                    pl.old_msgs.insert(hash, msg.clone());
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if !admitted {
            self.stall_msg(msg);
            self.stall_msg(Message::from(ack));
            return Ok(true);
        }

        self.stats.messages_processed += 1;
        tracing::trace!(
            "{}: admitted {} at height {} lane {} seq {}",
            self.config.node_name,
            msg,
            dbheight,
            ack.vm_index,
            ack.height
        );
        self.process_pass(dbheight);
        Ok(true)
    }

    /// Record an ack and re-run the message it orders, if held
    pub fn follower_execute_ack(&mut self, msg: Message) -> Result<bool> {
        let kind = msg.kind();
        let Payload::Ack(ack) = msg.payload else {
            panic!("follower_execute_ack requires an ack, got {}", kind);
        };
        let hash = ack.message_hash;
        self.acks.insert(hash, ack);

        match self.holding.get(&hash).cloned() {
            Some(held) => {
                held.follower_execute(self)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Adopt a finalized block received from the network
    pub fn follower_execute_dbstate(&mut self, msg: Message) -> Result<()> {
        let Payload::DbState(m) = msg.payload else {
            return Err(ConsensusError::MalformedData("expected a DBState".to_string()));
        };
        self.dbstates.last_time = now_millis();
        self.add_dbstate(
            false,
            m.directory_block,
            m.admin_block,
            m.factoid_block,
            m.entry_credit_block,
        );
        Ok(())
    }

    /// Store a requested entry or entry block. Objects whose hash does not
    /// match the requested one are ignored.
    pub fn follower_execute_add_data(&mut self, msg: Message) -> Result<()> {
        let Payload::DataResponse(resp) = msg.payload else {
            return Err(ConsensusError::MalformedData("expected a data response".to_string()));
        };

        match resp.data_type {
            DATA_TYPE_ENTRY => {
                let entry: Entry = borsh::from_slice(&resp.data)
                    .map_err(|e| ConsensusError::MalformedData(e.to_string()))?;
                if entry.hash() == resp.data_hash {
                    self.db.insert_entry(&entry)?;
                    self.data_requests.remove(&resp.data_hash);
                }
            }
            DATA_TYPE_EBLOCK => {
                let eblock: EntryBlock = borsh::from_slice(&resp.data)
                    .map_err(|e| ConsensusError::MalformedData(e.to_string()))?;
                if eblock.key_mr() == resp.data_hash {
                    self.add_eblock(eblock)?;
                }
            }
            other => return Err(ConsensusError::UnsupportedDataType(other)),
        }
        Ok(())
    }

    /// Store an entry block this node asked for
    fn add_eblock(&mut self, eblock: EntryBlock) -> Result<()> {
        let key = eblock.key_mr();
        if !self.has_data_request(&key) {
            return Ok(());
        }

        self.db.process_eblock_batch(&eblock, true)?;
        self.data_requests.remove(&key);

        if self.get_all_entries(&eblock)? && self.eb_db_height_complete < eblock.height {
            self.eb_db_height_complete = eblock.height;
        }
        Ok(())
    }

    /// True if every entry of `eblock` is stored. Missing entries are requested.
    fn get_all_entries(&mut self, eblock: &EntryBlock) -> Result<bool> {
        let mut complete = true;
        for hash in eblock.entry_hashes() {
            if self.db.fetch_entry(hash)?.is_none() {
                self.add_data_request(*hash);
                complete = false;
            }
        }
        Ok(complete)
    }

    /// Execute admitted messages in lane order, stopping each lane at the
    /// first message that is not ready yet
    pub(crate) fn process_pass(&mut self, dbheight: u32) {
        if self.processing {
            return;
        }
        let Some(lanes) = self.process_lists.get(dbheight).map(|pl| pl.lane_count()) else {
            return;
        };

        self.processing = true;
        for vm_index in 0..lanes {
            while let Some(msg) = self
                .process_lists
                .get(dbheight)
                .and_then(|pl| pl.next_unprocessed(vm_index))
            {
                if !self.process_msg(dbheight, &msg) {
                    break;
                }
                match self.process_lists.get_mut(dbheight) {
                    Some(pl) => pl.mark_processed(vm_index),
                    None => break,
                }
            }
        }
        self.processing = false;
    }

    /// Apply an admitted message to the process list. False means not ready.
    pub(crate) fn process_msg(&mut self, dbheight: u32, msg: &Message) -> bool {
        match &msg.payload {
            Payload::Eom(_) => self.process_eom(dbheight, msg),
            Payload::DirectoryBlockSignature(_) => self.process_dbsig(dbheight, msg),
            Payload::CommitChain(_) => self.process_commit_chain(dbheight, msg),
            Payload::CommitEntry(_) => self.process_commit_entry(dbheight, msg),
            Payload::RevealEntry(_) => self.process_reveal_entry(dbheight, msg),
            Payload::AddServer(_) => self.process_add_server(dbheight, msg),
            Payload::Ack(_) | Payload::DataResponse(_) | Payload::DbState(_) => true,
        }
    }

    pub fn process_eom(&mut self, dbheight: u32, msg: &Message) -> bool {
        let Payload::Eom(e) = &msg.payload else {
            panic!("process_eom requires an EOM, got {}", msg.kind());
        };
        let minute = e.minute;
        let vm_index = e.vm_index as usize;

        // Minutes only close on the height under construction
        if dbheight != self.leader_height {
            return false;
        }
        if self.eom == 0 && !self.leader {
            self.eom = minute as usize + 1;
        }

        let leader_minute = self.leader_minute;
        let Some(pl) = self.process_lists.get_mut(dbheight) else {
            return false;
        };

        pl.set_minute(vm_index, minute as usize);
        if pl.minute_complete() < leader_minute {
            return false;
        }

        let factoid_lane = pl.vm_index_for(&FACTOID_CHAINID) == vm_index;
        if factoid_lane {
            // Once per minute: piggybacks on the factoid settlement
            for eb in pl.new_eblocks.values_mut() {
                eb.add_end_of_minute_marker(minute);
            }
        }
        if pl.vm_index_for(&ADMIN_CHAINID) == vm_index {
            pl.admin_block.add_end_of_minute_marker(minute);
        }
        if pl.vm_index_for(&EC_CHAINID) == vm_index {
            pl.entry_credit_block.add_entry(EcEntry::MinuteNumber(minute));
        }
        if let Some(lane) = pl.lanes.get_mut(vm_index) {
            lane.minute_finished = minute as usize + 1;
        }

        if factoid_lane {
            self.factoid_state.end_of_period(minute);
        }
        true
    }

    /// Admit a directory block signature only if it validates outright,
    /// recording it in the admin block
    pub fn process_dbsig(&mut self, dbheight: u32, msg: &Message) -> bool {
        let Payload::DirectoryBlockSignature(dbsig) = &msg.payload else {
            panic!("process_dbsig requires a directory block signature, got {}", msg.kind());
        };
        if msg.validate(self) != Validity::Accept {
            return false;
        }
        let Some(pl) = self.process_lists.get_mut(dbheight) else {
            return false;
        };
        pl.admin_block.add_dbsig(
            dbsig.server,
            dbsig.directory_block_key_mr,
            dbsig.signature.clone(),
        );
        true
    }

    pub fn process_commit_chain(&mut self, dbheight: u32, msg: &Message) -> bool {
        match &msg.payload {
            Payload::CommitChain(c) => {
                self.process_commit(dbheight, msg, EcEntry::CommitChain(c.clone()))
            }
            _ => false,
        }
    }

    pub fn process_commit_entry(&mut self, dbheight: u32, msg: &Message) -> bool {
        match &msg.payload {
            Payload::CommitEntry(c) => {
                self.process_commit(dbheight, msg, EcEntry::CommitEntry(c.clone()))
            }
            _ => false,
        }
    }

    fn process_commit(&mut self, dbheight: u32, msg: &Message, ec_entry: EcEntry) -> bool {
        let Some(entry_hash) = msg.entry_hash() else {
            return false;
        };
        let Some(pl) = self.process_lists.get_mut(dbheight) else {
            return false;
        };

        pl.entry_credit_block.add_entry(ec_entry.clone());
        self.factoid_state.update_ec_transaction(true, &ec_entry);
        self.put_commits(entry_hash, msg.clone());

        if let Some(reveal) = self.matcher.take_reveal(&entry_hash) {
            self.execute_buffered_reveal(reveal);
        }
        true
    }

    /// Order a reveal whose commit was just processed
    fn execute_buffered_reveal(&mut self, reveal: Message) {
        let leads = self.leader && self.lane_of(&reveal) == self.leader_vm_index;
        if !leads {
            self.stall_msg(reveal);
            return;
        }
        match reveal.clone().leader_execute(self) {
            Ok(executed) => self.queues.network_out.push(executed),
            Err(e) => {
                tracing::debug!("Buffered reveal {} not ordered yet: {}", reveal, e);
                self.stall_msg(reveal);
            }
        }
    }

    /// Add a revealed entry to its chain's entry block. Not ready until the
    /// matching commit has been processed.
    pub fn process_reveal_entry(&mut self, dbheight: u32, msg: &Message) -> bool {
        let Payload::RevealEntry(reveal) = &msg.payload else {
            return false;
        };
        let hash = reveal.entry_hash();
        if self.matcher.get_commits(&hash).is_none() {
            return false;
        }
        let Some(pl) = self.process_lists.get_mut(dbheight) else {
            return false;
        };

        let chain_id = reveal.entry.chain_id;
        pl.new_eblocks
            .entry(chain_id)
            .or_insert_with(|| EntryBlock::new(chain_id, dbheight))
            .add_entry(hash);
        pl.put_new_entries(hash, reveal.entry.clone());

        self.matcher.take_commit(&hash);
        self.matcher.take_reveal(&hash);
        tracing::debug!(
            "{}: entry {} added to chain {} at height {}",
            self.config.node_name,
            short(&hash),
            short(&chain_id),
            dbheight
        );
        true
    }

    /// Federated add-server requests land in the admin block; the server
    /// joins the authority set once that block is finalized.
    pub fn process_add_server(&mut self, dbheight: u32, msg: &Message) -> bool {
        let Payload::AddServer(add) = &msg.payload else {
            return true;
        };
        if add.server_type != 0 {
            return true;
        }
        let Some(pl) = self.process_lists.get_mut(dbheight) else {
            return false;
        };
        pl.admin_block.add_fed_server(add.server_chain_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::EbEntry;
    use crate::identity::Identity;
    use crate::message::{AddServer, DataResponse, Eom};

    fn eom(minute: u8, vm_index: u32) -> Message {
        Message::new(Payload::Eom(Eom {
            dbheight: 0,
            vm_index,
            minute,
            timestamp: 0,
            server: [0u8; 32],
            signature: Vec::new(),
        }))
    }

    #[test]
    #[should_panic(expected = "process_eom requires an EOM")]
    fn test_process_eom_rejects_other_kinds() {
        let mut state = NodeState::builder().lanes(1).build();
        let msg = Message::new(Payload::AddServer(AddServer {
            server_chain_id: [1u8; 32],
            server_type: 0,
            timestamp: 0,
            sponsor: [0u8; 32],
            signature: Vec::new(),
        }));
        state.process_eom(0, &msg);
    }

    #[test]
    fn test_process_eom_side_effects_single_lane() {
        let mut state = NodeState::builder().lanes(1).build();
        state.process_list_mut(0).unwrap();
        state.put_new_eblocks(0, EntryBlock::new([7u8; 32], 0));

        assert!(state.process_eom(0, &eom(0, 0)));

        let pl = state.process_list(0).unwrap();
        assert_eq!(pl.lanes[0].minute_finished, 1);
        assert_eq!(pl.entry_credit_block.entries, vec![EcEntry::MinuteNumber(0)]);
        assert_eq!(pl.admin_block.entries.len(), 1);
        let eb = state.get_new_eblocks(0, &[7u8; 32]).unwrap();
        assert_eq!(eb.entries, vec![EbEntry::EndOfMinute(0)]);
        assert_eq!(state.factoid_state().current_block().period_marks, vec![0]);
        // Follower picks the transition up from the EOM
        assert_eq!(state.eom(), 1);
    }

    #[test]
    fn test_process_eom_waits_for_slowest_lane() {
        let mut state = NodeState::builder().lanes(3).build();
        state.leader_minute = 1;
        state.process_list_mut(0).unwrap();

        assert!(!state.process_eom(0, &eom(1, 0)));
        assert!(!state.process_eom(0, &eom(1, 1)));
        assert!(state.process_eom(0, &eom(1, 2)));
        assert_eq!(state.process_list(0).unwrap().minute_complete(), 1);
    }

    #[test]
    fn test_held_message_admitted_when_ack_arrives() {
        let identity = Identity::from_seed([6u8; 32]);
        let mut state = NodeState::builder()
            .lanes(1)
            .identity(identity.clone())
            .federated_servers(vec![identity.chain_id()])
            .build();

        let msg = eom(0, 0);
        assert!(!state.follower_execute_msg(msg.clone()).unwrap());
        assert_eq!(state.holding_len(), 1);

        let ack = state.new_ack(0, &msg).unwrap();
        assert!(state.follower_execute_ack(Message::from(ack)).unwrap());
        assert_eq!(state.holding_len(), 0);

        let pl = state.process_list(0).unwrap();
        assert!(pl.has_old_msg(&msg.hash()));
        assert_eq!(pl.lanes[0].processed, 1);
    }

    #[test]
    fn test_add_data_entry_requires_matching_hash() {
        let mut state = NodeState::builder().lanes(1).build();
        let entry = Entry {
            chain_id: [1u8; 32],
            ext_ids: Vec::new(),
            content: b"payload".to_vec(),
        };
        state.add_data_request(entry.hash());

        let wrong = DataResponse {
            data_type: DATA_TYPE_ENTRY,
            data_hash: [0u8; 32],
            data: borsh::to_vec(&entry).unwrap(),
        };
        state
            .follower_execute_add_data(Message::new(Payload::DataResponse(wrong)))
            .unwrap();
        assert!(state.db().fetch_entry(&entry.hash()).unwrap().is_none());

        let right = DataResponse {
            data_type: DATA_TYPE_ENTRY,
            data_hash: entry.hash(),
            data: borsh::to_vec(&entry).unwrap(),
        };
        state
            .follower_execute_add_data(Message::new(Payload::DataResponse(right)))
            .unwrap();
        assert_eq!(state.db().fetch_entry(&entry.hash()).unwrap(), Some(entry.clone()));
        assert!(!state.has_data_request(&entry.hash()));
    }

    #[test]
    fn test_add_data_eblock_only_when_requested() {
        let mut state = NodeState::builder().lanes(1).build();
        let entry = Entry {
            chain_id: [1u8; 32],
            ext_ids: Vec::new(),
            content: b"a".to_vec(),
        };
        let mut eblock = EntryBlock::new([1u8; 32], 4);
        eblock.add_entry(entry.hash());
        let resp = || {
            Message::new(Payload::DataResponse(DataResponse {
                data_type: DATA_TYPE_EBLOCK,
                data_hash: eblock.key_mr(),
                data: borsh::to_vec(&eblock).unwrap(),
            }))
        };

        state.follower_execute_add_data(resp()).unwrap();
        assert!(state.db().fetch_eblock(&eblock.key_mr()).unwrap().is_none());

        state.add_data_request(eblock.key_mr());
        state.follower_execute_add_data(resp()).unwrap();
        assert!(state.db().fetch_eblock(&eblock.key_mr()).unwrap().is_some());
        // Its entry is missing, so it is requested and the height is not complete
        assert!(state.has_data_request(&entry.hash()));
        assert_eq!(state.eb_db_height_complete(), 0);

        state.db.insert_entry(&entry).unwrap();
        state.add_data_request(eblock.key_mr());
        state.follower_execute_add_data(resp()).unwrap();
        assert_eq!(state.eb_db_height_complete(), 4);
    }

    #[test]
    fn test_add_data_unsupported_type() {
        let mut state = NodeState::builder().lanes(1).build();
        let resp = DataResponse {
            data_type: 9,
            data_hash: [0u8; 32],
            data: Vec::new(),
        };
        let err = state
            .follower_execute_add_data(Message::new(Payload::DataResponse(resp)))
            .unwrap_err();
        assert_eq!(err, ConsensusError::UnsupportedDataType(9));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_leader_eom_rejected_during_transition() {
        let mut state = NodeState::builder().lanes(1).build();
        state.eom = 3;
        let err = state.leader_execute_eom(Message::local_eom()).unwrap_err();
        assert_eq!(err, ConsensusError::EomInProgress);
    }
}
