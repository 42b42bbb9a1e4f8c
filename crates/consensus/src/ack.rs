//! Acknowledgment chain
//!
//! Each lane's acknowledgments form a hash-linked sequence: the first ack has
//! sequence 0 and its own message hash as running hash; every later ack has
//! `prev.height + 1` and `create_hash(prev.message_hash, message_hash)`.
//! Any reordering or gap is therefore visible to whoever replays the lane.

use crate::error::{ConsensusError, Result};
use crate::message::{Ack, Message, Signable};
use crate::state::NodeState;
use crate::types::{create_hash, now_millis, short, Hash};

/// Sequence number and running hash for the ack that follows `prev`
pub fn link(prev: Option<&Ack>, message_hash: &Hash) -> (u32, Hash) {
    match prev {
        None => (0, *message_hash),
        Some(last) => (last.height + 1, create_hash(&last.message_hash, message_hash)),
    }
}

/// Whether `ack` is the correct successor of `prev`
pub fn follows(prev: Option<&Ack>, ack: &Ack) -> bool {
    link(prev, &ack.message_hash) == (ack.height, ack.serial_hash)
}

impl NodeState {
    /// Issue the next acknowledgment for `msg` in its lane at `dbheight`.
    ///
    /// The new ack becomes the lane's last leader ack before it is returned.
    pub fn new_ack(&mut self, dbheight: u32, msg: &Message) -> Result<Ack> {
        let vm_index = self.lane_of(msg);
        let message_hash = msg.hash();
        let minute = self.leader_minute as u8;
        let leader_chain_id = self.identity.chain_id();

        let (height, serial_hash) = {
            let pl = self
                .process_list_mut(dbheight)
                .ok_or(ConsensusError::NoProcessList(dbheight))?;
            if vm_index >= pl.lane_count() {
                return Err(ConsensusError::LaneOutOfRange(vm_index));
            }
            link(pl.get_last_leader_ack(vm_index), &message_hash)
        };

        let mut ack = Ack {
            dbheight,
            vm_index: vm_index as u32,
            minute,
            timestamp: now_millis(),
            message_hash,
            leader_chain_id,
            height,
            serial_hash,
            signature: Vec::new(),
        };
        ack.sign_with(&self.identity);
        if let Some(pl) = self.process_lists.get_mut(dbheight) {
            pl.set_last_leader_ack(vm_index, ack.clone());
        }

        self.stats.acks_issued += 1;
        tracing::trace!(
            "Ack {} for {} at height {} lane {}",
            ack.height,
            short(&message_hash),
            dbheight,
            vm_index
        );

        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::message::{AddServer, Payload};
    use crate::process_list::ProcessList;

    fn msg(n: u8) -> Message {
        Message::new(Payload::AddServer(AddServer {
            server_chain_id: [n; 32],
            server_type: 0,
            timestamp: 0,
            sponsor: [0u8; 32],
            signature: Vec::new(),
        }))
    }

    #[test]
    fn test_link_first_and_next() {
        let a = msg(1).hash();
        let b = msg(2).hash();

        let (h0, s0) = link(None, &a);
        assert_eq!((h0, s0), (0, a));

        let first = Ack {
            dbheight: 0,
            vm_index: 0,
            minute: 0,
            timestamp: 0,
            message_hash: a,
            leader_chain_id: [0u8; 32],
            height: h0,
            serial_hash: s0,
            signature: Vec::new(),
        };
        let (h1, s1) = link(Some(&first), &b);
        assert_eq!(h1, 1);
        assert_eq!(s1, create_hash(&a, &b));
    }

    #[test]
    fn test_new_ack_sequence() {
        let identity = Identity::from_seed([3u8; 32]);
        let mut state = NodeState::builder()
            .lanes(1)
            .identity(identity.clone())
            .federated_servers(vec![identity.chain_id()])
            .build();

        let heights: Vec<u32> = (1..=4)
            .map(|n| state.new_ack(0, &msg(n)).unwrap().height)
            .collect();
        assert_eq!(heights, vec![0, 1, 2, 3]);

        let last = state.process_list(0).unwrap().get_last_leader_ack(0).unwrap();
        assert_eq!(last.height, 3);
        assert!(last.verify());
        assert_eq!(last.leader_chain_id, identity.chain_id());
    }

    #[test]
    fn test_new_ack_without_process_list() {
        let mut state = NodeState::builder().lanes(1).build();
        let err = state.new_ack(500, &msg(1)).unwrap_err();
        assert_eq!(err, ConsensusError::NoProcessList(500));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_replay_reproduces_running_hash() {
        let identity = Identity::from_seed([5u8; 32]);
        let mut leader = NodeState::builder()
            .lanes(1)
            .identity(identity.clone())
            .federated_servers(vec![identity.chain_id()])
            .build();

        let pairs: Vec<(Ack, Message)> = (1..=6)
            .map(|n| {
                let m = msg(n);
                (leader.new_ack(0, &m).unwrap(), m)
            })
            .collect();

        let replay = |pairs: &[(Ack, Message)]| {
            let mut pl = ProcessList::new(0, 1, Vec::new());
            for (ack, m) in pairs {
                assert!(pl.add_to_process_list(ack.clone(), m.clone()));
            }
            pl.lanes[0]
                .list
                .iter()
                .map(|(a, _)| a.serial_hash)
                .collect::<Vec<_>>()
        };

        let first = replay(&pairs);
        let second = replay(&pairs);
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
        assert_eq!(first[0], pairs[0].1.hash());
    }
}
