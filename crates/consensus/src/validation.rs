//! Message validation against the current node state

use crate::message::{Message, Payload, Signable, DATA_TYPE_EBLOCK, DATA_TYPE_ENTRY};
use crate::state::NodeState;
use crate::types::Validity;

/// Largest entry content accepted in a reveal
pub const MAX_ENTRY_SIZE: usize = 10240;

impl Message {
    pub fn validate(&self, state: &NodeState) -> Validity {
        let finalized = |height: u32| {
            state
                .highest_recorded_block()
                .is_some_and(|highest| height <= highest)
        };
        let lanes = state.config().lanes;

        match &self.payload {
            // Filled in and signed by the leader when executed
            Payload::Eom(_) if self.is_local() => Validity::Accept,

            Payload::Eom(eom) => {
                if finalized(eom.dbheight) || eom.vm_index as usize >= lanes {
                    return Validity::Reject;
                }
                if !eom.verify() || !state.fed_servers_at(eom.dbheight).contains(&eom.server) {
                    return Validity::Reject;
                }
                Validity::Accept
            }

            Payload::Ack(ack) => {
                if finalized(ack.dbheight) || ack.vm_index as usize >= lanes {
                    return Validity::Reject;
                }
                if !ack.verify() || !state.fed_servers_at(ack.dbheight).contains(&ack.leader_chain_id) {
                    return Validity::Reject;
                }
                Validity::Accept
            }

            Payload::DirectoryBlockSignature(dbsig) => {
                if dbsig.dbheight == 0 || finalized(dbsig.dbheight) {
                    return Validity::Reject;
                }
                let Some(signed) = state.dbstates().get(dbsig.dbheight - 1) else {
                    return Validity::Indeterminate;
                };
                if signed.directory_block.key_mr() != dbsig.directory_block_key_mr {
                    return Validity::Reject;
                }
                if !dbsig.verify() || !state.fed_servers_at(dbsig.dbheight).contains(&dbsig.server) {
                    return Validity::Reject;
                }
                Validity::Accept
            }

            Payload::CommitChain(commit) => {
                if !commit.verify() || commit.credits == 0 {
                    return Validity::Reject;
                }
                if state.get_e(&commit.ec_public_key) < commit.credits as i64 {
                    return Validity::Indeterminate;
                }
                Validity::Accept
            }

            Payload::CommitEntry(commit) => {
                if !commit.verify() || commit.credits == 0 {
                    return Validity::Reject;
                }
                if state.get_e(&commit.ec_public_key) < commit.credits as i64 {
                    return Validity::Indeterminate;
                }
                Validity::Accept
            }

            Payload::RevealEntry(reveal) => {
                if reveal.entry.content.len() > MAX_ENTRY_SIZE {
                    return Validity::Reject;
                }
                Validity::Accept
            }

            Payload::AddServer(add) => {
                if add.server_type > 1 || !state.is_fed_server(&add.sponsor) || !add.verify() {
                    return Validity::Reject;
                }
                Validity::Accept
            }

            Payload::DataResponse(resp) => match resp.data_type {
                DATA_TYPE_ENTRY | DATA_TYPE_EBLOCK => Validity::Accept,
                _ => Validity::Reject,
            },

            Payload::DbState(m) => {
                let height = m.directory_block.height;
                if m.admin_block.height != height
                    || m.factoid_block.height != height
                    || m.entry_credit_block.height != height
                {
                    return Validity::Reject;
                }
                // The working height moves past every recorded block
                if height == u32::MAX || state.dbstates().get(height).is_some() {
                    return Validity::Reject;
                }
                Validity::Accept
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{AdminBlock, DirectoryBlock, Entry, EntryCreditBlock, FactoidBlock};
    use crate::identity::Identity;
    use crate::message::{CommitEntry, DataResponse, DbStateMsg, DirectoryBlockSignature, Eom, RevealEntry};

    fn fed_state(identity: &Identity) -> NodeState {
        NodeState::builder()
            .lanes(1)
            .identity(identity.clone())
            .federated_servers(vec![identity.chain_id()])
            .build()
    }

    #[test]
    fn test_eom_signed_by_fed_server() {
        let fed = Identity::from_seed([1u8; 32]);
        let stranger = Identity::from_seed([2u8; 32]);
        let state = fed_state(&fed);

        let mut eom = Eom {
            dbheight: 0,
            vm_index: 0,
            minute: 0,
            timestamp: 1,
            server: fed.chain_id(),
            signature: Vec::new(),
        };
        eom.sign_with(&fed);
        assert_eq!(Message::new(Payload::Eom(eom.clone())).validate(&state), Validity::Accept);

        let mut forged = eom.clone();
        forged.server = stranger.chain_id();
        forged.sign_with(&stranger);
        assert_eq!(Message::new(Payload::Eom(forged)).validate(&state), Validity::Reject);

        eom.minute = 4;
        assert_eq!(Message::new(Payload::Eom(eom)).validate(&state), Validity::Reject);
    }

    #[test]
    fn test_commit_needs_balance() {
        let identity = Identity::from_seed([3u8; 32]);
        let mut state = fed_state(&identity);

        let mut commit = CommitEntry {
            entry_hash: [9u8; 32],
            credits: 2,
            timestamp: 0,
            ec_public_key: identity.chain_id(),
            signature: Vec::new(),
        };
        commit.sign_with(&identity);
        let msg = Message::new(Payload::CommitEntry(commit));

        assert_eq!(msg.validate(&state), Validity::Indeterminate);
        state.put_e(false, identity.chain_id(), 2);
        assert_eq!(msg.validate(&state), Validity::Accept);
    }

    #[test]
    fn test_dbsig_waits_for_previous_block() {
        let identity = Identity::from_seed([4u8; 32]);
        let mut state = fed_state(&identity);

        let mut dbsig = DirectoryBlockSignature {
            dbheight: 1,
            vm_index: 0,
            directory_block_key_mr: DirectoryBlock::new(0, [0u8; 32]).key_mr(),
            server: identity.chain_id(),
            timestamp: 0,
            signature: Vec::new(),
        };
        dbsig.sign_with(&identity);
        let msg = Message::new(Payload::DirectoryBlockSignature(dbsig));
        assert_eq!(msg.validate(&state), Validity::Indeterminate);

        state.add_dbstate(
            true,
            DirectoryBlock::new(0, [0u8; 32]),
            AdminBlock::new(0),
            FactoidBlock::new(0),
            EntryCreditBlock::new(0),
        );
        assert_eq!(msg.validate(&state), Validity::Accept);

        let mut wrong_key = DirectoryBlock::new(0, [1u8; 32]);
        wrong_key.add_entry([2u8; 32], [3u8; 32]);
        let mut other = DirectoryBlockSignature {
            dbheight: 1,
            vm_index: 0,
            directory_block_key_mr: wrong_key.key_mr(),
            server: identity.chain_id(),
            timestamp: 0,
            signature: Vec::new(),
        };
        other.sign_with(&identity);
        assert_eq!(
            Message::new(Payload::DirectoryBlockSignature(other)).validate(&state),
            Validity::Reject
        );
    }

    #[test]
    fn test_oversized_reveal_rejected() {
        let state = NodeState::builder().lanes(1).build();
        let reveal = RevealEntry {
            entry: Entry {
                chain_id: [1u8; 32],
                ext_ids: Vec::new(),
                content: vec![0u8; MAX_ENTRY_SIZE + 1],
            },
            timestamp: 0,
        };
        assert_eq!(Message::new(Payload::RevealEntry(reveal)).validate(&state), Validity::Reject);
    }

    #[test]
    fn test_unsupported_data_type_rejected() {
        let state = NodeState::builder().lanes(1).build();
        let resp = DataResponse {
            data_type: 7,
            data_hash: [0u8; 32],
            data: Vec::new(),
        };
        assert_eq!(Message::new(Payload::DataResponse(resp)).validate(&state), Validity::Reject);
    }

    #[test]
    fn test_dbstate_heights_must_agree() {
        let state = NodeState::builder().lanes(1).build();
        let msg = DbStateMsg {
            directory_block: DirectoryBlock::new(3, [0u8; 32]),
            admin_block: AdminBlock::new(3),
            factoid_block: FactoidBlock::new(2),
            entry_credit_block: EntryCreditBlock::new(3),
            timestamp: 0,
        };
        assert_eq!(Message::new(Payload::DbState(msg)).validate(&state), Validity::Reject);
    }

    #[test]
    fn test_dbstate_at_last_height_rejected() {
        let state = NodeState::builder().lanes(1).build();
        let height = u32::MAX;
        let msg = DbStateMsg {
            directory_block: DirectoryBlock::new(height, [0u8; 32]),
            admin_block: AdminBlock::new(height),
            factoid_block: FactoidBlock::new(height),
            entry_credit_block: EntryCreditBlock::new(height),
            timestamp: 0,
        };
        assert_eq!(Message::new(Payload::DbState(msg)).validate(&state), Validity::Reject);
    }
}
