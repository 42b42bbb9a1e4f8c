//! Multi-component flows through the driver

mod transition_test;

use crate::ack;
use crate::identity::Identity;
use crate::message::{Ack, Message, Payload, Signable};
use crate::state::NodeState;

/// A node that is the only federated server, on a single lane
pub(crate) fn single_leader(seed: u8) -> (NodeState, Identity) {
    let identity = Identity::from_seed([seed; 32]);
    let state = NodeState::builder()
        .node_name("leader")
        .lanes(1)
        .identity(identity.clone())
        .federated_servers(vec![identity.chain_id()])
        .build();
    (state, identity)
}

pub(crate) fn run(state: &mut NodeState, ticks: usize) {
    for _ in 0..ticks {
        state.process();
    }
}

/// Ask the local leader to close its minute and tick until it has
pub(crate) fn close_minute(state: &mut NodeState) {
    let minute = state.leader_minute();
    let height = state.leader_height();
    state
        .message_sender()
        .send_leader(Message::local_eom())
        .unwrap();

    for _ in 0..50 {
        state.process();
        if state.leader_minute() != minute || state.leader_height() != height {
            return;
        }
    }
    panic!("minute {} of height {} never closed", minute, height);
}

/// Ack from `leader` ordering `msg` after `prev` in a lane
pub(crate) fn signed_ack(
    leader: &Identity,
    msg: &Message,
    dbheight: u32,
    vm_index: u32,
    minute: u8,
    prev: Option<&Ack>,
) -> Ack {
    let (height, serial_hash) = ack::link(prev, &msg.hash());
    let mut ack = Ack {
        dbheight,
        vm_index,
        minute,
        timestamp: 0,
        message_hash: msg.hash(),
        leader_chain_id: leader.chain_id(),
        height,
        serial_hash,
        signature: Vec::new(),
    };
    ack.sign_with(leader);
    ack
}

pub(crate) fn ack_msg(ack: &Ack) -> Message {
    Message::new(Payload::Ack(ack.clone()))
}
