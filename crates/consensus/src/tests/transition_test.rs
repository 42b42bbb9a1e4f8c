//! Leader traffic racing a minute transition, and rebroadcast of stalled
//! messages

use super::{ack_msg, close_minute, run, signed_ack, single_leader};
use crate::identity::Identity;
use crate::message::{AddServer, Message, Payload, Signable};
use crate::state::NodeState;

/// Audit-server request; admitting it leaves the authority set alone
fn request(sponsor: &Identity, n: u8) -> Message {
    let mut add = AddServer {
        server_chain_id: [n; 32],
        server_type: 1,
        timestamp: n as u64,
        sponsor: sponsor.chain_id(),
        signature: Vec::new(),
    };
    add.sign_with(sponsor);
    Message::new(Payload::AddServer(add))
}

fn assert_lane_drained(state: &NodeState, len: usize) {
    let pl = state.process_list(0).unwrap();
    assert_eq!(pl.lanes[0].list.len(), len);
    assert_eq!(pl.lanes[0].processed, len);
    assert!(state.queues.stall.is_empty());
    assert_eq!(state.holding_len(), 0);
}

#[test]
fn test_leader_orders_across_minute_transition() {
    let (mut state, identity) = single_leader(30);
    let sender = state.message_sender();

    // Acked while the EOM is still in flight
    sender.send_leader(Message::local_eom()).unwrap();
    sender.send_follower(request(&identity, 1)).unwrap();
    run(&mut state, 40);
    assert_eq!(state.leader_minute(), 1);
    assert_lane_drained(&state, 2);

    for n in 2..5 {
        sender.send_follower(request(&identity, n)).unwrap();
    }
    run(&mut state, 80);
    assert_lane_drained(&state, 5);

    close_minute(&mut state);
    assert_eq!(state.leader_minute(), 2);
}

#[test]
fn test_repeat_during_transition_is_acked_once() {
    let (mut state, identity) = single_leader(31);
    let sender = state.message_sender();
    let msg = request(&identity, 1);

    sender.send_leader(Message::local_eom()).unwrap();
    sender.send_follower(msg.clone()).unwrap();
    sender.send_follower(msg).unwrap();
    run(&mut state, 40);
    assert_eq!(state.leader_minute(), 1);
    assert_lane_drained(&state, 2);

    sender.send_follower(request(&identity, 2)).unwrap();
    run(&mut state, 40);
    assert_lane_drained(&state, 3);
    let last = state.process_list(0).unwrap().lanes[0].last_leader_ack.clone();
    assert_eq!(last.map(|a| a.height), Some(2));
}

#[test]
fn test_stalled_message_rebroadcast_once_admitted() {
    let leader = Identity::from_seed([32u8; 32]);
    let mut state = NodeState::builder()
        .lanes(1)
        .identity(Identity::from_seed([33u8; 32]))
        .federated_servers(vec![leader.chain_id()])
        .build();

    // Still waiting for its ack: already broadcast once, stays quiet
    let mut waiting = request(&leader, 1);
    waiting.stalled = true;
    state.try_to_process(waiting);
    assert_eq!(state.holding_len(), 1);
    assert!(state.network_out().is_empty());

    let mut paired = request(&leader, 2);
    let ack = signed_ack(&leader, &paired, 0, 0, 0, None);
    state.try_to_process(ack_msg(&ack));
    assert_eq!(state.network_out().len(), 1);

    paired.stalled = true;
    state.try_to_process(paired);
    assert_eq!(state.network_out().len(), 2);
    assert_eq!(state.process_list(0).unwrap().lanes[0].list.len(), 1);
}
