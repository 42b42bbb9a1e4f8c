//! Message queues between producers and the consensus driver
//!
//! All queues are unbounded FIFOs. The driver is the only consumer of the
//! leader, follower and stall queues; network-out and invalid are drained by
//! whatever surrounds the core.

use crate::message::Message;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// One FIFO with both ends
#[derive(Debug, Clone)]
pub struct Queue {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

impl Queue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, msg: Message) {
        // Both ends live in `self`, so the channel cannot be disconnected here
        let _ = self.sender.send(msg);
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<Message> {
        match self.receiver.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<Message> {
        self.receiver.try_iter().collect()
    }

    pub fn receiver(&self) -> Receiver<Message> {
        self.receiver.clone()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

/// The node's queue set
#[derive(Debug, Clone, Default)]
pub struct MessageQueues {
    /// Locally generated messages this node leads
    pub leader: Queue,
    /// Everything from the network, plus acks this node issued
    pub follower: Queue,
    /// Messages waiting to be re-offered
    pub stall: Queue,
    /// Messages to broadcast
    pub network_out: Queue,
    /// Permanently rejected messages
    pub invalid: Queue,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(&self) -> MessageSender {
        MessageSender {
            leader: self.leader.sender.clone(),
            follower: self.follower.sender.clone(),
        }
    }
}

/// Handle for submitting messages to a node from other threads
#[derive(Clone)]
pub struct MessageSender {
    leader: Sender<Message>,
    follower: Sender<Message>,
}

impl MessageSender {
    /// Submit a locally generated message
    pub fn send_leader(&self, msg: Message) -> Result<(), String> {
        self.leader
            .try_send(msg)
            .map_err(|e| format!("Failed to submit leader message: {}", e))
    }

    /// Submit a message received from the network
    pub fn send_follower(&self, msg: Message) -> Result<(), String> {
        self.follower
            .try_send(msg)
            .map_err(|e| format!("Failed to submit follower message: {}", e))
    }
}
