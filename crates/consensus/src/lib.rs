//! dchain consensus - directory-block admission and block construction
//!
//! Architecture:
//! - Messages arrive on role-tagged queues and are admitted one per tick
//! - The leader of a lane orders messages by issuing hash-linked acks
//! - Followers admit (ack, message) pairs into per-height process lists
//! - Ten end-of-minute rounds close a height into an immutable DBState

pub mod ack;
pub mod blocks;
pub mod commits;
pub mod dbstate;
pub mod driver;
pub mod error;
pub mod execute;
pub mod factoid;
pub mod identity;
pub mod message;
pub mod overlay;
pub mod process_list;
pub mod queues;
pub mod router;
pub mod state;
pub mod types;
pub mod validation;

#[cfg(test)]
mod tests;

pub use blocks::{AdminBlock, DirectoryBlock, Entry, EntryBlock, EntryCreditBlock, FactoidBlock};
pub use dbstate::{DbState, DbStateList};
pub use error::{ConsensusError, Result};
pub use identity::Identity;
pub use message::{Message, Payload};
pub use overlay::{DbOverlay, MapOverlay};
pub use process_list::{Lane, ProcessList};
pub use queues::{MessageSender, Queue};
pub use state::{NodeState, NodeStateBuilder};
pub use types::*;
