//! dchain storage
//!
//! Sled-backed persistence for finalized blocks and the entries and entry
//! blocks they reference. [`BlockStore`] is also the database overlay the
//! consensus core writes entries through.

mod store;

pub use store::{BlockStore, ChainMetadata};
