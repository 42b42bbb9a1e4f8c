//! Commit/reveal matching
//!
//! Entries are submitted in two phases: a commit pays for the entry, a reveal
//! supplies it. Both are keyed by entry hash so they can pair up in either
//! arrival order.

use crate::message::Message;
use crate::types::Hash;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Pending {
    msg: Message,
    /// Height the message was stored at
    height: u32,
}

/// Pending commits and reveals by entry hash
#[derive(Debug, Default)]
pub struct EntryMatcher {
    commits: HashMap<Hash, Pending>,
    reveals: HashMap<Hash, Pending>,
}

/// Insert into a pending map. Countable duplicates bump the stored repeat
/// count and leave the stored message untouched.
fn put(map: &mut HashMap<Hash, Pending>, hash: Hash, mut msg: Message, height: u32) {
    if msg.is_countable() {
        if let Some(existing) = map.get_mut(&hash) {
            if !existing.msg.is_countable() {
                panic!(
                    "non-countable {} stored under entry hash where a countable {} was expected",
                    existing.msg.kind(),
                    msg.kind()
                );
            }
            existing.msg.count += 1;
            return;
        }
        msg.count = 1;
    }
    map.insert(hash, Pending { msg, height });
}

impl EntryMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_commits(&mut self, hash: Hash, msg: Message, height: u32) {
        put(&mut self.commits, hash, msg, height);
    }

    pub fn put_reveals(&mut self, hash: Hash, msg: Message, height: u32) {
        put(&mut self.reveals, hash, msg, height);
    }

    pub fn get_commits(&self, hash: &Hash) -> Option<&Message> {
        self.commits.get(hash).map(|p| &p.msg)
    }

    pub fn get_reveals(&self, hash: &Hash) -> Option<&Message> {
        self.reveals.get(hash).map(|p| &p.msg)
    }

    pub fn take_commit(&mut self, hash: &Hash) -> Option<Message> {
        self.commits.remove(hash).map(|p| p.msg)
    }

    pub fn take_reveal(&mut self, hash: &Hash) -> Option<Message> {
        self.reveals.remove(hash).map(|p| p.msg)
    }

    /// Drop commits and reveals stored before `height`: their block window
    /// has closed without a match.
    pub fn purge_before(&mut self, height: u32) {
        let before = self.commits.len() + self.reveals.len();
        self.commits.retain(|_, p| p.height >= height);
        self.reveals.retain(|_, p| p.height >= height);
        let dropped = before - self.commits.len() - self.reveals.len();
        if dropped > 0 {
            tracing::debug!("Dropped {} unmatched commits/reveals before height {}", dropped, height);
        }
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    pub fn reveal_count(&self) -> usize {
        self.reveals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommitEntry, Payload};

    fn commit(timestamp: u64) -> Message {
        Message::new(Payload::CommitEntry(CommitEntry {
            entry_hash: [1u8; 32],
            credits: 1,
            timestamp,
            ec_public_key: [2u8; 32],
            signature: Vec::new(),
        }))
    }

    #[test]
    fn test_duplicate_commits_share_counter() {
        let mut matcher = EntryMatcher::new();
        let first = commit(100);
        let second = commit(200);

        matcher.put_commits([1u8; 32], first.clone(), 3);
        matcher.put_commits([1u8; 32], second, 3);

        let stored = matcher.get_commits(&[1u8; 32]).unwrap();
        assert_eq!(stored.count, 2);
        assert_eq!(stored.payload, first.payload);
        assert_eq!(matcher.commit_count(), 1);
    }

    #[test]
    fn test_purge_before() {
        let mut matcher = EntryMatcher::new();
        matcher.put_commits([1u8; 32], commit(1), 3);
        matcher.put_commits([2u8; 32], commit(2), 5);

        matcher.purge_before(4);
        assert!(matcher.get_commits(&[1u8; 32]).is_none());
        assert!(matcher.get_commits(&[2u8; 32]).is_some());
    }

    #[test]
    #[should_panic(expected = "non-countable")]
    fn test_non_countable_under_commit_key_panics() {
        let mut matcher = EntryMatcher::new();
        matcher.put_commits([1u8; 32], Message::local_eom(), 0);
        matcher.put_commits([1u8; 32], commit(1), 0);
    }

    #[test]
    fn test_non_countable_overwrites() {
        let mut matcher = EntryMatcher::new();
        matcher.put_reveals([1u8; 32], Message::local_eom(), 0);
        matcher.put_reveals([1u8; 32], Message::local_eom(), 1);
        assert_eq!(matcher.reveal_count(), 1);
        assert_eq!(matcher.get_reveals(&[1u8; 32]).unwrap().count, 0);
    }
}
