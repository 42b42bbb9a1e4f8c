//! Value-transfer state: the current factoid block and balance maps
//!
//! Balances live in two maps. The temporary map holds changes made while the
//! current block is being built; the permanent map holds balances as of the
//! last finalized block. Reads prefer the temporary value.

use crate::blocks::{EcEntry, FactoidBlock};
use crate::types::ChainId;
use std::collections::HashMap;

#[derive(Debug)]
pub struct FactoidState {
    current_block: FactoidBlock,
    factoid_balances_t: HashMap<ChainId, i64>,
    factoid_balances_p: HashMap<ChainId, i64>,
    ec_balances_t: HashMap<ChainId, i64>,
    ec_balances_p: HashMap<ChainId, i64>,
}

impl FactoidState {
    pub fn new(height: u32) -> Self {
        Self {
            current_block: FactoidBlock::new(height),
            factoid_balances_t: HashMap::new(),
            factoid_balances_p: HashMap::new(),
            ec_balances_t: HashMap::new(),
            ec_balances_p: HashMap::new(),
        }
    }

    pub fn current_block(&self) -> &FactoidBlock {
        &self.current_block
    }

    /// Start building `height`, folding temporary balances into permanent ones.
    /// Does nothing if the current block already is at `height`.
    pub fn begin_block(&mut self, height: u32) {
        if self.current_block.height == height {
            return;
        }
        self.factoid_balances_p.extend(self.factoid_balances_t.drain());
        self.ec_balances_p.extend(self.ec_balances_t.drain());
        self.current_block = FactoidBlock::new(height);
    }

    /// End-of-minute settlement for the value-transfer chain
    pub fn end_of_period(&mut self, minute: u8) {
        self.current_block.period_marks.push(minute);
    }

    /// Debit the entry credits a commit pays for. Returns false for entries
    /// that are not commits.
    pub fn update_ec_transaction(&mut self, rt: bool, entry: &EcEntry) -> bool {
        let (key, credits) = match entry {
            EcEntry::CommitChain(c) => (c.ec_public_key, c.credits),
            EcEntry::CommitEntry(c) => (c.ec_public_key, c.credits),
            EcEntry::MinuteNumber(_) => return false,
        };
        let balance = self.get_e(&key);
        self.put_e(rt, key, balance - credits as i64);
        true
    }

    pub fn get_f(&self, address: &ChainId) -> i64 {
        self.factoid_balances_t
            .get(address)
            .or_else(|| self.factoid_balances_p.get(address))
            .copied()
            .unwrap_or(0)
    }

    pub fn put_f(&mut self, rt: bool, address: ChainId, value: i64) {
        if rt {
            self.factoid_balances_t.insert(address, value);
        } else {
            self.factoid_balances_p.insert(address, value);
        }
    }

    pub fn get_e(&self, address: &ChainId) -> i64 {
        self.ec_balances_t
            .get(address)
            .or_else(|| self.ec_balances_p.get(address))
            .copied()
            .unwrap_or(0)
    }

    pub fn put_e(&mut self, rt: bool, address: ChainId, value: i64) {
        if rt {
            self.ec_balances_t.insert(address, value);
        } else {
            self.ec_balances_p.insert(address, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CommitEntry;

    #[test]
    fn test_temporary_balance_shadows_permanent() {
        let mut fs = FactoidState::new(0);
        let addr = [1u8; 32];
        fs.put_e(false, addr, 10);
        assert_eq!(fs.get_e(&addr), 10);
        fs.put_e(true, addr, 7);
        assert_eq!(fs.get_e(&addr), 7);

        fs.begin_block(1);
        assert_eq!(fs.get_e(&addr), 7);
        assert_eq!(fs.current_block().height, 1);
    }

    #[test]
    fn test_commit_debits_credits() {
        let mut fs = FactoidState::new(0);
        let key = [2u8; 32];
        fs.put_e(false, key, 5);

        let commit = EcEntry::CommitEntry(CommitEntry {
            entry_hash: [0u8; 32],
            credits: 2,
            timestamp: 0,
            ec_public_key: key,
            signature: Vec::new(),
        });
        assert!(fs.update_ec_transaction(true, &commit));
        assert_eq!(fs.get_e(&key), 3);
        assert!(!fs.update_ec_transaction(true, &EcEntry::MinuteNumber(1)));
    }

    #[test]
    fn test_end_of_period_marks() {
        let mut fs = FactoidState::new(4);
        fs.end_of_period(0);
        fs.end_of_period(1);
        assert_eq!(fs.current_block().period_marks, vec![0, 1]);
    }
}
