//! Transaction Pool (TP): the in-memory holding area for submitted
//! transactions between rounds. Entries are removed only when a round's
//! snapshot is applied — a `PROPOSING` attempt that is later abandoned or
//! preempted must leave the pool exactly as it found it, so a timed-out
//! round doesn't silently drop anyone's transaction.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::primitives::Transaction;

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("transaction {0} is not eligible for the pool (reward transactions are synthesized, not submitted)")]
    NotPoolEligible(String),
}

#[derive(Default)]
pub struct Mempool {
    inner: Mutex<BTreeMap<String, Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool { inner: Mutex::new(BTreeMap::new()) }
    }

    /// Inserts a transaction. A duplicate `tx_id` is silently ignored
    /// (first submission wins) rather than treated as an error, since
    /// re-gossip of the same transaction is expected traffic.
    pub fn insert(&self, tx: Transaction) -> Result<(), MempoolError> {
        if !tx.is_pool_eligible() {
            return Err(MempoolError::NotPoolEligible(tx.tx_id));
        }
        let mut guard = self.inner.lock().unwrap();
        guard.entry(tx.tx_id.clone()).or_insert(tx);
        Ok(())
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns every pending transaction ordered by ascending `tx_id` hex
    /// bytes. This is the order the executor replays transactions in, so
    /// every honest node that sees the same pool contents computes the
    /// same post-round state hash.
    pub fn drain_ordered(&self) -> Vec<Transaction> {
        let guard = self.inner.lock().unwrap();
        guard.values().cloned().collect()
    }

    /// Empties the pool. Called only when a round finalizes — whether the
    /// finalized snapshot came from this node's own proposal or from a
    /// remote `FINAL_UPDATE` — and unconditionally: transactions this
    /// round never got to are dropped too, not retained for next round.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}
