use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::address::Address;
use super::group::Group;
use super::transaction::Transaction;
use super::user::User;

/// The tuple whose canonical encoding is hashed every round:
/// `(users, miner_pool, current_group, tx_executed)`. This is the only
/// value `state_hash` is ever computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub users: BTreeMap<Address, User>,
    pub miner_pool: BTreeMap<Address, u64>,
    pub current_group: Group,
    pub tx_executed: BTreeMap<String, Transaction>,
}

impl StateSnapshot {
    pub fn reward_tx(&self) -> Option<&Transaction> {
        self.tx_executed
            .values()
            .find(|tx| tx.tx_type == super::transaction::TxType::Reward)
    }
}
