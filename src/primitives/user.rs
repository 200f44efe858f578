use serde::{Deserialize, Serialize};

use super::address::{Address, MicroAmount};
use super::INITIAL_LIFE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub address: Address,
    pub balance: MicroAmount,
    pub nonce: u64,
    pub life: u64,
}

impl User {
    pub fn new(address: Address) -> Self {
        User {
            address,
            balance: MicroAmount::ZERO,
            nonce: 0,
            life: INITIAL_LIFE,
        }
    }

    /// Decrements life by one round; returns true if the user should be
    /// removed (life hit zero).
    pub fn decrement_life(&mut self) -> bool {
        self.life = self.life.saturating_sub(1);
        self.life == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerPoolEntry {
    pub address: Address,
    pub joined_at: u64,
}
