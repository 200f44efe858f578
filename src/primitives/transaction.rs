use serde::{Deserialize, Serialize};

use super::address::{Address, MicroAmount};

/// The four transaction shapes the executor understands. `Reward` is
/// synthesized by the executor at the end of a round and is never accepted
/// from the pool — see `Transaction::is_pool_eligible`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    NewAccount,
    JoinPool,
    Reward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub tx_type: TxType,
    pub from: Address,
    pub to: Address,
    pub amount: MicroAmount,
    pub fee: MicroAmount,
    pub nonce: u64,
    pub timestamp: u64,
    /// Opaque bytes produced by the wallet's signing oracle. Empty for the
    /// synthetic reward transaction, which no sender signs.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// A transaction submitted through the pool must never claim to be the
    /// miner's reward; the executor is the only place that type originates.
    pub fn is_pool_eligible(&self) -> bool {
        self.tx_type != TxType::Reward
    }

    pub fn reward(miner: Address, round_ts: u64, amount: MicroAmount) -> Self {
        Transaction {
            tx_id: format!("reward_{round_ts}"),
            tx_type: TxType::Reward,
            from: miner.clone(),
            to: miner,
            amount,
            fee: MicroAmount::ZERO,
            nonce: 0,
            timestamp: round_ts,
            signature: Vec::new(),
        }
    }
}

/// Fee schedule. Transfer fees scale with the transferred amount; the
/// other two types charge a flat fee.
pub fn transfer_fee(amount: MicroAmount) -> MicroAmount {
    let min_fee = MicroAmount(1); // 0.000001
    let scaled = MicroAmount(amount.0 / 10_000); // amount * 0.0001
    if scaled.0 > min_fee.0 { scaled } else { min_fee }
}

pub fn new_account_fee() -> MicroAmount {
    MicroAmount::from_whole(1)
}

pub fn join_pool_fee() -> MicroAmount {
    MicroAmount(1) // 0.000001
}
