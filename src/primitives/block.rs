use serde::{Deserialize, Serialize};

use super::address::Address;

pub const ZERO_HASH: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBundle {
    pub signer: Address,
    pub state_hash: [u8; 32],
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_number: u64,
    pub prev_hash: [u8; 32],
    pub state_hash: [u8; 32],
    pub combined_hash: [u8; 32],
    pub group_id: u64,
    pub miner: Address,
    pub timestamp: u64,
    pub executed_tx_count: u64,
    pub signatures: Vec<SignatureBundle>,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.block_number == 0
    }
}
