//! Validator (VA): checks an incoming proposed state before this node
//! signs it. Every would-be signer MUST fully re-replay the transaction
//! list through the executor — the cheaper spot-check-only path a node
//! that isn't a required signer could take is not implemented here, since
//! this engine always re-executes rather than trust a claimed hash.

use std::collections::BTreeMap;

use crate::codec::canonical_hash;
use crate::executor::{self, ExecutorInput};
use crate::primitives::{Address, Group, MicroAmount, StateSnapshot, TxType, User};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("proposal has {0} reward transactions, expected exactly 1")]
    InvalidReward(usize),
    #[error("reward transaction recipient does not match the claimed miner")]
    RewardRecipientMismatch,
    #[error("reward amount is not the fixed block reward")]
    RewardAmountMismatch,
    #[error("miner is not a member of the proposal's active group")]
    NotInGroup,
    #[error("re-executing the claimed transaction list against local state does not reproduce the claimed hash")]
    HashMismatch,
    #[error("the executor reports the miner expired before it could be rewarded")]
    MinerExpired,
}

const REWARD_AMOUNT: MicroAmount = MicroAmount(100_000_000);

/// Full validation of an inbound `UPDATE_REQUEST`. `local_users`,
/// `local_pool`, and `local_group` are this node's own pre-round state —
/// VA never trusts the proposer's claimed pre-state, only its own.
pub fn validate(
    miner: &Address,
    claimed_state_hash: &[u8; 32],
    proposed_state: &StateSnapshot,
    local_users: BTreeMap<Address, User>,
    local_pool: BTreeMap<Address, u64>,
    local_group: Group,
    round_ts: u64,
) -> Result<(), ValidationError> {
    check_reward(proposed_state, miner)?;

    if !proposed_state.current_group.miners.contains_key(miner) {
        return Err(ValidationError::NotInGroup);
    }

    let ordered_tx: Vec<_> = proposed_state
        .tx_executed
        .values()
        .filter(|tx| tx.tx_type != TxType::Reward)
        .cloned()
        .collect();

    let input = ExecutorInput {
        users: local_users,
        miner_pool: local_pool,
        current_group: local_group,
        miner: miner.clone(),
        ordered_tx,
        round_ts,
    };

    let output = executor::run(input).map_err(|_| ValidationError::MinerExpired)?;
    let recomputed = canonical_hash(&output.snapshot);
    if &recomputed != claimed_state_hash {
        return Err(ValidationError::HashMismatch);
    }
    Ok(())
}

/// The cheap half of VA, usable by a node that has already established via
/// committee selection that it will never be asked to sign this round's
/// hash. Full replay is still mandatory for anyone who *will* sign.
pub fn check_reward(proposed_state: &StateSnapshot, miner: &Address) -> Result<(), ValidationError> {
    let rewards: Vec<_> = proposed_state
        .tx_executed
        .values()
        .filter(|tx| tx.tx_type == TxType::Reward)
        .collect();
    if rewards.len() != 1 {
        return Err(ValidationError::InvalidReward(rewards.len()));
    }
    let reward = rewards[0];
    if &reward.to != miner {
        return Err(ValidationError::RewardRecipientMismatch);
    }
    if reward.amount != REWARD_AMOUNT {
        return Err(ValidationError::RewardAmountMismatch);
    }
    Ok(())
}
