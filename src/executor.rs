//! Executor (EX): the pure, deterministic core of a round. Given a state
//! snapshot and an ordered transaction list it produces the next snapshot
//! and the list of transactions actually executed — no I/O, no randomness,
//! no wall-clock reads beyond the `now` and `round_ts` the caller supplies.
//! Two nodes calling `run` with equal inputs MUST get byte-identical
//! outputs; that's what lets the committee sign a hash instead of a vote.

use std::collections::BTreeMap;

use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

use crate::primitives::{
    transaction::{join_pool_fee, new_account_fee, transfer_fee},
    Address, Group, MicroAmount, StateSnapshot, Transaction, TxType, User, INITIAL_LIFE,
};

/// Miner pool size that triggers a rotation into a new group.
const GROUP_ROTATION_THRESHOLD: usize = 1000;
/// Upper bound on a rotated group's roster when the pool overflows it.
const GROUP_ROSTER_CAP: usize = 100_000;
const REWARD_AMOUNT: MicroAmount = MicroAmount(100_000_000);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("miner expired during life decrement for this round")]
    MinerExpired,
}

/// Everything EX needs to run a round, owned by value so the caller can
/// keep its originals untouched — EX mutates only its local copies.
pub struct ExecutorInput {
    pub users: BTreeMap<Address, User>,
    pub miner_pool: BTreeMap<Address, u64>,
    pub current_group: Group,
    pub miner: Address,
    pub ordered_tx: Vec<Transaction>,
    pub round_ts: u64,
}

pub struct ExecutorOutput {
    pub snapshot: StateSnapshot,
    pub executed: Vec<Transaction>,
}

/// Runs one round: life decrement, transaction replay in input order, then
/// reward synthesis, then group rotation if the pool has crossed the
/// threshold. Returns `MinerExpired` if the life decrement removes the
/// miner before the reward can be paid.
pub fn run(input: ExecutorInput) -> Result<ExecutorOutput, ExecutorError> {
    let ExecutorInput {
        mut users,
        mut miner_pool,
        current_group,
        miner,
        ordered_tx,
        round_ts,
    } = input;

    decrement_life(&mut users);
    if !users.contains_key(&miner) {
        return Err(ExecutorError::MinerExpired);
    }

    let mut executed = Vec::with_capacity(ordered_tx.len() + 1);
    let mut tx_executed = BTreeMap::new();

    for tx in ordered_tx {
        if !tx.is_pool_eligible() {
            continue;
        }
        let applied = match tx.tx_type {
            TxType::Transfer => apply_transfer(&mut users, &tx),
            TxType::NewAccount => apply_new_account(&mut users, &tx),
            TxType::JoinPool => apply_join_pool(&mut users, &mut miner_pool, &tx, round_ts),
            TxType::Reward => false,
        };
        if applied {
            tx_executed.insert(tx.tx_id.clone(), tx.clone());
            executed.push(tx);
        }
    }

    let reward = Transaction::reward(miner.clone(), round_ts, REWARD_AMOUNT);
    if let Some(miner_user) = users.get_mut(&miner) {
        miner_user.balance = miner_user
            .balance
            .checked_add(REWARD_AMOUNT)
            .expect("reward overflow is not a reachable state in this ledger's supply");
    }
    tx_executed.insert(reward.tx_id.clone(), reward.clone());
    executed.push(reward);

    let current_group = maybe_rotate_group(&current_group, &mut miner_pool);

    Ok(ExecutorOutput {
        snapshot: StateSnapshot { users, miner_pool, current_group, tx_executed },
        executed,
    })
}

fn decrement_life(users: &mut BTreeMap<Address, User>) {
    users.retain(|_, user| !user.decrement_life());
}

fn apply_transfer(users: &mut BTreeMap<Address, User>, tx: &Transaction) -> bool {
    if !users.contains_key(&tx.from) || !users.contains_key(&tx.to) {
        return false;
    }
    let fee = transfer_fee(tx.amount);
    let total = match tx.amount.checked_add(fee) {
        Some(t) => t,
        None => return false,
    };
    let sender = users.get(&tx.from).unwrap();
    if sender.balance < total {
        return false;
    }
    {
        let sender = users.get_mut(&tx.from).unwrap();
        sender.balance = sender.balance.checked_sub(total).unwrap();
        sender.nonce += 1;
    }
    let receiver = users.get_mut(&tx.to).unwrap();
    receiver.balance = receiver.balance.checked_add(tx.amount).unwrap();
    true
}

fn apply_new_account(users: &mut BTreeMap<Address, User>, tx: &Transaction) -> bool {
    if users.contains_key(&tx.to) {
        return false;
    }
    let fee = new_account_fee();
    let sender_balance = match users.get(&tx.from) {
        Some(u) => u.balance,
        None => return false,
    };
    if sender_balance < fee {
        return false;
    }
    {
        let sender = users.get_mut(&tx.from).unwrap();
        sender.balance = sender.balance.checked_sub(fee).unwrap();
        sender.nonce += 1;
    }
    users.insert(tx.to.clone(), User::new(tx.to.clone()));
    true
}

fn apply_join_pool(
    users: &mut BTreeMap<Address, User>,
    miner_pool: &mut BTreeMap<Address, u64>,
    tx: &Transaction,
    round_ts: u64,
) -> bool {
    let fee = join_pool_fee();
    let sender_balance = match users.get(&tx.from) {
        Some(u) => u.balance,
        None => return false,
    };
    if sender_balance < fee {
        return false;
    }
    {
        let sender = users.get_mut(&tx.from).unwrap();
        sender.balance = sender.balance.checked_sub(fee).unwrap();
        sender.nonce += 1;
    }
    miner_pool.entry(tx.from.clone()).or_insert(round_ts);
    true
}

/// Rotates into a new group once the pool reaches the threshold, sampling
/// a capped roster seeded by the new group's id so every node that crosses
/// the threshold in the same round picks the same members.
fn maybe_rotate_group(current_group: &Group, miner_pool: &mut BTreeMap<Address, u64>) -> Group {
    if miner_pool.len() < GROUP_ROTATION_THRESHOLD {
        return current_group.clone();
    }

    let new_group_id = current_group.group_id + 1;
    let addresses: Vec<Address> = miner_pool.keys().cloned().collect();
    let chosen: Vec<Address> = if addresses.len() > GROUP_ROSTER_CAP {
        let mut rng = ChaCha8Rng::seed_from_u64(new_group_id);
        sample(&mut rng, addresses.len(), GROUP_ROSTER_CAP)
            .into_iter()
            .map(|i| addresses[i].clone())
            .collect()
    } else {
        addresses
    };

    let now = miner_pool.values().copied().max().unwrap_or(0);
    let mut miners = BTreeMap::new();
    for addr in chosen {
        let joined_at = miner_pool.get(&addr).copied().unwrap_or(now);
        miners.insert(addr, joined_at);
    }

    miner_pool.clear();

    Group { group_id: new_group_id, miners, created_at: now }
}
