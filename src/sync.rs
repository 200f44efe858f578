//! Sync (SY): catches a node up over a gap wider than steady-state
//! `FINAL_UPDATE` gossip can bridge — startup from empty storage, or a
//! `BLOCK_ANNOUNCE` advertising a height this node hasn't reached.

use crate::chain;
use crate::primitives::{Block, StateSnapshot};
use crate::store::StateStore;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Chain(#[from] chain::ChainError),
    #[error("offered block {offered} is not ahead of local latest {local}")]
    NotAhead { offered: u64, local: u64 },
}

/// Whether a `BLOCK_ANNOUNCE` at `remote_height` warrants issuing a
/// `STATE_REQUEST`.
pub fn should_request_state(store: &StateStore, remote_height: u64) -> Result<bool, SyncError> {
    let local = store.block_count()?;
    Ok(remote_height >= local)
}

/// Installs a `STATE_UPDATE` answer if it strictly advances the local
/// chain. The caller is responsible for having already checked the
/// block's header hash against the embedded snapshot before calling this
/// (that check lives in the validator/coordinator boundary, same as any
/// other externally supplied block).
pub fn install_if_ahead(
    store: &StateStore,
    block: &Block,
    snapshot: &StateSnapshot,
) -> Result<bool, SyncError> {
    let local_latest = store.latest_block()?;
    let local_number = local_latest.map(|b| b.block_number);
    let ahead = match local_number {
        Some(n) => block.block_number > n,
        None => true,
    };
    if !ahead {
        return Err(SyncError::NotAhead {
            offered: block.block_number,
            local: local_number.unwrap_or(0),
        });
    }

    store.apply_snapshot(snapshot, block, &[])?;
    chain::verify(store)?;
    Ok(true)
}
