//! State Store (SS): the single RocksDB-backed handle through which every
//! other component reads and writes durable state. Writes that must be
//! atomic (a finalized round's user/pool/group/block/height update) go
//! through `apply_snapshot`, which commits via one `WriteBatch`. A mutex
//! gate serializes all writers so two rounds can never finalize concurrently
//! against the same column families.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};

use crate::primitives::{Address, Block, Group, Peer, StateSnapshot, Transaction, User};

const CF_USERS: &str = "users";
const CF_MINER_POOL: &str = "miner_pool";
const CF_GROUPS: &str = "groups";
const CF_BLOCKS: &str = "blocks";
const CF_HEIGHTS: &str = "heights";
const CF_TX_INDEX: &str = "tx_index";
const CF_PEERS: &str = "peers";
const CF_META: &str = "meta";

const KEY_LATEST_HEIGHT: &[u8] = b"latest_height";
const KEY_LATEST_TX_EXECUTED: &[u8] = b"latest_tx_executed";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("chain gap: expected block {expected}, got {got}")]
    ChainGap { expected: u64, got: u64 },
    #[error("chain break: block {block_number} prev_hash does not match stored head")]
    ChainBreak { block_number: u64 },
    #[error("column family {0} missing")]
    MissingColumnFamily(&'static str),
}

/// Durable handle over RocksDB. Cheap to clone (wraps an `Arc`-like `DB`
/// reference internally via `rocksdb`'s own handle semantics); the write
/// gate lives alongside it so all clones share the same serialization point.
pub struct StateStore {
    db: DB,
    write_gate: Mutex<()>,
}

// `rocksdb::DB` is `Send + Sync` in the underlying C++ library's contract;
// the crate just doesn't derive it for us on every version we pin.
unsafe impl Send for StateStore {}
unsafe impl Sync for StateStore {}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cf_names = [
            CF_USERS,
            CF_MINER_POOL,
            CF_GROUPS,
            CF_BLOCKS,
            CF_HEIGHTS,
            CF_TX_INDEX,
            CF_PEERS,
            CF_META,
        ];
        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)?;
        Ok(StateStore {
            db,
            write_gate: Mutex::new(()),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or(StoreError::MissingColumnFamily(name))
    }

    // --- users ---

    pub fn get_user(&self, address: &Address) -> Result<Option<User>, StoreError> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_cf(cf, address.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn all_users(&self) -> Result<BTreeMap<Address, User>, StoreError> {
        let cf = self.cf(CF_USERS)?;
        let mut out = BTreeMap::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            let user: User = serde_json::from_slice(&value)?;
            out.insert(user.address.clone(), user);
        }
        Ok(out)
    }

    // --- miner pool ---

    pub fn miner_pool_add(&self, address: &Address, joined_at: u64) -> Result<(), StoreError> {
        let _guard = self.write_gate.lock().unwrap();
        let cf = self.cf(CF_MINER_POOL)?;
        self.db
            .put_cf(cf, address.as_str().as_bytes(), joined_at.to_be_bytes())?;
        Ok(())
    }

    pub fn miner_pool_snapshot(&self) -> Result<BTreeMap<Address, u64>, StoreError> {
        let cf = self.cf(CF_MINER_POOL)?;
        let mut out = BTreeMap::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let address = Address::parse(std::str::from_utf8(&key).unwrap_or_default())
                .map_err(|_| StoreError::MissingColumnFamily(CF_MINER_POOL))?;
            let joined_at = u64::from_be_bytes(value.as_ref().try_into().unwrap_or([0u8; 8]));
            out.insert(address, joined_at);
        }
        Ok(out)
    }

    pub fn miner_pool_clear(&self, batch: &mut WriteBatch) -> Result<(), StoreError> {
        let cf = self.cf(CF_MINER_POOL)?;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, key);
        }
        Ok(())
    }

    // --- groups ---

    pub fn save_group(&self, group: &Group) -> Result<(), StoreError> {
        let _guard = self.write_gate.lock().unwrap();
        let cf = self.cf(CF_GROUPS)?;
        self.db
            .put_cf(cf, group.group_id.to_be_bytes(), serde_json::to_vec(group)?)?;
        Ok(())
    }

    pub fn get_group(&self, group_id: u64) -> Result<Option<Group>, StoreError> {
        let cf = self.cf(CF_GROUPS)?;
        match self.db.get_cf(cf, group_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn latest_group(&self) -> Result<Option<Group>, StoreError> {
        let cf = self.cf(CF_GROUPS)?;
        let mut iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(serde_json::from_slice(&value)?))
            }
            None => Ok(None),
        }
    }

    // --- blocks / chain ---

    pub fn latest_block(&self) -> Result<Option<Block>, StoreError> {
        let meta = self.cf(CF_META)?;
        match self.db.get_cf(meta, KEY_LATEST_HEIGHT)? {
            Some(bytes) => {
                let height = u64::from_be_bytes(bytes.as_slice().try_into().unwrap_or([0u8; 8]));
                self.get_block(height)
            }
            None => Ok(None),
        }
    }

    pub fn get_block(&self, block_number: u64) -> Result<Option<Block>, StoreError> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(cf, block_number.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_count(&self) -> Result<u64, StoreError> {
        match self.latest_block()? {
            Some(b) => Ok(b.block_number + 1),
            None => Ok(0),
        }
    }

    /// Appends a single block outside of a round-finalization (used by sync
    /// to install blocks fetched from a peer). Enforces strict contiguity
    /// and hash linkage against the currently stored head.
    pub fn append_block(&self, block: &Block) -> Result<(), StoreError> {
        let _guard = self.write_gate.lock().unwrap();
        let expected = match self.latest_block()? {
            Some(head) => {
                if block.prev_hash != head.state_hash {
                    return Err(StoreError::ChainBreak { block_number: block.block_number });
                }
                head.block_number + 1
            }
            None => 0,
        };
        if block.block_number != expected {
            return Err(StoreError::ChainGap { expected, got: block.block_number });
        }

        let blocks_cf = self.cf(CF_BLOCKS)?;
        let heights_cf = self.cf(CF_HEIGHTS)?;
        let meta_cf = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(blocks_cf, block.block_number.to_be_bytes(), serde_json::to_vec(block)?);
        batch.put_cf(heights_cf, block.combined_hash, block.block_number.to_be_bytes());
        batch.put_cf(meta_cf, KEY_LATEST_HEIGHT, block.block_number.to_be_bytes());

        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Atomically commits a finalized round: the new state snapshot, the
    /// block that closes it, and the tx index entries, in one `WriteBatch`.
    /// This is the only write path a finalizing node should use in normal
    /// operation; `append_block` exists for sync installing foreign blocks.
    pub fn apply_snapshot(
        &self,
        snapshot: &StateSnapshot,
        block: &Block,
        executed: &[Transaction],
    ) -> Result<(), StoreError> {
        let _guard = self.write_gate.lock().unwrap();

        let expected = match self.latest_block()? {
            Some(head) => {
                if block.prev_hash != head.state_hash {
                    return Err(StoreError::ChainBreak { block_number: block.block_number });
                }
                head.block_number + 1
            }
            None => 0,
        };
        if block.block_number != expected {
            return Err(StoreError::ChainGap { expected, got: block.block_number });
        }

        let users_cf = self.cf(CF_USERS)?;
        let pool_cf = self.cf(CF_MINER_POOL)?;
        let groups_cf = self.cf(CF_GROUPS)?;
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let heights_cf = self.cf(CF_HEIGHTS)?;
        let meta_cf = self.cf(CF_META)?;
        let tx_cf = self.cf(CF_TX_INDEX)?;

        let mut batch = WriteBatch::default();

        for item in self.db.iterator_cf(users_cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(users_cf, key);
        }
        for (address, user) in &snapshot.users {
            batch.put_cf(users_cf, address.as_str().as_bytes(), serde_json::to_vec(user)?);
        }

        self.miner_pool_clear(&mut batch)?;
        for (address, joined_at) in &snapshot.miner_pool {
            batch.put_cf(pool_cf, address.as_str().as_bytes(), joined_at.to_be_bytes());
        }

        batch.put_cf(
            groups_cf,
            snapshot.current_group.group_id.to_be_bytes(),
            serde_json::to_vec(&snapshot.current_group)?,
        );

        batch.put_cf(blocks_cf, block.block_number.to_be_bytes(), serde_json::to_vec(block)?);
        batch.put_cf(heights_cf, block.combined_hash, block.block_number.to_be_bytes());
        batch.put_cf(meta_cf, KEY_LATEST_HEIGHT, block.block_number.to_be_bytes());
        batch.put_cf(meta_cf, KEY_LATEST_TX_EXECUTED, serde_json::to_vec(&snapshot.tx_executed)?);

        for tx in executed {
            batch.put_cf(
                tx_cf,
                tx.tx_id.as_bytes(),
                block.block_number.to_be_bytes(),
            );
        }

        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Reconstructs the `StateSnapshot` implied by the currently installed
    /// chain head: the live users/pool/group tables plus the `tx_executed`
    /// map recorded by the most recent `apply_snapshot` call. Its canonical
    /// hash equals `latest_block().state_hash` by construction — this is
    /// what a `STATE_REQUEST` answer and sync's own re-verification rely on.
    pub fn current_snapshot(&self) -> Result<StateSnapshot, StoreError> {
        let users = self.all_users()?;
        let miner_pool = self.miner_pool_snapshot()?;
        let current_group = self.latest_group()?.unwrap_or_else(Group::genesis);
        let meta = self.cf(CF_META)?;
        let tx_executed = match self.db.get_cf(meta, KEY_LATEST_TX_EXECUTED)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => BTreeMap::new(),
        };
        Ok(StateSnapshot { users, miner_pool, current_group, tx_executed })
    }

    pub fn tx_block_number(&self, tx_id: &str) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_TX_INDEX)?;
        match self.db.get_cf(cf, tx_id.as_bytes())? {
            Some(bytes) => Ok(Some(u64::from_be_bytes(bytes.as_slice().try_into().unwrap_or([0u8; 8])))),
            None => Ok(None),
        }
    }

    // --- peers ---

    pub fn save_peer(&self, peer: &Peer) -> Result<(), StoreError> {
        let cf = self.cf(CF_PEERS)?;
        self.db.put_cf(cf, peer.node_id.as_bytes(), serde_json::to_vec(peer)?)?;
        Ok(())
    }

    pub fn remove_peer(&self, node_id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_PEERS)?;
        self.db.delete_cf(cf, node_id.as_bytes())?;
        Ok(())
    }

    pub fn all_peers(&self) -> Result<Vec<Peer>, StoreError> {
        let cf = self.cf(CF_PEERS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static CTR: AtomicU64 = AtomicU64::new(0);

    fn tmp() -> StateStore {
        let id = CTR.fetch_add(1, Ordering::SeqCst);
        let p = PathBuf::from(format!("/tmp/ledgerd_store_{}_{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&p);
        StateStore::open(&p).unwrap()
    }

    fn addr(n: u8) -> Address {
        Address::from_bytes(&[0, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn empty_store_has_no_blocks() {
        let store = tmp();
        assert_eq!(store.block_count().unwrap(), 0);
        assert!(store.latest_block().unwrap().is_none());
    }

    #[test]
    fn apply_snapshot_persists_users_and_block() {
        let store = tmp();
        let a = addr(1);
        let mut user = User::new(a.clone());
        user.balance = crate::primitives::MicroAmount::from_whole(5);

        let mut users = BTreeMap::new();
        users.insert(a.clone(), user.clone());
        let snapshot = StateSnapshot {
            users,
            miner_pool: BTreeMap::new(),
            current_group: Group::genesis(),
            tx_executed: BTreeMap::new(),
        };
        let block = Block {
            block_number: 0,
            prev_hash: crate::primitives::block::ZERO_HASH,
            state_hash: [1u8; 32],
            combined_hash: [2u8; 32],
            group_id: 1,
            miner: a.clone(),
            timestamp: 0,
            executed_tx_count: 0,
            signatures: Vec::new(),
        };

        store.apply_snapshot(&snapshot, &block, &[]).unwrap();
        assert_eq!(store.get_user(&a).unwrap().unwrap().balance, user.balance);
        assert_eq!(store.block_count().unwrap(), 1);
    }

    #[test]
    fn append_block_rejects_gap() {
        let store = tmp();
        let block = Block {
            block_number: 5,
            prev_hash: crate::primitives::block::ZERO_HASH,
            state_hash: [0u8; 32],
            combined_hash: [0u8; 32],
            group_id: 1,
            miner: addr(1),
            timestamp: 0,
            executed_tx_count: 0,
            signatures: Vec::new(),
        };
        let err = store.append_block(&block).unwrap_err();
        assert!(matches!(err, StoreError::ChainGap { expected: 0, got: 5 }));
    }

    #[test]
    fn miner_pool_round_trips() {
        let store = tmp();
        let a = addr(7);
        store.miner_pool_add(&a, 42).unwrap();
        let snap = store.miner_pool_snapshot().unwrap();
        assert_eq!(snap.get(&a), Some(&42));
    }

    #[test]
    fn current_snapshot_hashes_to_the_installed_block() {
        let store = tmp();
        let a = addr(1);
        let mut user = User::new(a.clone());
        user.balance = crate::primitives::MicroAmount::from_whole(5);
        let mut users = BTreeMap::new();
        users.insert(a.clone(), user);
        let snapshot = StateSnapshot {
            users,
            miner_pool: BTreeMap::new(),
            current_group: Group::genesis(),
            tx_executed: BTreeMap::new(),
        };
        let state_hash = crate::codec::canonical_hash(&snapshot);
        let block = Block {
            block_number: 0,
            prev_hash: crate::primitives::block::ZERO_HASH,
            state_hash,
            combined_hash: [2u8; 32],
            group_id: 1,
            miner: a,
            timestamp: 0,
            executed_tx_count: 0,
            signatures: Vec::new(),
        };
        store.apply_snapshot(&snapshot, &block, &[]).unwrap();

        let reconstructed = store.current_snapshot().unwrap();
        assert_eq!(crate::codec::canonical_hash(&reconstructed), state_hash);
    }
}
