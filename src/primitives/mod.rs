//! Data model: the Address / User / Transaction / Group / Block / Peer
//! entities and their invariants, independent of how they are stored or
//! transmitted.

pub mod address;
pub mod block;
pub mod group;
pub mod peer;
pub mod snapshot;
pub mod transaction;
pub mod user;

pub use address::{Address, AddressError, MicroAmount};
pub use block::{Block, SignatureBundle};
pub use group::Group;
pub use peer::Peer;
pub use snapshot::StateSnapshot;
pub use transaction::{Transaction, TxType};
pub use user::{MinerPoolEntry, User};

/// Initial life granted to a freshly created account.
pub const INITIAL_LIFE: u64 = 20_000_000;

/// Block reward credited to the miner each round, in knots (micro-units).
pub const BLOCK_REWARD: MicroAmount = MicroAmount(100_000_000);
