//! `ledgerd` — the replicated signature-threshold consensus engine.
//!
//! Ten components, leaves first: the canonical codec (`codec`) that
//! every hash and signature goes through; the durable `store`; the
//! hash-linked `chain` built on top of it; the in-memory `mempool`;
//! the pure `executor`; the deterministic `committee` selector; the
//! gossip `net` transport; the `coordinator` state machine that drives
//! a mining round; the `validator` that checks a peer's proposal before
//! signing it; and `sync`, which catches a node up over a gap wider
//! than steady-state gossip bridges. `config`, `rpc`, and `wallet` are
//! the ambient stack around that core.

pub mod chain;
pub mod codec;
pub mod committee;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod mempool;
pub mod net;
pub mod primitives;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod validator;
pub mod wallet;
