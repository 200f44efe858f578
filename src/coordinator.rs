//! Consensus Coordinator (CO): the round state machine. `IDLE →
//! PROPOSING → AWAITING_SIGNATURES → FINALIZING → IDLE` on the miner
//! path, with a parallel non-blocking path that validates and signs
//! inbound proposals from other miners. This is the only component that
//! owns the mempool, the in-flight proposal, and its collected
//! signatures — everything else is either pure (`executor`, `committee`)
//! or a passive store (`store`, `mempool`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};

use crate::chain;
use crate::codec::canonical_hash;
use crate::committee;
use crate::executor::{self, ExecutorError, ExecutorInput};
use crate::mempool::Mempool;
use crate::net::protocol::{self, Envelope, MessageType};
use crate::net::transport::GossipTransport;
use crate::primitives::{Address, Block, SignatureBundle, StateSnapshot, Transaction};
use crate::store::{StateStore, StoreError};
use crate::sync;
use crate::validator;
use crate::wallet::SignatureOracle;

/// Clamped to the range 1..=600, defaulting to 60.
pub const DEFAULT_SIGNATURE_WAIT_SECONDS: u64 = 60;
pub const MIN_SIGNATURE_WAIT_SECONDS: u64 = 1;
pub const MAX_SIGNATURE_WAIT_SECONDS: u64 = 600;

const NOT_IN_GROUP_BACKOFF: Duration = Duration::from_secs(5);
const REBUILD_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("final update has {0} valid signatures, need at least {1}")]
    InsufficientSignatures(usize, usize),
    #[error("signer {0} is not a member of the committee for this hash")]
    SignerNotInCommittee(Address),
    #[error("signer {0} appears more than once in the signature set")]
    DuplicateSigner(Address),
    #[error("signature from {0} does not verify")]
    InvalidSignature(Address),
    #[error("final update's claimed hash does not match its embedded state")]
    HashMismatch,
    #[error("final update state has no (or more than one) reward transaction")]
    MissingReward,
}

/// Round outcomes surfaced to the operator: the result of each round
/// this node actively participates in, plus storage faults.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    Mined { block_number: u64 },
    Expired,
    Preempted,
    NotInGroup,
    MinerExpired,
    Storage(String),
}

/// A round this node is actively proposing and collecting signatures for.
struct PendingRound {
    state_hash: [u8; 32],
    proposed_state: StateSnapshot,
    executed: Vec<Transaction>,
    committee: BTreeSet<Address>,
    collected: BTreeMap<Address, SignatureBundle>,
    prev_hash: [u8; 32],
    block_number: u64,
    timestamp: u64,
    token: u64,
}

enum RoundState {
    Idle,
    AwaitingSignatures(PendingRound),
}

pub enum ControlMessage {
    StartMining,
    StopMining,
}

/// Everything CO needs beyond what's reachable through `store` or
/// `mempool`: the wallet oracle, this node's own address and private
/// key, and its externally reachable port (sent in `UPDATE_REQUEST` so
/// signers know where to mail their `SIGNATURE` back to).
pub struct Coordinator<O: SignatureOracle + Send + Sync + 'static> {
    store: Arc<StateStore>,
    mempool: Arc<Mempool>,
    transport: Arc<GossipTransport>,
    oracle: Arc<O>,
    private_key: Vec<u8>,
    address: Address,
    listen_port: u16,
    signature_wait: Duration,
    mining: AtomicBool,
    state: Mutex<RoundState>,
    next_token: AtomicU64,
    last_signed_hash: Mutex<Option<[u8; 32]>>,
    last_outcome: Mutex<Option<RoundOutcome>>,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn clamp_signature_wait(seconds: u64) -> Duration {
    Duration::from_secs(seconds.clamp(MIN_SIGNATURE_WAIT_SECONDS, MAX_SIGNATURE_WAIT_SECONDS))
}

impl<O: SignatureOracle + Send + Sync + 'static> Coordinator<O> {
    pub fn new(
        store: Arc<StateStore>,
        mempool: Arc<Mempool>,
        transport: Arc<GossipTransport>,
        oracle: Arc<O>,
        private_key: Vec<u8>,
        listen_port: u16,
        signature_wait_seconds: u64,
    ) -> Arc<Self> {
        let address = oracle.address_of(&private_key);
        Arc::new(Coordinator {
            store,
            mempool,
            transport,
            oracle,
            private_key,
            address,
            listen_port,
            signature_wait: clamp_signature_wait(signature_wait_seconds),
            mining: AtomicBool::new(false),
            state: Mutex::new(RoundState::Idle),
            next_token: AtomicU64::new(1),
            last_signed_hash: Mutex::new(None),
            last_outcome: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn last_outcome(&self) -> Option<RoundOutcome> {
        self.last_outcome.lock().await.clone()
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    /// Drives the control channel (start/stop requests from the RPC
    /// surface) and the gossip inbound channel. Spawned once per node.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<(Envelope, String)>,
        mut control: mpsc::Receiver<ControlMessage>,
    ) {
        loop {
            tokio::select! {
                maybe_envelope = inbound.recv() => {
                    match maybe_envelope {
                        Some((envelope, peer_ip)) => {
                            Arc::clone(&self).dispatch(envelope, peer_ip).await;
                        }
                        None => break,
                    }
                }
                maybe_ctrl = control.recv() => {
                    match maybe_ctrl {
                        Some(ControlMessage::StartMining) => {
                            self.mining.store(true, Ordering::SeqCst);
                            Arc::clone(&self).try_propose().await;
                        }
                        Some(ControlMessage::StopMining) => {
                            self.mining.store(false, Ordering::SeqCst);
                            self.abandon_current_round().await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, envelope: Envelope, peer_ip: String) {
        match envelope.msg_type {
            MessageType::Transaction => {
                if let Some(tx) = decode_transaction(&envelope) {
                    let _ = self.mempool.insert(tx);
                }
            }
            MessageType::UpdateRequest => {
                self.handle_update_request(envelope, peer_ip).await;
            }
            MessageType::Signature => {
                self.handle_signature_envelope(envelope).await;
            }
            MessageType::FinalUpdate => {
                self.handle_final_update_envelope(envelope).await;
            }
            MessageType::StateRequest => {
                self.handle_state_request(envelope, peer_ip).await;
            }
            MessageType::StateUpdate => {
                self.handle_state_update_envelope(envelope).await;
            }
            MessageType::BlockAnnounce => {
                self.handle_block_announce(envelope, peer_ip).await;
            }
            MessageType::Ping => {
                self.handle_ping(envelope, peer_ip).await;
            }
            // HELLO/PRESENCE are handled by `net`, not CO.
            _ => {}
        }
    }

    /// Answers an explicit liveness probe with `PONG`, unicast back to the
    /// prober.
    async fn handle_ping(&self, envelope: Envelope, peer_ip: String) {
        let reply = Envelope::new(
            MessageType::Pong,
            self.transport.node_id(),
            self.listen_port,
            protocol::empty_payload(),
            now_unix(),
            false,
        );
        let _ = self.transport.send_to(&peer_ip, envelope.sender_port, &reply).await;
    }

    // ---------------------------------------------------------------
    // Sync (SY): bootstrap / long-gap catch-up riding the same gossip
    // channel as the round protocol. `FINAL_UPDATE` is the steady-state
    // catch-up mechanism; this path only fires for gaps wider than one
    // round (startup, or a `BLOCK_ANNOUNCE` this node can't explain).
    // ---------------------------------------------------------------

    /// Answers a peer's `STATE_REQUEST` with this node's current chain tip
    /// and the snapshot it implies, unicast back to the requester.
    async fn handle_state_request(&self, envelope: Envelope, peer_ip: String) {
        let Ok(Some(block)) = self.store.latest_block() else { return };
        let Ok(snapshot) = self.store.current_snapshot() else { return };

        let payload = protocol::state_update_payload(&block, &snapshot);
        let reply = Envelope::new(
            MessageType::StateUpdate,
            self.transport.node_id(),
            self.listen_port,
            payload,
            now_unix(),
            false,
        );
        let _ = self.transport.send_to(&peer_ip, envelope.sender_port, &reply).await;
    }

    /// Installs a `STATE_UPDATE` answer if it strictly advances the local
    /// chain and its header is internally consistent. Preempts an in-flight
    /// local proposal the same way a `FINAL_UPDATE` does, since both paths
    /// install a block out from under a pending round.
    async fn handle_state_update_envelope(self: Arc<Self>, envelope: Envelope) {
        let Some((block, snapshot)) = parse_state_update(&envelope) else { return };

        if canonical_hash(&snapshot) != block.state_hash {
            return;
        }
        if chain::header_hash(&block) != block.combined_hash {
            return;
        }

        let preempted = {
            let mut guard = self.state.lock().await;
            match &*guard {
                RoundState::AwaitingSignatures(pending) if pending.state_hash != block.state_hash => {
                    *guard = RoundState::Idle;
                    true
                }
                _ => false,
            }
        };

        match sync::install_if_ahead(&self.store, &block, &snapshot) {
            Ok(true) => {
                self.mempool.clear();
                *self.last_signed_hash.lock().await = None;
                if preempted {
                    self.record_outcome(RoundOutcome::Preempted).await;
                }
                self.announce_block(block.block_number).await;
                if self.mining.load(Ordering::SeqCst) {
                    Arc::clone(&self).try_propose().await;
                }
            }
            Ok(false) | Err(_) => {}
        }
    }

    /// A peer advertised a height this node hasn't reached; issue a
    /// `STATE_REQUEST` back to it directly.
    async fn handle_block_announce(&self, envelope: Envelope, peer_ip: String) {
        let Some(remote_height) = parse_block_announce(&envelope) else { return };
        match sync::should_request_state(&self.store, remote_height) {
            Ok(true) => {
                let payload = protocol::state_request_payload();
                let request = Envelope::new(
                    MessageType::StateRequest,
                    self.transport.node_id(),
                    self.listen_port,
                    payload,
                    now_unix(),
                    false,
                );
                let _ = self.transport.send_to(&peer_ip, envelope.sender_port, &request).await;
            }
            Ok(false) | Err(_) => {}
        }
    }

    /// Lightweight height advertisement broadcast after this node installs
    /// a new block, whichever path (mined, `FINAL_UPDATE`, or sync) put it
    /// there — lets a lagging peer learn there's something to catch up on
    /// even if it missed the `FINAL_UPDATE` gossip itself.
    async fn announce_block(&self, block_number: u64) {
        let payload = protocol::block_announce_payload(block_number);
        let envelope = Envelope::new(
            MessageType::BlockAnnounce,
            self.transport.node_id(),
            self.listen_port,
            payload,
            now_unix(),
            true,
        );
        self.transport.broadcast(&envelope).await;
    }

    // ---------------------------------------------------------------
    // Miner path: IDLE -> PROPOSING -> AWAITING_SIGNATURES -> FINALIZING
    // ---------------------------------------------------------------

    /// Attempts `IDLE -> PROPOSING` if mining is enabled and no round is
    /// already in flight. A no-op otherwise — called both from explicit
    /// start requests and from every rebuild trigger.
    async fn try_propose(self: Arc<Self>) {
        if !self.mining.load(Ordering::SeqCst) {
            return;
        }
        {
            let state = self.state.lock().await;
            if !matches!(*state, RoundState::Idle) {
                return;
            }
        }

        let round_ts = now_unix();
        let users = match self.store.all_users() {
            Ok(u) => u,
            Err(e) => return self.record_outcome(RoundOutcome::Storage(e.to_string())).await,
        };
        let miner_pool = match self.store.miner_pool_snapshot() {
            Ok(p) => p,
            Err(e) => return self.record_outcome(RoundOutcome::Storage(e.to_string())).await,
        };
        let current_group = match self.store.latest_group() {
            Ok(Some(g)) => g,
            Ok(None) => return self.record_outcome(RoundOutcome::Storage("no group".into())).await,
            Err(e) => return self.record_outcome(RoundOutcome::Storage(e.to_string())).await,
        };
        let latest_block = match self.store.latest_block() {
            Ok(Some(b)) => b,
            Ok(None) => return self.record_outcome(RoundOutcome::Storage("no genesis".into())).await,
            Err(e) => return self.record_outcome(RoundOutcome::Storage(e.to_string())).await,
        };

        if !current_group.miners.contains_key(&self.address) {
            self.record_outcome(RoundOutcome::NotInGroup).await;
            self.schedule_rebuild(NOT_IN_GROUP_BACKOFF);
            return;
        }

        let ordered_tx = self.mempool.drain_ordered();
        let input = ExecutorInput {
            users,
            miner_pool,
            current_group: current_group.clone(),
            miner: self.address.clone(),
            ordered_tx,
            round_ts,
        };

        let output = match executor::run(input) {
            Ok(o) => o,
            Err(ExecutorError::MinerExpired) => {
                self.record_outcome(RoundOutcome::MinerExpired).await;
                return;
            }
        };

        let state_hash = canonical_hash(&output.snapshot);
        let roster: BTreeSet<Address> = output.snapshot.current_group.miners.keys().cloned().collect();
        let committee_set = committee::select(&state_hash, &roster);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        let pending = PendingRound {
            state_hash,
            proposed_state: output.snapshot.clone(),
            executed: output.executed,
            committee: committee_set,
            collected: BTreeMap::new(),
            prev_hash: latest_block.state_hash,
            block_number: latest_block.block_number + 1,
            timestamp: round_ts,
            token,
        };

        {
            let mut state = self.state.lock().await;
            *state = RoundState::AwaitingSignatures(pending);
        }

        let payload = protocol::update_request_payload(&state_hash, &output.snapshot, &self.address, self.listen_port);
        let envelope = Envelope::new(
            MessageType::UpdateRequest,
            self.transport.node_id(),
            self.listen_port,
            payload,
            round_ts,
            true,
        );
        self.transport.broadcast(&envelope).await;

        self.arm_timer(token);
    }

    /// Spawns the timeout watchdog for this round; consumes its own
    /// handle so the spawned task needs no further cloning.
    fn arm_timer(self: Arc<Self>, token: u64) {
        let wait = self.signature_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            self.on_timeout(token).await;
        });
    }

    fn schedule_rebuild(self: Arc<Self>, after: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            self.try_propose().await;
        });
    }

    async fn on_timeout(self: Arc<Self>, token: u64) {
        let fired = {
            let mut state = self.state.lock().await;
            match &*state {
                RoundState::AwaitingSignatures(pending) if pending.token == token => {
                    *state = RoundState::Idle;
                    true
                }
                _ => false,
            }
        };
        if !fired {
            return;
        }
        // The round is dead; a signer that latched onto its hash must be
        // free to sign the rebuild's fresh hash, not stuck refusing forever.
        *self.last_signed_hash.lock().await = None;
        self.record_outcome(RoundOutcome::Expired).await;
        self.schedule_rebuild(REBUILD_DELAY);
    }

    async fn abandon_current_round(&self) {
        let mut state = self.state.lock().await;
        *state = RoundState::Idle;
        *self.last_signed_hash.lock().await = None;
    }

    /// `AWAITING_SIGNATURES -> FINALIZING -> IDLE`. Broadcasts
    /// `FINAL_UPDATE` before committing locally — the order is
    /// immaterial for correctness since every peer re-derives the block
    /// from the snapshot, but it lets peers start on the next round
    /// while this node's own write is in flight.
    async fn finalize(self: Arc<Self>, pending: PendingRound) {
        let signatures: Vec<SignatureBundle> = pending.collected.into_values().collect();
        let block = chain::create_block(
            &pending.proposed_state,
            &pending.prev_hash,
            pending.block_number,
            self.address.clone(),
            pending.timestamp,
            pending.executed.len() as u64,
            signatures.clone(),
        );

        let payload = protocol::final_update_payload(&pending.state_hash, &pending.proposed_state, &signatures);
        let envelope = Envelope::new(
            MessageType::FinalUpdate,
            self.transport.node_id(),
            self.listen_port,
            payload,
            now_unix(),
            true,
        );
        self.transport.broadcast(&envelope).await;

        match self.store.apply_snapshot(&pending.proposed_state, &block, &pending.executed) {
            Ok(()) => {
                self.mempool.clear();
                *self.last_signed_hash.lock().await = None;
                self.announce_block(block.block_number).await;
                self.record_outcome(RoundOutcome::Mined { block_number: block.block_number }).await;
            }
            Err(e) => {
                self.record_outcome(RoundOutcome::Storage(e.to_string())).await;
            }
        }

        {
            let mut state = self.state.lock().await;
            *state = RoundState::Idle;
        }
        if self.mining.load(Ordering::SeqCst) {
            self.try_propose().await;
        }
    }

    async fn handle_signature_envelope(self: Arc<Self>, envelope: Envelope) {
        let (Some(state_hash), Some(signer), Some(signature)) = (
            envelope.payload.get("state_hash").and_then(|v| v.as_str()).and_then(hex_to_32),
            envelope
                .payload
                .get("signer")
                .and_then(|v| v.as_str())
                .and_then(|s| Address::parse(s).ok()),
            envelope
                .payload
                .get("signature")
                .and_then(|v| v.as_str())
                .and_then(|s| hex::decode(s).ok()),
        ) else {
            return;
        };
        self.on_signature(state_hash, signer, signature).await;
    }

    /// Step 3 of the miner path: collects one committee member's
    /// signature, ignoring it unless it is for the currently pending
    /// hash, from a committee member, not already collected, and
    /// verifies. Finalizes once the threshold is reached.
    async fn on_signature(self: Arc<Self>, state_hash: [u8; 32], signer: Address, signature: Vec<u8>) {
        let should_finalize = {
            let mut state = self.state.lock().await;
            let RoundState::AwaitingSignatures(pending) = &mut *state else {
                return;
            };
            if pending.state_hash != state_hash {
                return;
            }
            if !pending.committee.contains(&signer) {
                return;
            }
            if pending.collected.contains_key(&signer) {
                return;
            }
            let hash_hex = hex::encode(state_hash);
            if !self.oracle.verify(&signer, &hash_hex, &signature) {
                return;
            }
            pending
                .collected
                .insert(signer.clone(), SignatureBundle { signer, state_hash, signature });
            pending.collected.len() >= committee::COMMITTEE_SIZE
        };

        if !should_finalize {
            return;
        }
        let pending = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, RoundState::Idle) {
                RoundState::AwaitingSignatures(p) => Some(p),
                RoundState::Idle => None,
            }
        };
        if let Some(pending) = pending {
            self.finalize(pending).await;
        }
    }

    // ---------------------------------------------------------------
    // Non-miner path: validate an inbound UPDATE_REQUEST and sign it
    // ---------------------------------------------------------------

    async fn handle_update_request(self: Arc<Self>, envelope: Envelope, peer_ip: String) {
        let Some((claimed_hash, proposed_state, miner, miner_port)) = parse_update_request(&envelope) else {
            return;
        };

        if canonical_hash(&proposed_state) != claimed_hash {
            return;
        }

        {
            // Never sign two distinct hashes in the same round; a
            // re-receipt of the same hash is a harmless no-op since the
            // miner already has our signature.
            let last = self.last_signed_hash.lock().await;
            if last.is_some() {
                return;
            }
        }

        let local_users = match self.store.all_users() {
            Ok(u) => u,
            Err(_) => return,
        };
        let local_pool = match self.store.miner_pool_snapshot() {
            Ok(p) => p,
            Err(_) => return,
        };
        let local_group = match self.store.latest_group() {
            Ok(Some(g)) => g,
            _ => return,
        };
        let round_ts = envelope.timestamp;

        if validator::validate(&miner, &claimed_hash, &proposed_state, local_users, local_pool, local_group, round_ts).is_err() {
            return;
        }

        let roster: BTreeSet<Address> = proposed_state.current_group.miners.keys().cloned().collect();
        let committee_set = committee::select(&claimed_hash, &roster);
        if !committee_set.contains(&self.address) {
            return;
        }

        let hash_hex = hex::encode(claimed_hash);
        let signature = self.oracle.sign(&self.private_key, &hash_hex);
        *self.last_signed_hash.lock().await = Some(claimed_hash);

        let payload = protocol::signature_payload(&claimed_hash, &self.address, &signature);
        let reply = Envelope::new(
            MessageType::Signature,
            self.transport.node_id(),
            self.listen_port,
            payload,
            now_unix(),
            false,
        );
        let _ = self.transport.send_to(&peer_ip, miner_port, &reply).await;
    }

    // ---------------------------------------------------------------
    // FINAL_UPDATE: gossip of a committed round, possibly preempting an
    // in-flight local proposal.
    // ---------------------------------------------------------------

    async fn handle_final_update_envelope(self: Arc<Self>, envelope: Envelope) {
        let Some((claimed_hash, state, signatures)) = parse_final_update(&envelope) else { return };
        if let Err(err) = self.apply_final_update(claimed_hash, state, signatures).await {
            // A bad or stale FINAL_UPDATE from a lagging/faulty peer is
            // logged, never propagated: it must not disturb this node.
            eprintln!("coordinator: rejected FINAL_UPDATE: {err}");
        }
    }

    async fn apply_final_update(
        self: Arc<Self>,
        claimed_hash: [u8; 32],
        state: StateSnapshot,
        signatures: Vec<SignatureBundle>,
    ) -> Result<(), CoordinatorError> {
        if canonical_hash(&state) != claimed_hash {
            return Err(CoordinatorError::HashMismatch);
        }

        let latest = self.store.latest_block()?;
        if let Some(head) = &latest {
            if head.state_hash == claimed_hash {
                return Ok(()); // already applied; redundant gossip
            }
        }

        let reward = state.reward_tx().ok_or(CoordinatorError::MissingReward)?;
        let miner = reward.to.clone();
        let timestamp = reward.timestamp;

        let roster: BTreeSet<Address> = state.current_group.miners.keys().cloned().collect();
        let committee_set = committee::select(&claimed_hash, &roster);
        verify_final_signatures(&committee_set, &signatures, &claimed_hash, self.oracle.as_ref())?;

        let (prev_hash, block_number) = match &latest {
            Some(b) => (b.state_hash, b.block_number + 1),
            None => (crate::primitives::block::ZERO_HASH, 0),
        };

        let block = chain::create_block(
            &state,
            &prev_hash,
            block_number,
            miner,
            timestamp,
            state.tx_executed.len() as u64,
            signatures,
        );

        // Preemption: if we were mid-round on a different hash, drop it.
        let preempted = {
            let mut guard = self.state.lock().await;
            match &*guard {
                RoundState::AwaitingSignatures(pending) if pending.state_hash != claimed_hash => {
                    *guard = RoundState::Idle;
                    true
                }
                _ => false,
            }
        };

        let executed: Vec<Transaction> = state.tx_executed.values().cloned().collect();
        self.store.apply_snapshot(&state, &block, &executed)?;
        self.mempool.clear();
        *self.last_signed_hash.lock().await = None;
        self.announce_block(block.block_number).await;

        if preempted {
            self.record_outcome(RoundOutcome::Preempted).await;
        }
        if self.mining.load(Ordering::SeqCst) {
            self.try_propose().await;
        }
        Ok(())
    }

    async fn record_outcome(&self, outcome: RoundOutcome) {
        *self.last_outcome.lock().await = Some(outcome);
    }
}

fn verify_final_signatures(
    committee: &BTreeSet<Address>,
    signatures: &[SignatureBundle],
    expected_hash: &[u8; 32],
    oracle: &impl SignatureOracle,
) -> Result<(), CoordinatorError> {
    let mut seen = BTreeSet::new();
    let hash_hex = hex::encode(expected_hash);
    for bundle in signatures {
        if bundle.state_hash != *expected_hash {
            continue;
        }
        if !committee.contains(&bundle.signer) {
            return Err(CoordinatorError::SignerNotInCommittee(bundle.signer.clone()));
        }
        if !seen.insert(bundle.signer.clone()) {
            return Err(CoordinatorError::DuplicateSigner(bundle.signer.clone()));
        }
        if !oracle.verify(&bundle.signer, &hash_hex, &bundle.signature) {
            return Err(CoordinatorError::InvalidSignature(bundle.signer.clone()));
        }
    }
    let required = committee::COMMITTEE_SIZE.min(committee.len());
    if seen.len() < required {
        return Err(CoordinatorError::InsufficientSignatures(seen.len(), required));
    }
    Ok(())
}

fn hex_to_32(s: &str) -> Option<[u8; 32]> {
    hex::decode(s).ok()?.try_into().ok()
}

fn decode_transaction(envelope: &Envelope) -> Option<Transaction> {
    decode_transaction_value(envelope.payload.get("tx")?)
}

fn decode_transaction_value(value: &crate::codec::CanonicalValue) -> Option<Transaction> {
    let map = value.as_map()?;
    let tx_id = map.get("tx_id")?.as_str()?.to_string();
    let tx_type = match map.get("tx_type")?.as_str()? {
        "transfer" => crate::primitives::TxType::Transfer,
        "new_account" => crate::primitives::TxType::NewAccount,
        "join_pool" => crate::primitives::TxType::JoinPool,
        "reward" => crate::primitives::TxType::Reward,
        _ => return None,
    };
    let from = Address::parse(map.get("from")?.as_str()?).ok()?;
    let to = Address::parse(map.get("to")?.as_str()?).ok()?;
    let amount = map.get("amount")?.as_decimal()?;
    let fee = map.get("fee")?.as_decimal()?;
    let nonce = map.get("nonce")?.as_int()? as u64;
    let timestamp = map.get("timestamp")?.as_int()? as u64;
    let signature = hex::decode(map.get("signature")?.as_str()?).ok()?;
    Some(Transaction { tx_id, tx_type, from, to, amount, fee, nonce, timestamp, signature })
}

fn parse_update_request(envelope: &Envelope) -> Option<([u8; 32], StateSnapshot, Address, u16)> {
    let state_hash = envelope.payload.get("state_hash")?.as_str().and_then(hex_to_32)?;
    let proposed_state = decode_snapshot(envelope.payload.get("proposed_state")?)?;
    let miner = Address::parse(envelope.payload.get("miner")?.as_str()?).ok()?;
    let miner_port = envelope.payload.get("miner_port")?.as_int()? as u16;
    Some((state_hash, proposed_state, miner, miner_port))
}

fn parse_final_update(envelope: &Envelope) -> Option<([u8; 32], StateSnapshot, Vec<SignatureBundle>)> {
    let state_hash = envelope.payload.get("state_hash")?.as_str().and_then(hex_to_32)?;
    let state = decode_snapshot(envelope.payload.get("state")?)?;
    let sigs_value = envelope.payload.get("signatures")?.as_array()?;
    let mut signatures = Vec::with_capacity(sigs_value.len());
    for v in sigs_value {
        let map = v.as_map()?;
        let signer = Address::parse(map.get("signer")?.as_str()?).ok()?;
        let sig_state_hash = map.get("state_hash")?.as_str().and_then(hex_to_32)?;
        let signature = hex::decode(map.get("signature")?.as_str()?).ok()?;
        signatures.push(SignatureBundle { signer, state_hash: sig_state_hash, signature });
    }
    Some((state_hash, state, signatures))
}

fn parse_state_update(envelope: &Envelope) -> Option<(Block, StateSnapshot)> {
    let map = envelope.payload.as_map()?;
    let block_number = map.get("block_number")?.as_int()? as u64;
    let prev_hash = map.get("prev_hash")?.as_str().and_then(hex_to_32)?;
    let state_hash = map.get("state_hash")?.as_str().and_then(hex_to_32)?;
    let combined_hash = map.get("combined_hash")?.as_str().and_then(hex_to_32)?;
    let group_id = map.get("group_id")?.as_int()? as u64;
    let miner = Address::parse(map.get("miner")?.as_str()?).ok()?;
    let timestamp = map.get("timestamp")?.as_int()? as u64;
    let executed_tx_count = map.get("executed_tx_count")?.as_int()? as u64;

    let sigs_value = map.get("signatures")?.as_array()?;
    let mut signatures = Vec::with_capacity(sigs_value.len());
    for v in sigs_value {
        let sig_map = v.as_map()?;
        let signer = Address::parse(sig_map.get("signer")?.as_str()?).ok()?;
        let sig_state_hash = sig_map.get("state_hash")?.as_str().and_then(hex_to_32)?;
        let signature = hex::decode(sig_map.get("signature")?.as_str()?).ok()?;
        signatures.push(SignatureBundle { signer, state_hash: sig_state_hash, signature });
    }

    let state = decode_snapshot(map.get("state")?)?;
    let block = Block {
        block_number,
        prev_hash,
        state_hash,
        combined_hash,
        group_id,
        miner,
        timestamp,
        executed_tx_count,
        signatures,
    };
    Some((block, state))
}

fn parse_block_announce(envelope: &Envelope) -> Option<u64> {
    let map = envelope.payload.as_map()?;
    Some(map.get("block_number")?.as_int()? as u64)
}

fn decode_snapshot(value: &crate::codec::CanonicalValue) -> Option<StateSnapshot> {
    use crate::primitives::{Group, User};

    let map = value.as_map()?;

    let mut users = BTreeMap::new();
    for (addr_str, user_value) in map.get("users")?.as_map()? {
        let address = Address::parse(addr_str).ok()?;
        let um = user_value.as_map()?;
        let balance = um.get("balance")?.as_decimal()?;
        let nonce = um.get("nonce")?.as_int()? as u64;
        let life = um.get("life")?.as_int()? as u64;
        users.insert(address.clone(), User { address, balance, nonce, life });
    }

    let mut miner_pool = BTreeMap::new();
    for (addr_str, joined_value) in map.get("miner_pool")?.as_map()? {
        let address = Address::parse(addr_str).ok()?;
        miner_pool.insert(address, joined_value.as_int()? as u64);
    }

    let group_value = map.get("current_group")?.as_map()?;
    let group_id = group_value.get("group_id")?.as_int()? as u64;
    let created_at = group_value.get("created_at")?.as_int()? as u64;
    let mut miners = BTreeMap::new();
    for (addr_str, joined_value) in group_value.get("miners")?.as_map()? {
        let address = Address::parse(addr_str).ok()?;
        miners.insert(address, joined_value.as_int()? as u64);
    }
    let current_group = Group { group_id, miners, created_at };

    let mut tx_executed = BTreeMap::new();
    for (tx_id, tx_value) in map.get("tx_executed")?.as_map()? {
        let tx = decode_transaction_value(tx_value)?;
        tx_executed.insert(tx_id.clone(), tx);
    }

    Some(StateSnapshot { users, miner_pool, current_group, tx_executed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Group, MicroAmount};
    use crate::wallet::MockOracle;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    static CTR: AtomicU64 = AtomicU64::new(0);

    fn tmp_store() -> Arc<StateStore> {
        let id = CTR.fetch_add(1, AtomicOrdering::SeqCst);
        let p = PathBuf::from(format!("/tmp/ledgerd_coord_{}_{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&p);
        Arc::new(StateStore::open(&p).unwrap())
    }

    fn addr_of(oracle: &MockOracle, key: &[u8]) -> Address {
        oracle.address_of(key)
    }

    /// `try_propose` requires the miner to already exist in the users CF
    /// (the executor's life-decrement check) in addition to the group.
    /// Seeds it via one ordinary `apply_snapshot` on top of genesis.
    fn seed_miner_as_user(store: &StateStore, miner: &Address, group: &Group) {
        let mut users = BTreeMap::new();
        users.insert(miner.clone(), crate::primitives::User::new(miner.clone()));
        let snapshot = StateSnapshot {
            users,
            miner_pool: BTreeMap::new(),
            current_group: group.clone(),
            tx_executed: BTreeMap::new(),
        };
        let genesis = store.latest_block().unwrap().unwrap();
        let block = chain::create_block(&snapshot, &genesis.state_hash, genesis.block_number + 1, miner.clone(), 999, 0, Vec::new());
        store.apply_snapshot(&snapshot, &block, &[]).unwrap();
    }

    fn make_coordinator(
        store: Arc<StateStore>,
        oracle: Arc<MockOracle>,
        private_key: &[u8],
        signature_wait_seconds: u64,
    ) -> Arc<Coordinator<MockOracle>> {
        let mempool = Arc::new(Mempool::new());
        let (transport, _rx) = GossipTransport::new("test-node".to_string(), 0);
        Coordinator::new(store, mempool, Arc::new(transport), oracle, private_key.to_vec(), 0, signature_wait_seconds)
    }

    #[tokio::test]
    async fn not_in_group_records_outcome_and_backs_off() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let key = b"miner-key".to_vec();

        // A group exists but this miner isn't in it.
        let mut other_group = Group::genesis();
        other_group.group_id = 2;
        store.save_group(&other_group).unwrap();

        let co = make_coordinator(store, oracle, &key, 60);
        co.mining.store(true, AtomicOrdering::SeqCst);
        Arc::clone(&co).try_propose().await;

        assert_eq!(co.last_outcome().await, Some(RoundOutcome::NotInGroup));
    }

    #[tokio::test]
    async fn signature_collection_finalizes_at_threshold() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let miner_key = b"miner-key".to_vec();
        let miner = addr_of(&oracle, &miner_key);

        let mut miners = BTreeMap::new();
        let mut signer_keys = Vec::new();
        for i in 0..100u32 {
            let key = format!("signer-{i}").into_bytes();
            let addr = addr_of(&oracle, &key);
            miners.insert(addr.clone(), 0);
            signer_keys.push((addr, key));
        }
        miners.insert(miner.clone(), 0);
        let group = Group { group_id: 1, miners, created_at: 0 };
        store.save_group(&group).unwrap();
        seed_miner_as_user(&store, &miner, &group);

        let co = make_coordinator(store.clone(), oracle.clone(), &miner_key, 60);
        co.mining.store(true, AtomicOrdering::SeqCst);
        Arc::clone(&co).try_propose().await;

        let (state_hash, committee_set) = {
            let state = co.state.lock().await;
            match &*state {
                RoundState::AwaitingSignatures(p) => (p.state_hash, p.committee.clone()),
                RoundState::Idle => panic!("expected a pending round"),
            }
        };
        assert_eq!(committee_set.len(), 100);

        let hash_hex = hex::encode(state_hash);
        let mut delivered = 0;
        for (addr, key) in &signer_keys {
            if !committee_set.contains(addr) {
                continue;
            }
            let sig = oracle.sign(key, &hash_hex);
            Arc::clone(&co).on_signature(state_hash, addr.clone(), sig).await;
            delivered += 1;
        }
        assert!(delivered <= 100);

        let state = co.state.lock().await;
        if delivered >= committee::COMMITTEE_SIZE {
            assert!(matches!(&*state, RoundState::Idle), "round should finalize once the committee is fully signed");
        }
    }

    #[tokio::test]
    async fn timeout_abandons_round_without_touching_mempool() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let key = b"solo-miner".to_vec();
        let miner = addr_of(&oracle, &key);

        let mut miners = BTreeMap::new();
        miners.insert(miner.clone(), 0);
        let group = Group { group_id: 1, miners, created_at: 0 };
        store.save_group(&group).unwrap();
        seed_miner_as_user(&store, &miner, &group);

        let mempool = Arc::new(Mempool::new());
        let tx = Transaction {
            tx_id: "abc".to_string(),
            tx_type: crate::primitives::TxType::JoinPool,
            from: miner.clone(),
            to: miner.clone(),
            amount: MicroAmount::ZERO,
            fee: MicroAmount(1),
            nonce: 0,
            timestamp: 0,
            signature: Vec::new(),
        };
        mempool.insert(tx).unwrap();

        let (transport, _rx) = GossipTransport::new("test-node".to_string(), 0);
        let co = Coordinator::new(store, mempool.clone(), Arc::new(transport), oracle, key, 0, 1);
        co.mining.store(true, AtomicOrdering::SeqCst);
        Arc::clone(&co).try_propose().await;

        let token = {
            let state = co.state.lock().await;
            match &*state {
                RoundState::AwaitingSignatures(p) => p.token,
                RoundState::Idle => panic!("expected pending round"),
            }
        };

        Arc::clone(&co).on_timeout(token).await;
        assert_eq!(co.last_outcome().await, Some(RoundOutcome::Expired));
        assert_eq!(mempool.len(), 1, "timeout must not clear the pool");
    }

    #[tokio::test]
    async fn timeout_clears_the_signer_latch_so_a_rebuilt_round_can_be_signed() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let key = b"signer-key".to_vec();
        let signer = addr_of(&oracle, &key);

        let mut miners = BTreeMap::new();
        miners.insert(signer.clone(), 0);
        let group = Group { group_id: 1, miners, created_at: 0 };
        store.save_group(&group).unwrap();
        seed_miner_as_user(&store, &signer, &group);

        let co = make_coordinator(store.clone(), oracle.clone(), &key, 60);

        // This node signed some now-dead round's hash, and was itself the
        // proposer of a different round that is about to time out.
        *co.last_signed_hash.lock().await = Some([0xaau8; 32]);
        {
            let mut state = co.state.lock().await;
            *state = RoundState::AwaitingSignatures(PendingRound {
                state_hash: [0xbbu8; 32],
                proposed_state: StateSnapshot {
                    users: BTreeMap::new(),
                    miner_pool: BTreeMap::new(),
                    current_group: group.clone(),
                    tx_executed: BTreeMap::new(),
                },
                executed: Vec::new(),
                committee: BTreeSet::new(),
                collected: BTreeMap::new(),
                prev_hash: crate::primitives::block::ZERO_HASH,
                block_number: 1,
                timestamp: 1000,
                token: 7,
            });
        }

        Arc::clone(&co).on_timeout(7).await;
        assert!(co.last_signed_hash.lock().await.is_none(), "an expired round must release the signer latch");

        // A freshly rebuilt proposal carries a different hash and must now
        // be signable rather than permanently refused.
        let users = store.all_users().unwrap();
        let pool = store.miner_pool_snapshot().unwrap();
        let input = ExecutorInput {
            users,
            miner_pool: pool,
            current_group: group.clone(),
            miner: signer.clone(),
            ordered_tx: vec![],
            round_ts: 2000,
        };
        let output = executor::run(input).unwrap();
        let hash = canonical_hash(&output.snapshot);

        let envelope = Envelope::new(
            MessageType::UpdateRequest,
            "proposer",
            9999,
            protocol::update_request_payload(&hash, &output.snapshot, &signer, 9999),
            2000,
            true,
        );
        Arc::clone(&co).handle_update_request(envelope, "127.0.0.1".to_string()).await;
        assert_eq!(*co.last_signed_hash.lock().await, Some(hash));
    }

    #[tokio::test]
    async fn abandon_current_round_clears_the_signer_latch_too() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let co = make_coordinator(store, oracle, b"abandon-node", 60);

        *co.last_signed_hash.lock().await = Some([0x11u8; 32]);
        co.abandon_current_round().await;
        assert!(co.last_signed_hash.lock().await.is_none());
    }

    #[tokio::test]
    async fn ping_is_answered_with_a_unicast_pong() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let co = make_coordinator(store, oracle, b"ping-node", 60);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let ping = Envelope::new(MessageType::Ping, "prober", port, protocol::empty_payload(), 0, false);
        co.handle_ping(ping, "127.0.0.1".to_string()).await;

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        stream.read_to_end(&mut buf).await.unwrap();
        let received = Envelope::from_bytes(&buf).unwrap();
        assert_eq!(received.msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn stale_update_request_hash_mismatch_is_ignored() {
        let store = tmp_store();
        chain::ensure_genesis(&store, 1000).unwrap();
        let oracle = Arc::new(MockOracle::new());
        let key = b"signer".to_vec();
        let co = make_coordinator(store, oracle, &key, 60);

        let bogus = Envelope::new(
            MessageType::UpdateRequest,
            "someone-else",
            1234,
            protocol::update_request_payload(
                &[0xabu8; 32],
                &StateSnapshot {
                    users: BTreeMap::new(),
                    miner_pool: BTreeMap::new(),
                    current_group: Group::genesis(),
                    tx_executed: BTreeMap::new(),
                },
                &Address::from_bytes(&[1u8; 8]),
                1234,
            ),
            0,
            true,
        );
        // Claimed hash doesn't match the (empty) snapshot's real hash, so
        // this must be silently dropped rather than signed.
        Arc::clone(&co).handle_update_request(bogus, "127.0.0.1".to_string()).await;
        assert!(co.last_signed_hash.lock().await.is_none());
    }
}
