//! Wire envelope shape. Every message that crosses the network is one of
//! these, CC-encoded onto a single one-shot connection (see
//! `net::transport`). The envelope id is the hash of everything except
//! itself, so identical retransmissions collapse under dedup regardless of
//! which peer relayed them.

use std::collections::BTreeMap;

use crate::codec::{self, sha256, CanonicalValue, ToCanonical};
use crate::primitives::{Address, Block, SignatureBundle, StateSnapshot, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] codec::DecodeError),
    #[error("envelope missing field {0}")]
    MissingField(&'static str),
    #[error("unknown message type {0}")]
    UnknownMessageType(String),
    #[error("envelope id does not match its body")]
    IdMismatch,
    #[error("envelope exceeds the 65 KiB one-shot frame limit")]
    TooLarge,
}

/// Messages this engine exchanges, per the protocol table: bootstrap,
/// liveness, mempool relay, the propose/sign/finalize round, and sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Hello,
    Presence,
    Transaction,
    UpdateRequest,
    Signature,
    FinalUpdate,
    StateRequest,
    StateUpdate,
    BlockAnnounce,
    Ping,
    Pong,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Presence => "PRESENCE",
            MessageType::Transaction => "TRANSACTION",
            MessageType::UpdateRequest => "UPDATE_REQUEST",
            MessageType::Signature => "SIGNATURE",
            MessageType::FinalUpdate => "FINAL_UPDATE",
            MessageType::StateRequest => "STATE_REQUEST",
            MessageType::StateUpdate => "STATE_UPDATE",
            MessageType::BlockAnnounce => "BLOCK_ANNOUNCE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        Ok(match s {
            "HELLO" => MessageType::Hello,
            "PRESENCE" => MessageType::Presence,
            "TRANSACTION" => MessageType::Transaction,
            "UPDATE_REQUEST" => MessageType::UpdateRequest,
            "SIGNATURE" => MessageType::Signature,
            "FINAL_UPDATE" => MessageType::FinalUpdate,
            "STATE_REQUEST" => MessageType::StateRequest,
            "STATE_UPDATE" => MessageType::StateUpdate,
            "BLOCK_ANNOUNCE" => MessageType::BlockAnnounce,
            "PING" => MessageType::Ping,
            "PONG" => MessageType::Pong,
            other => return Err(ProtocolError::UnknownMessageType(other.to_string())),
        })
    }
}

const MAX_ENVELOPE_BYTES: usize = 65 * 1024;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: [u8; 32],
    pub msg_type: MessageType,
    pub sender: String,
    pub sender_port: u16,
    pub payload: CanonicalValue,
    pub timestamp: u64,
    pub broadcast: bool,
}

impl Envelope {
    /// Builds an envelope and computes its id over the body (everything
    /// but `id` itself).
    pub fn new(
        msg_type: MessageType,
        sender: impl Into<String>,
        sender_port: u16,
        payload: CanonicalValue,
        timestamp: u64,
        broadcast: bool,
    ) -> Self {
        let sender = sender.into();
        let body = body_canonical(msg_type, &sender, sender_port, &payload, timestamp, broadcast);
        let id = sha256(&codec::encode(&body));
        Envelope { id, msg_type, sender, sender_port, payload, timestamp, broadcast }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = codec::encode(&self.to_canonical());
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(ProtocolError::TooLarge);
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(ProtocolError::TooLarge);
        }
        let value = codec::decode(bytes)?;
        let map = value.as_map().ok_or(ProtocolError::MissingField("<root>"))?;

        let id_hex = map.get("id").and_then(|v| v.as_str()).ok_or(ProtocolError::MissingField("id"))?;
        let id = hex_to_32(id_hex).ok_or(ProtocolError::MissingField("id"))?;
        let type_str = map.get("type").and_then(|v| v.as_str()).ok_or(ProtocolError::MissingField("type"))?;
        let msg_type = MessageType::parse(type_str)?;
        let sender = map.get("sender").and_then(|v| v.as_str()).ok_or(ProtocolError::MissingField("sender"))?.to_string();
        let sender_port = map.get("sender_port").and_then(|v| v.as_int()).ok_or(ProtocolError::MissingField("sender_port"))? as u16;
        let payload = map.get("payload").cloned().ok_or(ProtocolError::MissingField("payload"))?;
        let timestamp = map.get("timestamp").and_then(|v| v.as_int()).ok_or(ProtocolError::MissingField("timestamp"))? as u64;
        let broadcast = map.get("broadcast").and_then(|v| v.as_bool()).ok_or(ProtocolError::MissingField("broadcast"))?;

        let envelope = Envelope { id, msg_type, sender, sender_port, payload, timestamp, broadcast };
        let recomputed = sha256(&codec::encode(&body_canonical(
            envelope.msg_type,
            &envelope.sender,
            envelope.sender_port,
            &envelope.payload,
            envelope.timestamp,
            envelope.broadcast,
        )));
        if recomputed != envelope.id {
            return Err(ProtocolError::IdMismatch);
        }
        Ok(envelope)
    }
}

impl ToCanonical for Envelope {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();
        m.insert("id".to_string(), CanonicalValue::Str(hex::encode(self.id)));
        m.insert("type".to_string(), CanonicalValue::Str(self.msg_type.as_str().to_string()));
        m.insert("sender".to_string(), CanonicalValue::Str(self.sender.clone()));
        m.insert("sender_port".to_string(), CanonicalValue::Int(self.sender_port as i64));
        m.insert("payload".to_string(), self.payload.clone());
        m.insert("timestamp".to_string(), CanonicalValue::Int(self.timestamp as i64));
        m.insert("broadcast".to_string(), CanonicalValue::Bool(self.broadcast));
        CanonicalValue::Map(m)
    }
}

fn body_canonical(
    msg_type: MessageType,
    sender: &str,
    sender_port: u16,
    payload: &CanonicalValue,
    timestamp: u64,
    broadcast: bool,
) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("type".to_string(), CanonicalValue::Str(msg_type.as_str().to_string()));
    m.insert("sender".to_string(), CanonicalValue::Str(sender.to_string()));
    m.insert("sender_port".to_string(), CanonicalValue::Int(sender_port as i64));
    m.insert("payload".to_string(), payload.clone());
    m.insert("timestamp".to_string(), CanonicalValue::Int(timestamp as i64));
    m.insert("broadcast".to_string(), CanonicalValue::Bool(broadcast));
    CanonicalValue::Map(m)
}

fn hex_to_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

// --- payload builders ---

pub fn hello_payload(node_id: &str, port: u16) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("node_id".to_string(), CanonicalValue::Str(node_id.to_string()));
    m.insert("port".to_string(), CanonicalValue::Int(port as i64));
    CanonicalValue::Map(m)
}

pub fn transaction_payload(tx: &Transaction) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("tx".to_string(), tx.to_canonical());
    CanonicalValue::Map(m)
}

pub fn update_request_payload(
    state_hash: &[u8; 32],
    proposed_state: &StateSnapshot,
    miner: &Address,
    miner_port: u16,
) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("state_hash".to_string(), CanonicalValue::Str(hex::encode(state_hash)));
    m.insert("proposed_state".to_string(), proposed_state.to_canonical());
    m.insert("miner".to_string(), miner.to_canonical());
    m.insert("miner_port".to_string(), CanonicalValue::Int(miner_port as i64));
    CanonicalValue::Map(m)
}

pub fn signature_payload(state_hash: &[u8; 32], signer: &Address, signature: &[u8]) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("state_hash".to_string(), CanonicalValue::Str(hex::encode(state_hash)));
    m.insert("signer".to_string(), signer.to_canonical());
    m.insert("signature".to_string(), CanonicalValue::Str(hex::encode(signature)));
    CanonicalValue::Map(m)
}

pub fn final_update_payload(
    state_hash: &[u8; 32],
    state: &StateSnapshot,
    signatures: &[SignatureBundle],
) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("state_hash".to_string(), CanonicalValue::Str(hex::encode(state_hash)));
    m.insert("state".to_string(), state.to_canonical());
    let sigs = signatures.iter().map(|s| s.to_canonical()).collect();
    m.insert("signatures".to_string(), CanonicalValue::Array(sigs));
    CanonicalValue::Map(m)
}

pub fn state_request_payload() -> CanonicalValue {
    CanonicalValue::Map(BTreeMap::new())
}

pub fn state_update_payload(block: &Block, state: &StateSnapshot) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("block_number".to_string(), CanonicalValue::Int(block.block_number as i64));
    m.insert("prev_hash".to_string(), CanonicalValue::Str(hex::encode(block.prev_hash)));
    m.insert("state_hash".to_string(), CanonicalValue::Str(hex::encode(block.state_hash)));
    m.insert("combined_hash".to_string(), CanonicalValue::Str(hex::encode(block.combined_hash)));
    m.insert("group_id".to_string(), CanonicalValue::Int(block.group_id as i64));
    m.insert("miner".to_string(), block.miner.to_canonical());
    m.insert("timestamp".to_string(), CanonicalValue::Int(block.timestamp as i64));
    m.insert("executed_tx_count".to_string(), CanonicalValue::Int(block.executed_tx_count as i64));
    let sigs = block.signatures.iter().map(|s| s.to_canonical()).collect();
    m.insert("signatures".to_string(), CanonicalValue::Array(sigs));
    m.insert("state".to_string(), state.to_canonical());
    CanonicalValue::Map(m)
}

pub fn block_announce_payload(block_number: u64) -> CanonicalValue {
    let mut m = BTreeMap::new();
    m.insert("block_number".to_string(), CanonicalValue::Int(block_number as i64));
    CanonicalValue::Map(m)
}

pub fn empty_payload() -> CanonicalValue {
    CanonicalValue::Map(BTreeMap::new())
}
