//! Canonical Codec (CC). Produces a byte string for any structured value
//! such that semantically equal values encode identically on every node.
//! All hashing and signing in this crate goes through `encode`/`canonical_hash`
//! — no field ordering is ever implicit in a struct's memory layout.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::primitives::address::{Address, MicroAmount};
use crate::primitives::block::SignatureBundle;
use crate::primitives::group::Group;
use crate::primitives::snapshot::StateSnapshot;
use crate::primitives::transaction::{Transaction, TxType};
use crate::primitives::user::User;

/// A closed value type covering everything CC needs to represent: strings,
/// integers, fixed-point decimals, booleans, null, ordered arrays, and
/// maps-from-strings (always iterated in ascending key order because every
/// call site builds them from a `BTreeMap`).
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(MicroAmount),
    Str(String),
    Array(Vec<CanonicalValue>),
    Map(BTreeMap<String, CanonicalValue>),
}

pub trait ToCanonical {
    fn to_canonical(&self) -> CanonicalValue;
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Encodes a canonical value into bytes stable across nodes. Every
/// variable-length component is length-prefixed so the encoding is
/// injective: `encode(x) == encode(y) implies x == y` structurally.
pub fn encode(value: &CanonicalValue) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &CanonicalValue, buf: &mut Vec<u8>) {
    match value {
        CanonicalValue::Null => buf.push(b'n'),
        CanonicalValue::Bool(b) => {
            buf.push(b'b');
            buf.push(if *b { 1 } else { 0 });
        }
        CanonicalValue::Int(i) => {
            buf.push(b'i');
            write_len_prefixed(buf, i.to_string().as_bytes());
        }
        CanonicalValue::Decimal(d) => {
            buf.push(b'd');
            write_len_prefixed(buf, d.to_canonical_string().as_bytes());
        }
        CanonicalValue::Str(s) => {
            buf.push(b's');
            write_len_prefixed(buf, s.as_bytes());
        }
        CanonicalValue::Array(items) => {
            buf.push(b'a');
            buf.extend_from_slice(&(items.len() as u64).to_be_bytes());
            for item in items {
                encode_into(item, buf);
            }
        }
        CanonicalValue::Map(map) => {
            buf.push(b'm');
            buf.extend_from_slice(&(map.len() as u64).to_be_bytes());
            // BTreeMap iterates in ascending key order already; CC's map
            // ordering contract falls out of that for free.
            for (k, v) in map {
                write_len_prefixed(buf, k.as_bytes());
                encode_into(v, buf);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("unknown tag byte {0:#x}")]
    UnknownTag(u8),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("invalid integer literal")]
    InvalidInt,
    #[error("invalid decimal literal")]
    InvalidDecimal,
    #[error("trailing bytes after a complete value")]
    TrailingBytes,
}

/// Parses bytes produced by `encode` back into a `CanonicalValue`. Used by
/// the gossip transport to decode a received envelope.
pub fn decode(bytes: &[u8]) -> Result<CanonicalValue, DecodeError> {
    let mut cursor = 0usize;
    let value = decode_value(bytes, &mut cursor)?;
    if cursor != bytes.len() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(value)
}

fn take(bytes: &[u8], cursor: &mut usize, len: usize) -> Result<&[u8], DecodeError> {
    if *cursor + len > bytes.len() {
        return Err(DecodeError::Truncated);
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn read_len_prefixed<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], DecodeError> {
    let len_bytes = take(bytes, cursor, 8)?;
    let len = u64::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    take(bytes, cursor, len)
}

fn decode_value(bytes: &[u8], cursor: &mut usize) -> Result<CanonicalValue, DecodeError> {
    let tag = *take(bytes, cursor, 1)?.first().ok_or(DecodeError::Truncated)?;
    match tag {
        b'n' => Ok(CanonicalValue::Null),
        b'b' => {
            let b = take(bytes, cursor, 1)?[0];
            Ok(CanonicalValue::Bool(b != 0))
        }
        b'i' => {
            let raw = read_len_prefixed(bytes, cursor)?;
            let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
            let i: i64 = s.parse().map_err(|_| DecodeError::InvalidInt)?;
            Ok(CanonicalValue::Int(i))
        }
        b'd' => {
            let raw = read_len_prefixed(bytes, cursor)?;
            let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
            let amount = crate::primitives::MicroAmount::from_decimal_str(s)
                .ok_or(DecodeError::InvalidDecimal)?;
            Ok(CanonicalValue::Decimal(amount))
        }
        b's' => {
            let raw = read_len_prefixed(bytes, cursor)?;
            let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
            Ok(CanonicalValue::Str(s.to_string()))
        }
        b'a' => {
            let count_bytes = take(bytes, cursor, 8)?;
            let count = u64::from_be_bytes(count_bytes.try_into().unwrap());
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(bytes, cursor)?);
            }
            Ok(CanonicalValue::Array(items))
        }
        b'm' => {
            let count_bytes = take(bytes, cursor, 8)?;
            let count = u64::from_be_bytes(count_bytes.try_into().unwrap());
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key_raw = read_len_prefixed(bytes, cursor)?;
                let key = std::str::from_utf8(key_raw).map_err(|_| DecodeError::InvalidUtf8)?.to_string();
                let value = decode_value(bytes, cursor)?;
                map.insert(key, value);
            }
            Ok(CanonicalValue::Map(map))
        }
        other => Err(DecodeError::UnknownTag(other)),
    }
}

impl CanonicalValue {
    pub fn as_map(&self) -> Option<&BTreeMap<String, CanonicalValue>> {
        match self {
            CanonicalValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CanonicalValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CanonicalValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CanonicalValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<MicroAmount> {
        match self {
            CanonicalValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CanonicalValue]> {
        match self {
            CanonicalValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn get<'a>(&'a self, key: &str) -> Option<&'a CanonicalValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

pub fn canonical_hash(value: &impl ToCanonical) -> [u8; 32] {
    let bytes = encode(&value.to_canonical());
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// --- ToCanonical impls for every hashed type ---

impl ToCanonical for Address {
    fn to_canonical(&self) -> CanonicalValue {
        CanonicalValue::Str(self.as_str().to_string())
    }
}

impl ToCanonical for TxType {
    fn to_canonical(&self) -> CanonicalValue {
        let s = match self {
            TxType::Transfer => "transfer",
            TxType::NewAccount => "new_account",
            TxType::JoinPool => "join_pool",
            TxType::Reward => "reward",
        };
        CanonicalValue::Str(s.to_string())
    }
}

impl ToCanonical for Transaction {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();
        m.insert("tx_id".to_string(), CanonicalValue::Str(self.tx_id.clone()));
        m.insert("tx_type".to_string(), self.tx_type.to_canonical());
        m.insert("from".to_string(), self.from.to_canonical());
        m.insert("to".to_string(), self.to.to_canonical());
        m.insert("amount".to_string(), CanonicalValue::Decimal(self.amount));
        m.insert("fee".to_string(), CanonicalValue::Decimal(self.fee));
        m.insert("nonce".to_string(), CanonicalValue::Int(self.nonce as i64));
        m.insert("timestamp".to_string(), CanonicalValue::Int(self.timestamp as i64));
        m.insert(
            "signature".to_string(),
            CanonicalValue::Str(hex::encode(&self.signature)),
        );
        CanonicalValue::Map(m)
    }
}

impl ToCanonical for User {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();
        m.insert("address".to_string(), self.address.to_canonical());
        m.insert("balance".to_string(), CanonicalValue::Decimal(self.balance));
        m.insert("nonce".to_string(), CanonicalValue::Int(self.nonce as i64));
        m.insert("life".to_string(), CanonicalValue::Int(self.life as i64));
        CanonicalValue::Map(m)
    }
}

impl ToCanonical for Group {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();
        m.insert("group_id".to_string(), CanonicalValue::Int(self.group_id as i64));
        let mut miners = BTreeMap::new();
        for (addr, joined_at) in &self.miners {
            miners.insert(addr.as_str().to_string(), CanonicalValue::Int(*joined_at as i64));
        }
        m.insert("miners".to_string(), CanonicalValue::Map(miners));
        m.insert("created_at".to_string(), CanonicalValue::Int(self.created_at as i64));
        CanonicalValue::Map(m)
    }
}

impl ToCanonical for StateSnapshot {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();

        let mut users = BTreeMap::new();
        for (addr, user) in &self.users {
            users.insert(addr.as_str().to_string(), user.to_canonical());
        }
        m.insert("users".to_string(), CanonicalValue::Map(users));

        let mut pool = BTreeMap::new();
        for (addr, joined_at) in &self.miner_pool {
            pool.insert(addr.as_str().to_string(), CanonicalValue::Int(*joined_at as i64));
        }
        m.insert("miner_pool".to_string(), CanonicalValue::Map(pool));

        m.insert("current_group".to_string(), self.current_group.to_canonical());

        let mut executed = BTreeMap::new();
        for (tx_id, tx) in &self.tx_executed {
            executed.insert(tx_id.clone(), tx.to_canonical());
        }
        m.insert("tx_executed".to_string(), CanonicalValue::Map(executed));

        CanonicalValue::Map(m)
    }
}

/// The block header fields that `combined_hash` is computed over:
/// `{block_number, prev_hash, state_hash, group_id, miner, timestamp}`.
pub struct BlockHeaderFields<'a> {
    pub block_number: u64,
    pub prev_hash: &'a [u8; 32],
    pub state_hash: &'a [u8; 32],
    pub group_id: u64,
    pub miner: &'a Address,
    pub timestamp: u64,
}

impl ToCanonical for BlockHeaderFields<'_> {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();
        m.insert("block_number".to_string(), CanonicalValue::Int(self.block_number as i64));
        m.insert("prev_hash".to_string(), CanonicalValue::Str(hex::encode(self.prev_hash)));
        m.insert("state_hash".to_string(), CanonicalValue::Str(hex::encode(self.state_hash)));
        m.insert("group_id".to_string(), CanonicalValue::Int(self.group_id as i64));
        m.insert("miner".to_string(), self.miner.to_canonical());
        m.insert("timestamp".to_string(), CanonicalValue::Int(self.timestamp as i64));
        CanonicalValue::Map(m)
    }
}

impl ToCanonical for SignatureBundle {
    fn to_canonical(&self) -> CanonicalValue {
        let mut m = BTreeMap::new();
        m.insert("signer".to_string(), self.signer.to_canonical());
        m.insert("state_hash".to_string(), CanonicalValue::Str(hex::encode(self.state_hash)));
        m.insert("signature".to_string(), CanonicalValue::Str(hex::encode(&self.signature)));
        CanonicalValue::Map(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::address::Address;

    #[test]
    fn map_key_ordering_is_stable_regardless_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("zebra".to_string(), CanonicalValue::Int(1));
        a.insert("apple".to_string(), CanonicalValue::Int(2));
        let mut b = BTreeMap::new();
        b.insert("apple".to_string(), CanonicalValue::Int(2));
        b.insert("zebra".to_string(), CanonicalValue::Int(1));
        assert_eq!(encode(&CanonicalValue::Map(a)), encode(&CanonicalValue::Map(b)));
    }

    #[test]
    fn equal_snapshots_encode_identically() {
        let addr = Address::parse("0123456789abcdef").unwrap();
        let mut u1 = User::new(addr.clone());
        u1.balance = MicroAmount::from_whole(10);
        let snap1 = StateSnapshot {
            users: BTreeMap::from([(addr.clone(), u1.clone())]),
            miner_pool: BTreeMap::new(),
            current_group: Group::genesis(),
            tx_executed: BTreeMap::new(),
        };
        let snap2 = snap1.clone();
        assert_eq!(canonical_hash(&snap1), canonical_hash(&snap2));
    }

    #[test]
    fn different_values_hash_differently() {
        let addr = Address::parse("0123456789abcdef").unwrap();
        let mut u1 = User::new(addr.clone());
        u1.balance = MicroAmount::from_whole(10);
        let mut u2 = u1.clone();
        u2.balance = MicroAmount::from_whole(11);
        let snap1 = StateSnapshot {
            users: BTreeMap::from([(addr.clone(), u1)]),
            miner_pool: BTreeMap::new(),
            current_group: Group::genesis(),
            tx_executed: BTreeMap::new(),
        };
        let snap2 = StateSnapshot {
            users: BTreeMap::from([(addr, u2)]),
            miner_pool: BTreeMap::new(),
            current_group: Group::genesis(),
            tx_executed: BTreeMap::new(),
        };
        assert_ne!(canonical_hash(&snap1), canonical_hash(&snap2));
    }

    #[test]
    fn no_superfluous_zero_padding_in_integers() {
        let v = CanonicalValue::Int(42);
        let bytes = encode(&v);
        // tag + 8-byte length + ascii "42"
        assert_eq!(&bytes[9..], b"42");
    }

    #[test]
    fn decode_reverses_encode() {
        let mut m = BTreeMap::new();
        m.insert("name".to_string(), CanonicalValue::Str("alice".to_string()));
        m.insert("age".to_string(), CanonicalValue::Int(30));
        m.insert(
            "balance".to_string(),
            CanonicalValue::Decimal(MicroAmount::from_decimal_str("1.250000").unwrap()),
        );
        m.insert(
            "tags".to_string(),
            CanonicalValue::Array(vec![CanonicalValue::Bool(true), CanonicalValue::Null]),
        );
        let original = CanonicalValue::Map(m);
        let bytes = encode(&original);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = encode(&CanonicalValue::Int(1));
        bytes.push(0xff);
        assert!(decode(&bytes).is_err());
    }
}
