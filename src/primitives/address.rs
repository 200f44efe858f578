use serde::{Deserialize, Serialize};
use std::fmt;

/// A 16-lowercase-hex-character identifier. Ordering is derived so that
/// `BTreeMap<Address, _>` iterates in ascending code-point order for free —
/// exactly the ordering the canonical codec needs for map keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must be exactly 16 characters, got {0}")]
    WrongLength(usize),
    #[error("address must be lowercase hex")]
    NotHex,
}

impl Address {
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if s.len() != 16 {
            return Err(AddressError::WrongLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(AddressError::NotHex);
        }
        Ok(Address(s.to_string()))
    }

    /// Builds an address from an arbitrary 8-byte seed, used by tests and by
    /// the genesis/mock wallet paths that don't go through a real oracle.
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Address(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub const GENESIS_MINER: &'static str = "GENESIS";

    /// The sentinel miner address recorded on block 0. It intentionally
    /// does not satisfy the 16-hex-char invariant `parse` enforces — it is
    /// never looked up in the users map and never signs anything.
    pub fn genesis_miner() -> Self {
        Address(Self::GENESIS_MINER.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A fixed-point amount counting millionths (6 fractional decimal digits).
/// Arithmetic never panics: overflow/underflow is surfaced via the
/// `checked_*` combinators so a caller can reject the operation instead of
/// corrupting a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MicroAmount(pub u64);

impl MicroAmount {
    pub const ZERO: MicroAmount = MicroAmount(0);
    const SCALE: u64 = 1_000_000;

    pub fn from_whole(whole: u64) -> Self {
        MicroAmount(whole * Self::SCALE)
    }

    /// Parses a decimal string with up to 6 fractional digits, e.g. "10.5".
    pub fn from_decimal_str(s: &str) -> Option<Self> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        let int_val: u64 = int_part.parse().ok()?;
        if frac_part.len() > 6 {
            return None;
        }
        let mut frac_val: u64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().ok()?
        };
        for _ in frac_part.len()..6 {
            frac_val *= 10;
        }
        Some(MicroAmount(int_val.checked_mul(Self::SCALE)?.checked_add(frac_val)?))
    }

    pub fn checked_add(self, other: MicroAmount) -> Option<MicroAmount> {
        self.0.checked_add(other.0).map(MicroAmount)
    }

    pub fn checked_sub(self, other: MicroAmount) -> Option<MicroAmount> {
        self.0.checked_sub(other.0).map(MicroAmount)
    }

    /// Canonical decimal string: integer part, '.', exactly 6 fractional
    /// digits, no superfluous trailing padding beyond the documented
    /// fixed-precision form.
    pub fn to_canonical_string(self) -> String {
        format!("{}.{:06}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

impl fmt::Display for MicroAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}
