//! Wallet oracle: the consensus core treats signing as an opaque contract
//! so a real scheme (Ed25519, a PQ signature, whatever the deployment
//! chooses) can be dropped in without touching CO, VA, or GT. Production
//! code supplies its own `SignatureOracle`; tests use `MockOracle`, whose
//! behavior is fixed by the contract: `sig == H(state_hash || private_key)`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codec::sha256;
use crate::primitives::Address;

pub trait SignatureOracle {
    fn sign(&self, private_key: &[u8], state_hash_hex: &str) -> Vec<u8>;
    fn verify(&self, address: &Address, state_hash_hex: &str, signature: &[u8]) -> bool;
    fn address_of(&self, private_key: &[u8]) -> Address;
}

/// Deterministic stand-in for tests and local development. A single
/// process-wide registry maps addresses to the private key bytes they were
/// derived from, which is how `verify` can check a signature given only an
/// address — a real oracle would do this with public-key cryptography, the
/// mock does it by remembering the key itself.
#[derive(Default)]
pub struct MockOracle {
    registry: Mutex<HashMap<Address, Vec<u8>>>,
}

impl MockOracle {
    pub fn new() -> Self {
        MockOracle::default()
    }
}

impl SignatureOracle for MockOracle {
    fn sign(&self, private_key: &[u8], state_hash_hex: &str) -> Vec<u8> {
        let address = self.address_of(private_key);
        self.registry.lock().unwrap().entry(address).or_insert_with(|| private_key.to_vec());
        mock_signature(private_key, state_hash_hex)
    }

    fn verify(&self, address: &Address, state_hash_hex: &str, signature: &[u8]) -> bool {
        let registry = self.registry.lock().unwrap();
        match registry.get(address) {
            Some(private_key) => signature == mock_signature(private_key, state_hash_hex),
            None => false,
        }
    }

    fn address_of(&self, private_key: &[u8]) -> Address {
        let digest = sha256(private_key);
        Address::from_bytes(&digest[0..8].try_into().unwrap())
    }
}

fn mock_signature(private_key: &[u8], state_hash_hex: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(state_hash_hex.len() + private_key.len());
    buf.extend_from_slice(state_hash_hex.as_bytes());
    buf.extend_from_slice(private_key);
    sha256(&buf).to_vec()
}
