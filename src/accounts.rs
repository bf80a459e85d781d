/// Pre-funded EOAs used as transaction senders
use k256::ecdsa::SigningKey;
use rand::rngs::StdRng;
use thiserror::Error;

use crate::types::{keccak, EVMAddress};
use revm::primitives::B160;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("invalid private key hex: {0}")]
    InvalidHex(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("at least one sender account must be configured")]
    NoAccounts,
}

/// An EOA consisting of a secp256k1 private key and its derived address.
/// Accounts are created once per campaign and shared read-only by workers.
#[derive(Debug, Clone)]
pub struct FuzzerAccount {
    pub key: [u8; 32],
    pub address: EVMAddress,
}

impl FuzzerAccount {
    pub fn from_key_bytes(key: [u8; 32]) -> Result<Self, AccountError> {
        let signing = SigningKey::from_slice(&key)
            .map_err(|e| AccountError::InvalidKey(e.to_string()))?;
        let point = signing.verifying_key().to_encoded_point(false);
        // drop the 0x04 uncompressed prefix, keccak, take the low 20 bytes
        let digest = keccak(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        Ok(Self {
            key,
            address: B160(address),
        })
    }

    pub fn from_hex(s: &str) -> Result<Self, AccountError> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| AccountError::InvalidHex(e.to_string()))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|_| AccountError::InvalidHex(format!("key {} is not 32 bytes", s)))?;
        Self::from_key_bytes(key)
    }

    pub fn generate(rng: &mut StdRng) -> Self {
        let signing = SigningKey::random(rng);
        let key: [u8; 32] = signing.to_bytes().into();
        Self::from_key_bytes(key).expect("freshly generated key is valid")
    }
}

/// Build the campaign's sender set: configured keys first, then freshly
/// generated ones. An empty result is a configuration error.
pub fn build_accounts(
    generate: u32,
    keys: &[String],
    rng: &mut StdRng,
) -> Result<Vec<FuzzerAccount>, AccountError> {
    let mut accounts = Vec::with_capacity(keys.len() + generate as usize);
    for key in keys {
        accounts.push(FuzzerAccount::from_hex(key)?);
    }
    for _ in 0..generate {
        accounts.push(FuzzerAccount::generate(rng));
    }
    if accounts.is_empty() {
        return Err(AccountError::NoAccounts);
    }
    Ok(accounts)
}
