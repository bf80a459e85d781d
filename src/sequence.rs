/// Call sequences: the unit of mutation, replay and corpus storage
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{keccak, EVMAddress, EVMU256};

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("sequence encoding failed: {0}")]
    Encode(serde_cbor::Error),
    #[error("sequence decoding failed: {0}")]
    Decode(serde_cbor::Error),
}

/// One externally observable invocation against the test chain, in legacy
/// transaction shape. The sender is an index into the campaign's account
/// set; replay resolves the key. `to == None` is contract creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub sender: u32,
    pub to: Option<EVMAddress>,
    pub value: EVMU256,
    pub gas: u64,
    pub gas_price: EVMU256,
    /// carried for the legacy encoding; replay resolves the live nonce
    pub nonce: u64,
    pub data: Vec<u8>,
    /// blocks to advance before this call
    pub block_delay: u32,
    /// seconds to advance before this call
    pub time_delay: u32,
}

impl Call {
    pub fn to_contract(sender: u32, to: EVMAddress, data: Vec<u8>) -> Self {
        Self {
            sender,
            to: Some(to),
            value: EVMU256::ZERO,
            gas: 12_000_000,
            gas_price: EVMU256::ZERO,
            nonce: 0,
            data,
            block_delay: 1,
            time_delay: 12,
        }
    }

    /// The 4-byte method selector, if the payload carries one.
    pub fn selector(&self) -> Option<[u8; 4]> {
        if self.data.len() < 4 {
            return None;
        }
        let mut sel = [0u8; 4];
        sel.copy_from_slice(&self.data[..4]);
        Some(sel)
    }
}

/// Ordered list of calls with their block/time delays, so replay is
/// deterministic. The canonical binary encoding is the CBOR serialization;
/// the content digest is keccak256 over that encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSequence {
    pub calls: Vec<Call>,
}

impl CallSequence {
    pub fn new(calls: Vec<Call>) -> Self {
        Self { calls }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SequenceError> {
        serde_cbor::to_vec(self).map_err(SequenceError::Encode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SequenceError> {
        serde_cbor::from_slice(data).map_err(SequenceError::Decode)
    }

    pub fn digest(&self) -> Result<[u8; 32], SequenceError> {
        Ok(keccak(&self.to_bytes()?))
    }

    pub fn digest_hex(&self) -> Result<String, SequenceError> {
        Ok(hex::encode(self.digest()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixed_address;

    fn sample() -> CallSequence {
        CallSequence::new(vec![
            Call::to_contract(
                0,
                fixed_address("00000000000000000000000000000000000000aa"),
                vec![0xde, 0xad, 0xbe, 0xef, 0x01],
            ),
            Call {
                sender: 1,
                to: None,
                value: EVMU256::from(5u64),
                gas: 30_000_000,
                gas_price: EVMU256::ZERO,
                nonce: 3,
                data: vec![0x60, 0x00],
                block_delay: 2,
                time_delay: 60,
            },
        ])
    }

    #[test]
    fn test_roundtrip() {
        let seq = sample();
        let bytes = seq.to_bytes().unwrap();
        let decoded = CallSequence::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, seq);
    }

    #[test]
    fn test_digest_is_content_addressed() {
        let a = sample();
        let b = sample();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        let mut c = sample();
        c.calls[0].data[4] ^= 1;
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }

    #[test]
    fn test_selector() {
        let seq = sample();
        assert_eq!(seq.calls[0].selector(), Some([0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(seq.calls[1].selector(), None);
    }
}
