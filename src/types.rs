/// Common types shared across the fuzzer
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crypto::digest::Digest;
use crypto::sha2::Sha256;
use crypto::sha3::Sha3;
use revm::primitives::{B160, B256, U256};

pub type EVMAddress = B160;
pub type EVMU256 = U256;
pub type EVMHash = B256;

/// Monotone snapshot handle, scoped to a single chain replica.
pub type SnapshotId = u64;

/// keccak256 into a fixed 32-byte output
pub fn keccak(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3::keccak256();
    hasher.input(data);
    let mut out = [0u8; 32];
    hasher.result(&mut out);
    out
}

/// keccak256 of a function signature, used for ABI selectors
pub fn selector_of(signature: &str) -> [u8; 4] {
    let digest = keccak(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// sha256 hex digest, truncated; used to key the remote-state cache file
pub fn sha256_prefix(data: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.input_str(data);
    let hex = hasher.result_str();
    hex[..len.min(hex.len())].to_string()
}

/// Parse a fixed address from a hex string without 0x prefix.
pub fn fixed_address(s: &str) -> EVMAddress {
    let mut address = [0u8; 20];
    address.copy_from_slice(&hex::decode(s).expect("invalid fixed address literal"));
    B160(address)
}

pub fn u256_to_be(v: EVMU256) -> [u8; 32] {
    v.to_be_bytes::<32>()
}

/// Big-endian bytes to U256; slices longer than 32 bytes take the low words.
pub fn be_to_u256(bytes: &[u8]) -> EVMU256 {
    let start = bytes.len().saturating_sub(32);
    U256::try_from_be_slice(&bytes[start..]).unwrap_or(U256::ZERO)
}

pub fn h256_of(v: EVMU256) -> B256 {
    B256::from(v.to_be_bytes::<32>())
}

pub fn is_zero(v: EVMU256) -> bool {
    v == U256::ZERO
}

/// Cooperative shutdown token. Workers poll [`CancelToken::is_cancelled`]
/// between iterations; blocked threads park on [`CancelToken::wait_timeout`].
/// Cancellation is idempotent and never rescinded.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call transitioned the token to cancelled.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        if first {
            let _guard = self.lock.lock().expect("cancel token lock poisoned");
            self.cond.notify_all();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until cancellation or the timeout elapses. Returns
    /// `is_cancelled` at wakeup.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let guard = self.lock.lock().expect("cancel token lock poisoned");
        let (_guard, _result) = self
            .cond
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .expect("cancel token lock poisoned");
        self.is_cancelled()
    }
}
