/// Forked state provider: lets an empty chain behave as if it extends a
/// remote block by importing account state on first touch, with
/// snapshot-indexed invalidation.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::{RemoteStateCache, RemoteStateRecord};
use crate::rpc::{RpcClient, RpcError};
use crate::types::{be_to_u256, keccak, u256_to_be, CancelToken, EVMAddress, EVMU256, SnapshotId};
use revm::primitives::{AccountInfo, Bytecode, B256, KECCAK_EMPTY, U256};

#[derive(Debug, Error)]
pub enum ForkError {
    /// Internal invariant violation: the memory overlay must have served
    /// this account, importing again would clobber dirty state.
    #[error("account {0:?} is dirty and cannot be re-queried from the remote")]
    CannotQueryDirtyAccount(EVMAddress),
    #[error("slot {1} of {0:?} is dirty and cannot be re-queried from the remote")]
    CannotQueryDirtySlot(EVMAddress, EVMU256),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Default)]
struct ImportIndex {
    /// forward: what was imported, and under which snapshot
    accounts: HashMap<EVMAddress, SnapshotId>,
    slots: HashMap<(EVMAddress, EVMU256), SnapshotId>,
    /// reverse: which imports a revert past a snapshot must un-learn
    accounts_by_snapshot: BTreeMap<SnapshotId, HashSet<EVMAddress>>,
    slots_by_snapshot: BTreeMap<SnapshotId, HashSet<(EVMAddress, EVMU256)>>,
    /// locally written slots; re-import would overwrite dirty data
    written_slots: HashMap<(EVMAddress, EVMU256), SnapshotId>,
}

/// Imports remote state on first touch through cache → RPC, and un-learns
/// imports when the chain reverts past the snapshot that recorded them.
pub struct ForkedStateProvider {
    cache: Arc<RemoteStateCache>,
    client: Arc<RpcClient>,
    token: Arc<CancelToken>,
    index: RwLock<ImportIndex>,
    current_snapshot: AtomicU64,
}

impl ForkedStateProvider {
    pub fn new(
        cache: Arc<RemoteStateCache>,
        client: Arc<RpcClient>,
        token: Arc<CancelToken>,
    ) -> Self {
        Self {
            cache,
            client,
            token,
            index: RwLock::new(ImportIndex::default()),
            current_snapshot: AtomicU64::new(0),
        }
    }

    /// The chain advances this whenever the snapshot frontier moves, so
    /// imports are attributed to the snapshot they happened under.
    pub fn set_current_snapshot(&self, id: SnapshotId) {
        self.current_snapshot.store(id, Ordering::SeqCst);
    }

    pub fn current_snapshot(&self) -> SnapshotId {
        self.current_snapshot.load(Ordering::SeqCst)
    }

    pub fn import_account(
        &self,
        address: EVMAddress,
        snap_id: SnapshotId,
    ) -> Result<RemoteStateRecord, ForkError> {
        {
            let mut index = self.index.write().expect("fork index poisoned");
            if index.accounts.contains_key(&address) {
                return Err(ForkError::CannotQueryDirtyAccount(address));
            }
            index.accounts.insert(address, snap_id);
            index
                .accounts_by_snapshot
                .entry(snap_id)
                .or_default()
                .insert(address);
        }

        if let Some(record) = self.cache.get_account(address) {
            trace!("account {:?} served from state cache", address);
            return Ok(record);
        }
        let record = RemoteStateRecord {
            balance: self.client.get_balance(address, &self.token)?,
            nonce: self.client.get_nonce(address, &self.token)?,
            code: self.client.get_code(address, &self.token)?,
        };
        self.cache.put_account(address, record.clone());
        Ok(record)
    }

    pub fn import_slot(
        &self,
        address: EVMAddress,
        slot: EVMU256,
        snap_id: SnapshotId,
    ) -> Result<[u8; 32], ForkError> {
        {
            let mut index = self.index.write().expect("fork index poisoned");
            if index.written_slots.contains_key(&(address, slot))
                || index.slots.contains_key(&(address, slot))
            {
                return Err(ForkError::CannotQueryDirtySlot(address, slot));
            }
            index.slots.insert((address, slot), snap_id);
            index
                .slots_by_snapshot
                .entry(snap_id)
                .or_default()
                .insert((address, slot));
        }

        if let Some(value) = self.cache.get_slot(address, slot) {
            return Ok(value);
        }
        let value = self.client.get_storage_at(address, slot, &self.token)?;
        self.cache.put_slot(address, slot, value);
        Ok(value)
    }

    /// Record a locally written slot so it will never be re-imported over
    /// dirty data.
    pub fn mark_slot_written(&self, address: EVMAddress, slot: EVMU256, snap_id: SnapshotId) {
        let mut index = self.index.write().expect("fork index poisoned");
        index.written_slots.entry((address, slot)).or_insert(snap_id);
    }

    /// Un-learn every import and write mark recorded under a snapshot id
    /// strictly greater than `snap_id`: the chain state they described no
    /// longer exists.
    pub fn notify_reverted_to(&self, snap_id: SnapshotId) {
        let mut index = self.index.write().expect("fork index poisoned");
        let stale_accounts = index.accounts_by_snapshot.split_off(&(snap_id + 1));
        for address in stale_accounts.values().flatten() {
            index.accounts.remove(address);
        }
        let stale_slots = index.slots_by_snapshot.split_off(&(snap_id + 1));
        for key in stale_slots.values().flatten() {
            index.slots.remove(key);
        }
        index.written_slots.retain(|_, id| *id <= snap_id);
        debug!(
            "fork provider reverted to snapshot {}: dropped {} account / {} slot imports",
            snap_id,
            stale_accounts.values().map(|s| s.len()).sum::<usize>(),
            stale_slots.values().map(|s| s.len()).sum::<usize>(),
        );
    }

    pub fn is_account_imported(&self, address: EVMAddress) -> bool {
        self.index
            .read()
            .expect("fork index poisoned")
            .accounts
            .contains_key(&address)
    }

    pub fn is_slot_imported(&self, address: EVMAddress, slot: EVMU256) -> bool {
        self.index
            .read()
            .expect("fork index poisoned")
            .slots
            .contains_key(&(address, slot))
    }

    pub fn is_slot_written(&self, address: EVMAddress, slot: EVMU256) -> bool {
        self.index
            .read()
            .expect("fork index poisoned")
            .written_slots
            .contains_key(&(address, slot))
    }
}

/// The chain's external state source: either a forked provider pinned to a
/// remote block, or nothing (fresh local chain).
#[derive(Clone)]
pub enum ForkBackend {
    Forked(Arc<ForkedStateProvider>),
    Local,
}

impl ForkBackend {
    pub fn provider(&self) -> Option<&Arc<ForkedStateProvider>> {
        match self {
            ForkBackend::Forked(provider) => Some(provider),
            ForkBackend::Local => None,
        }
    }
}

impl revm::db::DatabaseRef for ForkBackend {
    type Error = ForkError;

    fn basic(&self, address: revm::primitives::B160) -> Result<Option<AccountInfo>, Self::Error> {
        match self {
            ForkBackend::Local => Ok(None),
            ForkBackend::Forked(provider) => {
                let record = provider.import_account(address, provider.current_snapshot())?;
                let code_hash = if record.code.is_empty() {
                    KECCAK_EMPTY
                } else {
                    B256::from(keccak(&record.code))
                };
                Ok(Some(AccountInfo {
                    balance: record.balance,
                    nonce: record.nonce,
                    code_hash,
                    code: Some(Bytecode::new_raw(Bytes::from(record.code))),
                }))
            }
        }
    }

    fn code_by_hash(&self, _code_hash: B256) -> Result<Bytecode, Self::Error> {
        // code travels embedded in the imported AccountInfo
        Ok(Bytecode::new())
    }

    fn storage(&self, address: revm::primitives::B160, index: U256) -> Result<U256, Self::Error> {
        match self {
            ForkBackend::Local => Ok(U256::ZERO),
            ForkBackend::Forked(provider) => {
                let value = provider.import_slot(address, index, provider.current_snapshot())?;
                Ok(be_to_u256(&value))
            }
        }
    }

    fn block_hash(&self, number: U256) -> Result<B256, Self::Error> {
        // deterministic placeholder; the real header chain is out of scope
        Ok(B256::from(keccak(&u256_to_be(number))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcTransport;
    use revm::primitives::B160;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        calls: AtomicUsize,
    }

    impl RpcTransport for CountingTransport {
        fn post(&self, body: &str) -> Result<String, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if body.contains("eth_getBalance") {
                "0x7b"
            } else if body.contains("eth_getTransactionCount") {
                "0x1"
            } else if body.contains("eth_getCode") {
                "0x"
            } else {
                "0x2a"
            };
            Ok(format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"{}\"}}",
                result
            ))
        }
    }

    fn build_provider(tag: &str) -> (Arc<ForkedStateProvider>, Arc<CountingTransport>, PathBuf) {
        let dir =
            std::env::temp_dir().join(format!("hydrafuzz-fork-{}-{}", tag, std::process::id()));
        let cache =
            Arc::new(RemoteStateCache::open(&dir, "http://stub", 1).unwrap());
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let client = Arc::new(RpcClient::new(
            transport.clone() as Arc<dyn RpcTransport>,
            1,
            0,
        ));
        let provider = Arc::new(ForkedStateProvider::new(
            cache,
            client,
            Arc::new(CancelToken::new()),
        ));
        (provider, transport, dir)
    }

    fn addr(byte: u8) -> EVMAddress {
        B160([byte; 20])
    }

    #[test]
    fn test_import_and_invalidation() {
        let (provider, _transport, dir) = build_provider("invalidate");
        let record = provider.import_account(addr(1), 3).unwrap();
        assert_eq!(record.balance, U256::from(123u64));
        assert!(provider.is_account_imported(addr(1)));

        // reverting to an older snapshot un-learns the import
        provider.notify_reverted_to(2);
        assert!(!provider.is_account_imported(addr(1)));
        assert!(provider.import_account(addr(1), 2).is_ok());

        // reverting to the same snapshot keeps it
        provider.notify_reverted_to(2);
        assert!(provider.is_account_imported(addr(1)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_dirty_account_reimport_fails() {
        let (provider, _transport, dir) = build_provider("dirty");
        provider.import_account(addr(2), 1).unwrap();
        assert!(matches!(
            provider.import_account(addr(2), 1),
            Err(ForkError::CannotQueryDirtyAccount(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_written_slot_is_not_reimported() {
        let (provider, _transport, dir) = build_provider("written");
        provider.mark_slot_written(addr(3), U256::from(7u64), 4);
        assert!(matches!(
            provider.import_slot(addr(3), U256::from(7u64), 4),
            Err(ForkError::CannotQueryDirtySlot(_, _))
        ));
        // reverting past the write clears the mark
        provider.notify_reverted_to(3);
        assert!(provider.import_slot(addr(3), U256::from(7u64), 4).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cache_short_circuits_rpc() {
        let (provider, transport, dir) = build_provider("cached");
        provider.import_slot(addr(4), U256::from(1u64), 1).unwrap();
        let calls_after_first = transport.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_first, 1);

        provider.notify_reverted_to(0);
        provider.import_slot(addr(4), U256::from(1u64), 1).unwrap();
        // second import is a cache hit, no new outbound request
        assert_eq!(transport.calls.load(Ordering::SeqCst), calls_after_first);
        std::fs::remove_dir_all(&dir).ok();
    }
}
