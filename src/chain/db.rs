/// State database of one chain replica: a revm memory overlay over the
/// fork backend. Snapshots clone the whole overlay.
use bytes::Bytes;

use crate::fork::{ForkBackend, ForkError};
use crate::types::{keccak, EVMAddress, EVMU256};
use revm::db::CacheDB;
use revm::primitives::{Bytecode, B256, KECCAK_EMPTY};
use revm::Database;

pub type ChainDb = CacheDB<ForkBackend>;

pub fn fresh(backend: ForkBackend) -> ChainDb {
    CacheDB::new(backend)
}

pub fn set_balance(
    db: &mut ChainDb,
    address: EVMAddress,
    amount: EVMU256,
) -> Result<(), ForkError> {
    let account = db.load_account(address)?;
    account.info.balance = amount;
    Ok(())
}

pub fn set_code(db: &mut ChainDb, address: EVMAddress, code: Vec<u8>) -> Result<(), ForkError> {
    let code_hash = if code.is_empty() {
        KECCAK_EMPTY
    } else {
        B256::from(keccak(&code))
    };
    let bytecode = Bytecode::new_raw(Bytes::from(code));
    let account = db.load_account(address)?;
    account.info.code_hash = code_hash;
    account.info.code = Some(bytecode.clone());
    db.contracts.insert(code_hash, bytecode);
    Ok(())
}

pub fn set_storage(
    db: &mut ChainDb,
    address: EVMAddress,
    slot: EVMU256,
    value: EVMU256,
) -> Result<(), ForkError> {
    db.insert_account_storage(address, slot, value)
}

pub fn read_storage(
    db: &mut ChainDb,
    address: EVMAddress,
    slot: EVMU256,
) -> Result<EVMU256, ForkError> {
    Database::storage(db, address, slot)
}

/// Rough entry count used for the worker recycle limit: accounts, their
/// storage slots, and cached contract codes.
pub fn entry_count(db: &ChainDb) -> usize {
    db.accounts.len()
        + db.accounts.values().map(|a| a.storage.len()).sum::<usize>()
        + db.contracts.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use revm::primitives::B160;

    #[test]
    fn test_balance_and_storage_helpers() {
        let mut db = fresh(ForkBackend::Local);
        let address = B160([5u8; 20]);
        set_balance(&mut db, address, EVMU256::from(1000u64)).unwrap();
        set_storage(&mut db, address, EVMU256::from(1u64), EVMU256::from(42u64)).unwrap();
        assert_eq!(
            read_storage(&mut db, address, EVMU256::from(1u64)).unwrap(),
            EVMU256::from(42u64)
        );
        assert_eq!(
            read_storage(&mut db, address, EVMU256::from(2u64)).unwrap(),
            EVMU256::ZERO
        );
        assert!(entry_count(&db) >= 2);
    }

    #[test]
    fn test_set_code_registers_contract() {
        let mut db = fresh(ForkBackend::Local);
        let address = B160([6u8; 20]);
        set_code(&mut db, address, vec![0x60, 0x01, 0x00]).unwrap();
        let info = Database::basic(&mut db, address).unwrap().unwrap();
        assert_ne!(info.code_hash, KECCAK_EMPTY);
        assert!(db.contracts.contains_key(&info.code_hash));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut db = fresh(ForkBackend::Local);
        let address = B160([7u8; 20]);
        set_storage(&mut db, address, EVMU256::from(0u64), EVMU256::from(1u64)).unwrap();
        let mut snapshot = db.clone();
        set_storage(&mut db, address, EVMU256::from(0u64), EVMU256::from(9u64)).unwrap();
        assert_eq!(
            read_storage(&mut snapshot, address, EVMU256::from(0u64)).unwrap(),
            EVMU256::from(1u64)
        );
    }
}
