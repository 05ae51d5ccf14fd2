use std::sync::Arc;

use crate::buffer::PageId;
use crate::error::QuillStoreResult;
use crate::recovery::wal_record::PageAction;
use crate::recovery::Lsn;
use crate::transaction::{
    IsolationLevel, LockManager, LockMode, LockObject, ReadLockGuard, ShortLockGuard, Transaction,
    TransactionId, TransactionManager,
};

/// A transaction together with the manager it belongs to. Index operations
/// take one of these and derive their lock protocol from the transaction's
/// isolation level and lock depth.
#[derive(derive_new::new, Clone)]
pub struct TxnContext {
    manager: Arc<TransactionManager>,
    txn: Arc<Transaction>,
}

impl TxnContext {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.manager.lock_manager()
    }

    pub fn txn_id(&self) -> TransactionId {
        self.txn.id()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.txn.isolation_level()
    }

    pub fn ensure_running(&self) -> QuillStoreResult<()> {
        self.txn.ensure_running()
    }

    pub fn log_page(&self, action: PageAction) -> QuillStoreResult<Lsn> {
        self.txn.log_page(action)
    }

    fn lock(&self, object: LockObject, mode: LockMode) -> QuillStoreResult<()> {
        self.lock_manager().lock(&self.txn, object, mode)
    }

    /// Takes `mode` on `object` for the length of one read unless the
    /// isolation level keeps read locks, or the lock was already held.
    fn read_lock(&self, object: LockObject, mode: LockMode) -> QuillStoreResult<ReadLockGuard> {
        let already_held = self.txn.lock_mode(&object).is_some();
        self.lock(object.clone(), mode)?;
        if already_held || self.isolation_level().holds_read_locks() {
            Ok(ReadLockGuard::Retained)
        } else {
            Ok(ReadLockGuard::Temporary(ShortLockGuard::new(
                self.lock_manager().clone(),
                self.txn.clone(),
                object,
            )))
        }
    }

    /// Read lock for a point lookup of `key`.
    pub fn lock_key_read(&self, index: PageId, key: &[u8]) -> QuillStoreResult<ReadLockGuard> {
        self.ensure_running()?;
        if self.isolation_level() == IsolationLevel::ReadUncommitted {
            return Ok(ReadLockGuard::Unlocked);
        }
        if self.txn.lock_depth() == 0 {
            return self.read_lock(LockObject::Index(index), LockMode::Shared);
        }
        self.lock(LockObject::Index(index), LockMode::IntentionShared)?;
        self.read_lock(LockObject::Key(index, key.to_vec()), LockMode::Shared)
    }

    /// Lock taken before a range scan. Serializable scans lock the whole
    /// index so no phantom can appear; other levels lock keys as they go.
    pub fn lock_scan(&self, index: PageId) -> QuillStoreResult<ReadLockGuard> {
        self.ensure_running()?;
        match self.isolation_level() {
            IsolationLevel::ReadUncommitted => Ok(ReadLockGuard::Unlocked),
            IsolationLevel::Serializable => {
                self.read_lock(LockObject::Index(index), LockMode::Shared)
            }
            _ if self.txn.lock_depth() == 0 => {
                self.read_lock(LockObject::Index(index), LockMode::Shared)
            }
            _ => {
                self.lock(LockObject::Index(index), LockMode::IntentionShared)?;
                Ok(ReadLockGuard::Retained)
            }
        }
    }

    /// Whether a scan still has to lock each key it returns.
    pub fn scan_locks_keys(&self, index: PageId) -> bool {
        if self.isolation_level() == IsolationLevel::ReadUncommitted {
            return false;
        }
        !self
            .txn
            .holds(&LockObject::Index(index), LockMode::Shared)
    }

    /// Locks taken by every mutation of `key`: the key exclusively under an
    /// intention lock on the index, or the whole index at lock depth 0.
    pub fn lock_key_write(&self, index: PageId, key: &[u8]) -> QuillStoreResult<()> {
        self.ensure_running()?;
        if self.txn.lock_depth() == 0 {
            return self.lock(LockObject::Index(index), LockMode::Exclusive);
        }
        self.lock(LockObject::Index(index), LockMode::IntentionExclusive)?;
        self.lock(LockObject::Key(index, key.to_vec()), LockMode::Exclusive)
    }

    /// Exclusive access to the whole index, used by bulk loads and by undo of
    /// page images.
    pub fn lock_index_exclusive(&self, index: PageId) -> QuillStoreResult<()> {
        self.ensure_running()?;
        self.lock(LockObject::Index(index), LockMode::Exclusive)
    }

    pub fn holds_index_exclusive(&self, index: PageId) -> bool {
        self.txn.holds(&LockObject::Index(index), LockMode::Exclusive)
    }
}
