use std::sync::Arc;

use crate::transaction::{LockManager, LockObject, Transaction};

/// A lock released when the guard drops, used for read locks that do not
/// live until commit.
pub struct ShortLockGuard {
    manager: Arc<LockManager>,
    txn: Arc<Transaction>,
    object: LockObject,
    released: bool,
}

impl ShortLockGuard {
    pub fn new(manager: Arc<LockManager>, txn: Arc<Transaction>, object: LockObject) -> Self {
        Self {
            manager,
            txn,
            object,
            released: false,
        }
    }

    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.manager.unlock(&self.txn, &self.object);
            self.released = true;
        }
    }
}

impl Drop for ShortLockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Outcome of taking a read lock under the transaction's isolation level.
pub enum ReadLockGuard {
    /// No lock was needed.
    Unlocked,
    /// Released at the end of the read.
    Temporary(ShortLockGuard),
    /// Held until the transaction finishes.
    Retained,
}

impl ReadLockGuard {
    pub fn release(self) {
        if let ReadLockGuard::Temporary(guard) = self {
            guard.release();
        }
    }
}
