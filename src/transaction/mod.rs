mod deadlock;
mod lock_guard;
mod lock_manager;
mod transaction;
mod transaction_manager;
mod txn_context;

pub use deadlock::{DeadlockDetector, DeadlockReport, WaitForGraph};
pub use lock_guard::{ReadLockGuard, ShortLockGuard};
pub use lock_manager::{compatible, dominates, supremum, BlockingEdge, LockManager, LockMode, LockObject};
pub use transaction::{IsolationLevel, Transaction, TransactionId, TransactionState, INVALID_TXN_ID};
pub use transaction_manager::TransactionManager;
pub(crate) use transaction_manager::{undo_chain, undo_record};
pub use txn_context::TxnContext;
