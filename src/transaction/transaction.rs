use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{QuillStoreError, QuillStoreResult};
use crate::recovery::wal_record::{LogBody, PageAction};
use crate::recovery::{Lsn, WalManager, INVALID_LSN};
use crate::transaction::lock_manager::{dominates, BlockingEdge, LockMode, LockObject};

pub type TransactionId = u64;
pub const INVALID_TXN_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read-uncommitted",
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        }
    }

    /// Whether read locks outlive the read that took them.
    pub fn holds_read_locks(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-uncommitted" | "ru" => Ok(IsolationLevel::ReadUncommitted),
            "read-committed" | "rc" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" | "rr" => Ok(IsolationLevel::RepeatableRead),
            "serializable" | "sr" | "serial" => Ok(IsolationLevel::Serializable),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Running => "running",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        }
    }
}

#[derive(Debug)]
struct TxnLog {
    state: TransactionState,
    first_lsn: Lsn,
    last_lsn: Lsn,
}

/// A transaction shared between its session, the lock manager and the
/// deadlock detector. Every piece of mutable state sits behind its own guard so
/// the detector can snapshot blocking edges without stopping the world.
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    lock_depth: u8,
    wal: Arc<WalManager>,
    log: Mutex<TxnLog>,
    held_locks: Mutex<HashMap<LockObject, LockMode>>,
    blocking: Mutex<Vec<BlockingEdge>>,
    abort_requested: AtomicBool,
    cleanup: Mutex<Vec<Box<dyn Send>>>,
    // serializes commit and rollback so that finishing twice is harmless
    finish: Mutex<()>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state())
            .field("last_lsn", &self.last_lsn())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        isolation_level: IsolationLevel,
        lock_depth: u8,
        wal: Arc<WalManager>,
    ) -> Self {
        Self {
            id,
            isolation_level,
            lock_depth,
            wal,
            log: Mutex::new(TxnLog {
                state: TransactionState::Running,
                first_lsn: INVALID_LSN,
                last_lsn: INVALID_LSN,
            }),
            held_locks: Mutex::new(HashMap::new()),
            blocking: Mutex::new(Vec::new()),
            abort_requested: AtomicBool::new(false),
            cleanup: Mutex::new(Vec::new()),
            finish: Mutex::new(()),
        }
    }

    /// Rebuilds a transaction found in the log during restart.
    pub(crate) fn recovered(
        id: TransactionId,
        first_lsn: Lsn,
        last_lsn: Lsn,
        wal: Arc<WalManager>,
    ) -> Self {
        let txn = Self::new(id, IsolationLevel::Serializable, 0, wal);
        {
            let mut log = txn.log.lock();
            log.first_lsn = first_lsn;
            log.last_lsn = last_lsn;
        }
        txn
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// 0 locks whole indexes, anything higher locks single keys.
    pub fn lock_depth(&self) -> u8 {
        self.lock_depth
    }

    pub fn state(&self) -> TransactionState {
        self.log.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == TransactionState::Running
    }

    pub fn first_lsn(&self) -> Lsn {
        self.log.lock().first_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.log.lock().last_lsn
    }

    /// Marker for a later partial rollback.
    pub fn savepoint(&self) -> Lsn {
        self.last_lsn()
    }

    pub fn ensure_running(&self) -> QuillStoreResult<()> {
        let state = self.state();
        if state != TransactionState::Running {
            return Err(QuillStoreError::Transaction(format!(
                "transaction {} is {}",
                self.id,
                state.as_str()
            )));
        }
        Ok(())
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    /// Appends `body` to the transaction's log chain.
    pub fn log(&self, body: &LogBody) -> QuillStoreResult<Lsn> {
        self.append(INVALID_LSN, body, true)
    }

    /// Logs a page change.
    pub fn log_page(&self, action: PageAction) -> QuillStoreResult<Lsn> {
        self.log(&LogBody::Page(action))
    }

    /// Logs one image of a structure change. Only the last image of the
    /// change carries `undo_next_lsn`, the position of the chain before the
    /// change; the others pass `INVALID_LSN`, so a change cut short is
    /// recognisable in the log.
    pub(crate) fn log_image(&self, action: PageAction, undo_next_lsn: Lsn) -> QuillStoreResult<Lsn> {
        self.append(undo_next_lsn, &LogBody::Page(action), true)
    }

    /// Logs a compensation record for `undone_lsn`. Undo resumes at
    /// `undo_next_lsn` if the CLR is the last record of the chain.
    pub(crate) fn log_clr(
        &self,
        undone_lsn: Lsn,
        undo_next_lsn: Lsn,
        action: PageAction,
    ) -> QuillStoreResult<Lsn> {
        self.append(undo_next_lsn, &LogBody::Clr { undone_lsn, action }, false)
    }

    /// Transaction-control records written while finishing.
    pub(crate) fn log_control(&self, body: &LogBody) -> QuillStoreResult<Lsn> {
        self.append(INVALID_LSN, body, false)
    }

    fn append(&self, undo_next_lsn: Lsn, body: &LogBody, check_state: bool) -> QuillStoreResult<Lsn> {
        let mut log = self.log.lock();
        if check_state && log.state != TransactionState::Running {
            return Err(QuillStoreError::Transaction(format!(
                "transaction {} is {}, no further logging",
                self.id,
                log.state.as_str()
            )));
        }
        let lsn = self.wal.append(self.id, log.last_lsn, undo_next_lsn, body)?;
        if log.first_lsn == INVALID_LSN {
            log.first_lsn = lsn;
        }
        log.last_lsn = lsn;
        Ok(lsn)
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        self.log.lock().state = state;
    }

    pub(crate) fn finish_guard(&self) -> MutexGuard<'_, ()> {
        self.finish.lock()
    }

    pub fn held_lock_count(&self) -> usize {
        self.held_locks.lock().len()
    }

    pub fn held_locks(&self) -> Vec<(LockObject, LockMode)> {
        self.held_locks
            .lock()
            .iter()
            .map(|(object, mode)| (object.clone(), *mode))
            .collect()
    }

    pub fn lock_mode(&self, object: &LockObject) -> Option<LockMode> {
        self.held_locks.lock().get(object).copied()
    }

    /// True when a lock at least as strong as `mode` is already held.
    pub fn holds(&self, object: &LockObject, mode: LockMode) -> bool {
        self.lock_mode(object)
            .map(|held| dominates(held, mode))
            .unwrap_or(false)
    }

    pub(crate) fn note_lock(&self, object: LockObject, mode: LockMode) {
        self.held_locks.lock().insert(object, mode);
    }

    pub(crate) fn forget_lock(&self, object: &LockObject) -> bool {
        self.held_locks.lock().remove(object).is_some()
    }

    pub fn blocking_edges(&self) -> Vec<BlockingEdge> {
        self.blocking.lock().clone()
    }

    pub(crate) fn set_blocking(&self, edges: Vec<BlockingEdge>) {
        *self.blocking.lock() = edges;
    }

    pub(crate) fn clear_blocking(&self) {
        self.blocking.lock().clear();
    }

    /// Keeps `guard` alive until the transaction finishes.
    pub fn add_cleanup(&self, guard: Box<dyn Send>) {
        self.cleanup.lock().push(guard);
    }

    pub(crate) fn run_cleanup(&self) {
        let guards = std::mem::take(&mut *self.cleanup.lock());
        drop(guards);
    }
}
