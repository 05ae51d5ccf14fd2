use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, warn};

use crate::background::{spawn_periodic_worker, WorkerHandle, WorkerKind};
use crate::buffer::BufferManager;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::recovery::wal_record::{LogBody, LogRecord, PageAction};
use crate::recovery::{ImageGroup, Lsn, ResourceManager, WalManager, INVALID_LSN};
use crate::transaction::deadlock::{DeadlockDetector, DeadlockReport};
use crate::transaction::{IsolationLevel, LockManager, Transaction, TransactionId, TransactionState};

pub struct TransactionManager {
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    lock_manager: Arc<LockManager>,
    resources: Arc<dyn ResourceManager>,
    detector: DeadlockDetector,
    next_txn_id: AtomicU64,
    active: DashMap<TransactionId, Arc<Transaction>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txn_id", &self.next_txn_id)
            .field("active", &self.active.len())
            .finish()
    }
}

impl TransactionManager {
    /// `first_txn_id` must be above every id found in the log.
    pub fn new(
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
        lock_manager: Arc<LockManager>,
        resources: Arc<dyn ResourceManager>,
        first_txn_id: TransactionId,
    ) -> Self {
        Self {
            wal,
            buffers,
            detector: DeadlockDetector::new(lock_manager.clone()),
            lock_manager,
            resources,
            next_txn_id: AtomicU64::new(first_txn_id.max(1)),
            active: DashMap::new(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    /// Id the next `begin` will hand out.
    pub fn next_txn_id(&self) -> TransactionId {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    pub fn begin(&self, isolation_level: IsolationLevel, lock_depth: u8) -> QuillStoreResult<Arc<Transaction>> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        if txn_id == 0 {
            return Err(QuillStoreError::Internal(
                "Transaction ID wrapped around".to_string(),
            ));
        }
        let txn = Arc::new(Transaction::new(
            txn_id,
            isolation_level,
            lock_depth,
            self.wal.clone(),
        ));
        // registered before Begin is logged so a concurrent checkpoint never
        // misses a transaction whose first record precedes its redo point
        self.active.insert(txn_id, txn.clone());
        if let Err(err) = txn.log(&LogBody::Begin) {
            self.active.remove(&txn_id);
            return Err(err);
        }
        debug!("began txn {} ({})", txn_id, isolation_level.as_str());
        Ok(txn)
    }

    /// Forces the transaction's unlogged pages and its commit record, then
    /// marks it committed and releases its locks.
    pub fn commit(&self, txn: &Arc<Transaction>) -> QuillStoreResult<()> {
        let _finish = txn.finish_guard();
        txn.ensure_running()?;
        if txn.is_abort_requested() {
            return Err(QuillStoreError::Transaction(format!(
                "transaction {} is marked for abort",
                txn.id()
            )));
        }
        for buffer in self.buffers.get_buffers() {
            buffer.flush_assigned(txn.id())?;
        }
        let lsn = txn.log(&LogBody::Commit)?;
        self.wal.flush_until(lsn)?;
        txn.set_state(TransactionState::Committed);
        self.finish(txn);
        debug!("committed txn {} at lsn {}", txn.id(), lsn);
        Ok(())
    }

    /// Undoes the whole transaction. Rolling back a finished transaction is a
    /// no-op, so a victim racing an external cleanup is harmless.
    pub fn rollback(&self, txn: &Arc<Transaction>) -> QuillStoreResult<()> {
        let _finish = txn.finish_guard();
        if !txn.is_running() {
            return Ok(());
        }
        undo_chain(self.resources.as_ref(), &self.wal, txn, INVALID_LSN)?;
        for buffer in self.buffers.get_buffers() {
            buffer.release_assigned(txn.id());
        }
        txn.log_control(&LogBody::Abort)?;
        txn.log_control(&LogBody::End)?;
        txn.set_state(TransactionState::RolledBack);
        self.finish(txn);
        debug!("rolled back txn {}", txn.id());
        Ok(())
    }

    /// Partial rollback to a savepoint taken with `Transaction::savepoint`.
    /// The transaction stays running and keeps its locks.
    pub fn undo(&self, txn: &Arc<Transaction>, savepoint: Lsn) -> QuillStoreResult<()> {
        let _finish = txn.finish_guard();
        txn.ensure_running()?;
        undo_chain(self.resources.as_ref(), &self.wal, txn, savepoint)
    }

    /// Marks a transaction for abort and wakes it if it is waiting for a lock.
    pub fn kill(&self, txn_id: TransactionId) -> bool {
        let Some(txn) = self.get(txn_id) else {
            return false;
        };
        txn.request_abort();
        for edge in txn.blocking_edges() {
            self.lock_manager.wake(&edge.object);
        }
        true
    }

    fn finish(&self, txn: &Arc<Transaction>) {
        self.lock_manager.unlock_all(txn);
        self.active.remove(&txn.id());
        txn.run_cleanup();
    }

    pub fn get(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.active.get(&txn_id).map(|entry| entry.value().clone())
    }

    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut txns: Vec<_> = self
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        txns.sort_by_key(|txn| txn.id());
        txns
    }

    pub fn detect_deadlocks(&self) -> Vec<DeadlockReport> {
        self.detector.detect(&self.active_transactions())
    }

    pub fn start_deadlock_detector(self: &Arc<Self>, interval: Duration) -> Option<WorkerHandle> {
        if interval.is_zero() {
            return None;
        }
        let manager = Arc::downgrade(self);
        spawn_periodic_worker(
            "deadlock-detector",
            WorkerKind::DeadlockDetector,
            interval,
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.detect_deadlocks();
                }
            },
        )
    }
}

/// Walks `txn`'s chain backward from its last record, undoing page changes
/// with CLRs, until the chain passes `stop`.
pub(crate) fn undo_chain(
    resources: &dyn ResourceManager,
    wal: &WalManager,
    txn: &Transaction,
    stop: Lsn,
) -> QuillStoreResult<()> {
    let mut cursor = txn.last_lsn();
    while cursor != INVALID_LSN && cursor > stop {
        let record = wal.read_record(cursor)?;
        cursor = undo_record(resources, wal, txn, &record)?;
    }
    Ok(())
}

/// Undoes one record and returns the next LSN of the chain to visit.
/// The page images of a structure change are undone together, and the chain
/// continues below the change.
pub(crate) fn undo_record(
    resources: &dyn ResourceManager,
    wal: &WalManager,
    txn: &Transaction,
    record: &LogRecord,
) -> QuillStoreResult<Lsn> {
    if record.txn_id != txn.id() {
        return Err(QuillStoreError::Wal(format!(
            "record {} belongs to txn {}, not {}",
            record.lsn,
            record.txn_id,
            txn.id()
        )));
    }
    Ok(match &record.body {
        LogBody::Page(PageAction::PageImage { .. }) => {
            let group = ImageGroup::read(wal, record.clone())?;
            if !resources.undo_images(txn, &group)? {
                debug!(
                    "txn {} left the structure change at lsn {} in place",
                    txn.id(),
                    group.newest_lsn()
                );
            }
            group.resume
        }
        LogBody::Page(_) => {
            resources.undo(txn, record)?;
            record.prev_lsn
        }
        LogBody::Clr { .. } => record.undo_next_lsn,
        LogBody::Begin => INVALID_LSN,
        LogBody::Commit | LogBody::Abort | LogBody::End | LogBody::Checkpoint(_) => {
            warn!(
                "unexpected {:?} record {} in undo chain of txn {}",
                record.body.kind(),
                record.lsn,
                txn.id()
            );
            record.prev_lsn
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageId;
    use crate::config::{BufferPoolConfig, LockConfig, WalConfig};
    use crate::recovery::wal_record::PageAction;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingResources {
        undone: Mutex<Vec<Lsn>>,
        groups: Mutex<Vec<(Vec<Lsn>, bool)>>,
    }

    impl ResourceManager for RecordingResources {
        fn redo(&self, _record: &LogRecord) -> QuillStoreResult<bool> {
            Ok(false)
        }

        fn undo(&self, txn: &Transaction, record: &LogRecord) -> QuillStoreResult<()> {
            self.undone.lock().push(record.lsn);
            let LogBody::Page(action) = &record.body else {
                unreachable!()
            };
            txn.log_clr(record.lsn, record.prev_lsn, action.clone())?;
            Ok(())
        }

        fn undo_images(&self, txn: &Transaction, group: &ImageGroup) -> QuillStoreResult<bool> {
            let lsns = group.records.iter().map(|record| record.lsn).collect();
            self.groups.lock().push((lsns, group.complete));
            let last = group.records.len() - 1;
            for (i, record) in group.records.iter().enumerate() {
                let undo_next = if i == last {
                    group.resume
                } else {
                    group.newest_lsn()
                };
                txn.log_clr(record.lsn, undo_next, image(0))?;
            }
            Ok(true)
        }
    }

    struct Fixture {
        _dir: TempDir,
        wal: Arc<WalManager>,
        resources: Arc<RecordingResources>,
        manager: Arc<TransactionManager>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(
            WalManager::open(
                dir.path(),
                WalConfig {
                    writer_interval: None,
                    ..WalConfig::default()
                },
            )
            .unwrap(),
        );
        let buffers = Arc::new(BufferManager::new(
            dir.path(),
            BufferPoolConfig::default(),
            Some(wal.clone()),
        ));
        buffers.start().unwrap();
        let resources = Arc::new(RecordingResources::default());
        let manager = Arc::new(TransactionManager::new(
            wal.clone(),
            buffers,
            Arc::new(LockManager::new(LockConfig::default())),
            resources.clone(),
            1,
        ));
        Fixture {
            _dir: dir,
            wal,
            resources,
            manager,
        }
    }

    fn image(page: u32) -> PageAction {
        PageAction::PageImage {
            page: PageId::new(2, page),
            before: vec![0; 4],
            after: vec![1; 4],
        }
    }

    fn insert(slot: u16) -> PageAction {
        PageAction::LeafInsert {
            index: PageId::new(2, 0),
            page: PageId::new(2, 1),
            slot,
            key: vec![slot as u8],
            value: vec![1],
        }
    }

    #[test]
    fn commit_forces_log_and_is_final() {
        let f = fixture();
        let txn = f.manager.begin(IsolationLevel::RepeatableRead, 1).unwrap();
        txn.log_page(insert(1)).unwrap();
        f.manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(f.wal.durable_lsn() > txn.last_lsn());
        assert!(f.manager.get(txn.id()).is_none());
        assert!(matches!(
            f.manager.commit(&txn),
            Err(QuillStoreError::Transaction(_))
        ));
        // rollback after commit sees a terminal state and does nothing
        f.manager.rollback(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn rollback_undoes_in_reverse_and_is_idempotent() {
        let f = fixture();
        let txn = f.manager.begin(IsolationLevel::RepeatableRead, 1).unwrap();
        let a = txn.log_page(insert(1)).unwrap();
        let b = txn.log_page(insert(2)).unwrap();
        f.manager.rollback(&txn).unwrap();
        f.manager.rollback(&txn).unwrap();
        assert_eq!(*f.resources.undone.lock(), vec![b, a]);
        assert_eq!(txn.state(), TransactionState::RolledBack);
        let last = f.wal.read_record(txn.last_lsn()).unwrap();
        assert_eq!(last.body, LogBody::End);
    }

    #[test]
    fn savepoint_undo_keeps_transaction_running() {
        let f = fixture();
        let txn = f.manager.begin(IsolationLevel::RepeatableRead, 1).unwrap();
        let kept = txn.log_page(insert(1)).unwrap();
        let savepoint = txn.savepoint();
        let dropped = txn.log_page(insert(2)).unwrap();
        f.manager.undo(&txn, savepoint).unwrap();
        assert_eq!(*f.resources.undone.lock(), vec![dropped]);
        assert!(txn.is_running());

        // the CLR chain skips the already undone record
        f.manager.rollback(&txn).unwrap();
        assert_eq!(*f.resources.undone.lock(), vec![dropped, kept]);
    }

    #[test]
    fn killed_transactions_cannot_commit() {
        let f = fixture();
        let txn = f.manager.begin(IsolationLevel::ReadCommitted, 1).unwrap();
        assert!(f.manager.kill(txn.id()));
        assert!(f.manager.commit(&txn).is_err());
        f.manager.rollback(&txn).unwrap();
        assert!(!f.manager.kill(txn.id()));
    }

    #[test]
    fn structure_changes_are_undone_as_units() {
        let f = fixture();
        let txn = f.manager.begin(IsolationLevel::RepeatableRead, 1).unwrap();
        let leaf = txn.log_page(insert(1)).unwrap();
        let start = txn.last_lsn();
        let split: Vec<Lsn> = vec![
            txn.log_image(image(1), INVALID_LSN).unwrap(),
            txn.log_image(image(2), INVALID_LSN).unwrap(),
            txn.log_image(image(3), start).unwrap(),
        ];
        // cut short before its last image
        let torn: Vec<Lsn> = vec![
            txn.log_image(image(4), INVALID_LSN).unwrap(),
            txn.log_image(image(5), INVALID_LSN).unwrap(),
        ];
        f.manager.rollback(&txn).unwrap();

        let expected: Vec<(Vec<Lsn>, bool)> = vec![
            (torn.iter().rev().copied().collect(), false),
            (split.iter().rev().copied().collect(), true),
        ];
        assert_eq!(*f.resources.groups.lock(), expected);
        assert_eq!(*f.resources.undone.lock(), vec![leaf]);
        assert_eq!(txn.state(), TransactionState::RolledBack);
    }
}
