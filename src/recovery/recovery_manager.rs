use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::buffer::BufferManager;
use crate::error::QuillStoreResult;
use crate::recovery::wal_record::{CheckpointBody, LogBody, LogRecord, PageAction};
use crate::recovery::{ControlFileManager, Lsn, ResourceManager, WalManager, FIRST_LSN, INVALID_LSN};
use crate::transaction::{
    undo_record, Transaction, TransactionId, TransactionManager, TransactionState, INVALID_TXN_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Running,
    /// Abort was logged, only End is missing.
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct TxnEntry {
    first_lsn: Lsn,
    last_lsn: Lsn,
    status: TxnStatus,
}

/// Transaction table rebuilt by the analysis pass.
#[derive(Debug, Default)]
struct Analysis {
    checkpoint_lsn: Option<Lsn>,
    redo_lsn: Lsn,
    table: BTreeMap<TransactionId, TxnEntry>,
    finished: HashSet<TransactionId>,
    next_txn_id: TransactionId,
    records: usize,
}

impl Analysis {
    fn observe(&mut self, record: &LogRecord) {
        self.records += 1;
        if let LogBody::Checkpoint(body) = &record.body {
            if Some(record.lsn) == self.checkpoint_lsn {
                self.merge_checkpoint(body);
            }
            return;
        }
        if record.txn_id == INVALID_TXN_ID {
            return;
        }
        self.next_txn_id = self.next_txn_id.max(record.txn_id + 1);
        match record.body {
            LogBody::Commit | LogBody::End => {
                self.table.remove(&record.txn_id);
                self.finished.insert(record.txn_id);
            }
            _ => {
                let entry = self.table.entry(record.txn_id).or_insert(TxnEntry {
                    first_lsn: record.lsn,
                    last_lsn: record.lsn,
                    status: TxnStatus::Running,
                });
                entry.last_lsn = record.lsn;
                if let LogBody::Abort = record.body {
                    entry.status = TxnStatus::Aborted;
                }
            }
        }
    }

    /// Transactions the checkpoint saw running, unless the scan already saw
    /// them finish.
    fn merge_checkpoint(&mut self, body: &CheckpointBody) {
        self.next_txn_id = self.next_txn_id.max(body.next_txn_id);
        for &(txn_id, last_lsn) in &body.active {
            if self.finished.contains(&txn_id) {
                continue;
            }
            self.next_txn_id = self.next_txn_id.max(txn_id + 1);
            let entry = self.table.entry(txn_id).or_insert(TxnEntry {
                first_lsn: INVALID_LSN,
                last_lsn,
                status: TxnStatus::Running,
            });
            entry.last_lsn = entry.last_lsn.max(last_lsn);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub checkpoint_lsn: Option<Lsn>,
    pub redo_lsn: Lsn,
    pub records_scanned: usize,
    pub redo_count: usize,
    pub loser_transactions: Vec<TransactionId>,
    /// First transaction id that is safe to hand out after restart.
    pub next_txn_id: TransactionId,
}

/// Restart recovery in three passes (analysis, redo, undo) plus fuzzy
/// checkpoints that bound how much of the log restart has to read.
pub struct RecoveryManager {
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    control: Arc<ControlFileManager>,
    resources: Arc<dyn ResourceManager>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("wal", &self.wal.path())
            .field("control", &self.control.snapshot())
            .finish()
    }
}

impl RecoveryManager {
    pub fn new(
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
        control: Arc<ControlFileManager>,
        resources: Arc<dyn ResourceManager>,
    ) -> Self {
        Self {
            wal,
            buffers,
            control,
            resources,
        }
    }

    pub fn recover(&self) -> QuillStoreResult<RecoverySummary> {
        let analysis = self.analyze()?;
        let redo_count = self.redo(analysis.redo_lsn)?;
        let losers = self.undo(&analysis)?;
        self.wal.flush()?;
        let summary = RecoverySummary {
            checkpoint_lsn: analysis.checkpoint_lsn,
            redo_lsn: analysis.redo_lsn,
            records_scanned: analysis.records,
            redo_count,
            loser_transactions: losers,
            next_txn_id: analysis.next_txn_id.max(1),
        };
        info!(
            "recovery scanned {} records from lsn {}, redid {}, rolled back {:?}",
            summary.records_scanned,
            summary.redo_lsn,
            summary.redo_count,
            summary.loser_transactions
        );
        Ok(summary)
    }

    fn last_checkpoint(&self) -> Option<(Lsn, CheckpointBody)> {
        let lsn = self.control.snapshot().last_checkpoint_lsn;
        if lsn == INVALID_LSN {
            return None;
        }
        match self.wal.read_record(lsn) {
            Ok(LogRecord {
                body: LogBody::Checkpoint(body),
                ..
            }) => Some((lsn, body)),
            Ok(record) => {
                warn!(
                    "control file points at lsn {}, which is a {:?} record; scanning the whole log",
                    lsn,
                    record.body.kind()
                );
                None
            }
            Err(err) => {
                warn!(
                    "checkpoint at lsn {} is unreadable ({}); scanning the whole log",
                    lsn, err
                );
                None
            }
        }
    }

    fn analyze(&self) -> QuillStoreResult<Analysis> {
        let mut analysis = Analysis::default();
        if let Some((lsn, body)) = self.last_checkpoint() {
            analysis.checkpoint_lsn = Some(lsn);
            analysis.redo_lsn = body.redo_lsn.min(lsn).max(FIRST_LSN);
        } else {
            analysis.redo_lsn = FIRST_LSN;
        }
        for record in self.wal.reader(analysis.redo_lsn)? {
            analysis.observe(&record?);
        }
        debug!(
            "analysis found {} unfinished transactions",
            analysis.table.len()
        );
        Ok(analysis)
    }

    /// Repeats history from `redo_lsn`, including the changes of transactions
    /// that are undone afterwards.
    fn redo(&self, redo_lsn: Lsn) -> QuillStoreResult<usize> {
        let mut applied = 0;
        for record in self.wal.reader(redo_lsn)? {
            let record = record?;
            if matches!(record.body, LogBody::Page(_) | LogBody::Clr { .. })
                && self.resources.redo(&record)?
            {
                applied += 1;
            }
        }
        Ok(applied)
    }

    fn undo(&self, analysis: &Analysis) -> QuillStoreResult<Vec<TransactionId>> {
        let mut losers = Vec::new();
        for (&txn_id, entry) in &analysis.table {
            let txn = Transaction::recovered(
                txn_id,
                entry.first_lsn,
                entry.last_lsn,
                self.wal.clone(),
            );
            if entry.status == TxnStatus::Aborted {
                txn.log_control(&LogBody::End)?;
                txn.set_state(TransactionState::RolledBack);
                continue;
            }
            losers.push(txn);
        }

        // structure changes cut short by the crash are taken back first, so
        // that logical undo always descends a well-formed tree
        for txn in &losers {
            self.undo_interrupted_images(txn)?;
        }

        let mut heap: BinaryHeap<(Lsn, usize)> = losers
            .iter()
            .enumerate()
            .map(|(i, txn)| (txn.last_lsn(), i))
            .filter(|(lsn, _)| *lsn != INVALID_LSN)
            .collect();
        while let Some((lsn, i)) = heap.pop() {
            let txn = &losers[i];
            let record = self.wal.read_record(lsn)?;
            let next = undo_record(self.resources.as_ref(), &self.wal, txn, &record)?;
            if next != INVALID_LSN {
                heap.push((next, i));
            }
        }

        let mut ids = Vec::with_capacity(losers.len());
        for txn in losers {
            txn.log_control(&LogBody::Abort)?;
            txn.log_control(&LogBody::End)?;
            txn.set_state(TransactionState::RolledBack);
            ids.push(txn.id());
        }
        Ok(ids)
    }

    /// Finishes a structure change, or the restore of one, that the crash
    /// cut short at the head of a loser's chain.
    fn undo_interrupted_images(&self, txn: &Transaction) -> QuillStoreResult<()> {
        let head = txn.last_lsn();
        if head == INVALID_LSN {
            return Ok(());
        }
        let record = self.wal.read_record(head)?;
        let cut_short = matches!(record.body, LogBody::Page(PageAction::PageImage { .. }))
            && record.undo_next_lsn == INVALID_LSN;
        // a restore CLR that is not the last of its group points back at the
        // group's newest image
        let restoring = matches!(
            &record.body,
            LogBody::Clr {
                undone_lsn,
                action: PageAction::PageImage { .. },
            } if *undone_lsn <= record.undo_next_lsn
        );
        let newest = if cut_short {
            record
        } else if restoring {
            self.wal.read_record(record.undo_next_lsn)?
        } else {
            return Ok(());
        };
        debug!(
            "txn {} has an interrupted structure change ending at lsn {}",
            txn.id(),
            newest.lsn
        );
        undo_record(self.resources.as_ref(), &self.wal, txn, &newest)?;
        Ok(())
    }

    /// Fuzzy checkpoint: running transactions and the oldest LSN a dirty
    /// page may still need.
    pub fn checkpoint(&self, txns: &TransactionManager) -> QuillStoreResult<Lsn> {
        let begin = self.wal.max_assigned_lsn();
        let active: Vec<(TransactionId, Lsn)> = txns
            .active_transactions()
            .iter()
            .map(|txn| (txn.id(), txn.last_lsn()))
            .collect();
        let redo_lsn = self
            .buffers
            .check_min_redo_lsn()
            .map_or(begin, |lsn| lsn.min(begin));
        let body = CheckpointBody {
            active,
            redo_lsn,
            next_txn_id: txns.next_txn_id(),
        };
        let lsn = self.wal.append(
            INVALID_TXN_ID,
            INVALID_LSN,
            INVALID_LSN,
            &LogBody::Checkpoint(body),
        )?;
        self.wal.flush_until(lsn)?;
        self.control.record_checkpoint(lsn)?;
        debug!("checkpoint at lsn {} (redo from {})", lsn, redo_lsn);
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{LatchMode, PageId, PAGE_LSN_LEN};
    use crate::config::{BufferPoolConfig, LockConfig, WalConfig};
    use crate::index::{BPlusTreeIndex, ComparatorRegistry, IndexOptions, LogMode};
    use crate::recovery::IndexResourceManager;
    use crate::transaction::{IsolationLevel, LockManager, TxnContext};
    use tempfile::TempDir;

    struct Engine {
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
        recovery: RecoveryManager,
        txns: Arc<TransactionManager>,
        summary: RecoverySummary,
    }

    fn open(dir: &TempDir) -> Engine {
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
        let config = BufferPoolConfig::default()
            .with_frames(64usize)
            .with_page_size(512usize);
        let buffers = Arc::new(BufferManager::new(dir.path(), config, Some(wal.clone())));
        buffers.start().unwrap();
        let control = Arc::new(ControlFileManager::load_or_init(dir.path(), 512).unwrap());
        let resources: Arc<dyn ResourceManager> = Arc::new(IndexResourceManager::new(
            buffers.clone(),
            ComparatorRegistry::default(),
        ));
        let recovery = RecoveryManager::new(wal.clone(), buffers.clone(), control, resources.clone());
        let summary = recovery.recover().unwrap();
        let txns = Arc::new(TransactionManager::new(
            wal.clone(),
            buffers.clone(),
            Arc::new(LockManager::new(LockConfig::default())),
            resources,
            summary.next_txn_id,
        ));
        Engine {
            wal,
            buffers,
            recovery,
            txns,
            summary,
        }
    }

    fn crash(engine: Engine) {
        engine.wal.flush().unwrap();
        engine.buffers.discard_all();
    }

    fn ctx(engine: &Engine) -> TxnContext {
        let txn = engine.txns.begin(IsolationLevel::RepeatableRead, 1).unwrap();
        TxnContext::new(engine.txns.clone(), txn)
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:04}", i).into_bytes()
    }

    fn open_index(engine: &Engine) -> BPlusTreeIndex {
        let buffer = match engine.buffers.get_buffer(2) {
            Ok(buffer) => buffer,
            Err(_) => engine.buffers.start_container(2).unwrap(),
        };
        BPlusTreeIndex::open(
            buffer,
            PageId::new(2, 1),
            &ComparatorRegistry::default(),
        )
        .unwrap()
    }

    #[test]
    fn committed_work_survives_and_losers_are_undone() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let buffer = engine.buffers.create_container(2).unwrap();
        let setup = ctx(&engine);
        let options = IndexOptions::default()
            .with_leaf_capacity(Some(4u16))
            .with_internal_capacity(Some(4u16));
        let index =
            BPlusTreeIndex::create(&setup, buffer, &ComparatorRegistry::default(), &options)
                .unwrap();
        for i in 0..40 {
            index.insert(&setup, &key(i), b"committed", LogMode::Logged).unwrap();
        }
        engine.txns.commit(setup.transaction()).unwrap();

        let loser = ctx(&engine);
        for i in 40..80 {
            index.insert(&loser, &key(i), b"lost", LogMode::Logged).unwrap();
        }
        for i in 0..10 {
            index.delete(&loser, &key(i), None, LogMode::Logged).unwrap();
        }
        let loser_id = loser.txn_id();
        drop(index);
        drop(loser);
        crash(engine);

        let engine = open(&dir);
        assert_eq!(engine.summary.loser_transactions, vec![loser_id]);
        assert!(engine.summary.redo_count > 0);
        assert!(engine.summary.next_txn_id > loser_id);

        let index = open_index(&engine);
        let stats = index.verify().unwrap();
        assert_eq!(stats.entries, 40);
        let reader = ctx(&engine);
        for i in 0..40 {
            assert_eq!(
                index.get(&reader, &key(i)).unwrap(),
                Some(b"committed".to_vec())
            );
        }
        assert_eq!(index.get(&reader, &key(50)).unwrap(), None);
        engine.txns.commit(reader.transaction()).unwrap();
    }

    #[test]
    fn restart_after_checkpoint_and_recovery_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let buffer = engine.buffers.create_container(2).unwrap();
        let setup = ctx(&engine);
        let index = BPlusTreeIndex::create(
            &setup,
            buffer,
            &ComparatorRegistry::default(),
            &IndexOptions::default(),
        )
        .unwrap();
        index.insert(&setup, b"a", b"1", LogMode::Logged).unwrap();
        engine.txns.commit(setup.transaction()).unwrap();

        let running = ctx(&engine);
        index.insert(&running, b"b", b"2", LogMode::Logged).unwrap();
        let checkpoint = engine.recovery.checkpoint(&engine.txns).unwrap();
        index.insert(&running, b"c", b"3", LogMode::Logged).unwrap();
        drop(index);
        drop(running);
        crash(engine);

        let engine = open(&dir);
        assert_eq!(engine.summary.checkpoint_lsn, Some(checkpoint));
        assert_eq!(engine.summary.loser_transactions.len(), 1);
        crash(engine);

        // the second restart finds the loser already ended
        let engine = open(&dir);
        assert!(engine.summary.loser_transactions.is_empty());
        let index = open_index(&engine);
        let reader = ctx(&engine);
        let all: Vec<_> = index
            .scan(&reader, ..)
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(all, vec![b"a".to_vec()]);
    }

    #[test]
    fn change_cut_short_is_taken_back_before_logical_undo() {
        let dir = TempDir::new().unwrap();
        let engine = open(&dir);
        let buffer = engine.buffers.create_container(2).unwrap();
        let setup = ctx(&engine);
        let index = BPlusTreeIndex::create(
            &setup,
            buffer.clone(),
            &ComparatorRegistry::default(),
            &IndexOptions::default(),
        )
        .unwrap();
        index.insert(&setup, b"a", b"1", LogMode::Logged).unwrap();
        engine.txns.commit(setup.transaction()).unwrap();

        let loser = ctx(&engine);
        index.insert(&loser, b"b", b"2", LogMode::Logged).unwrap();
        {
            // first image of a change whose remaining images never made it
            let root = PageId::new(2, 2);
            let mut handle = buffer.fix_page(root, LatchMode::Exclusive).unwrap();
            let before = handle.image();
            let after = vec![0u8; before.len()];
            let lsn = loser
                .transaction()
                .log_image(
                    PageAction::PageImage {
                        page: root,
                        before,
                        after: after.clone(),
                    },
                    INVALID_LSN,
                )
                .unwrap();
            handle.data_mut()[PAGE_LSN_LEN..].copy_from_slice(&after[PAGE_LSN_LEN..]);
            handle.set_lsn(lsn);
        }
        drop(index);
        drop(buffer);
        drop(loser);
        crash(engine);

        let engine = open(&dir);
        assert_eq!(engine.summary.loser_transactions.len(), 1);
        let index = open_index(&engine);
        assert_eq!(index.verify().unwrap().entries, 1);
        let reader = ctx(&engine);
        assert_eq!(index.get(&reader, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(index.get(&reader, b"b").unwrap(), None);
        engine.txns.commit(reader.transaction()).unwrap();
    }
}
