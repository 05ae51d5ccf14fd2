use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::background::{spawn_periodic_worker, BackgroundWorkers, WorkerHandle, WorkerKind};
use crate::buffer::BufferManager;
use crate::catalog::{Catalog, IndexDescriptor, IndexLease};
use crate::config::DatabaseOptions;
use crate::error::{io_fault, QuillStoreResult};
use crate::index::{BulkInsertContext, ComparatorRegistry, IndexOptions, LogMode};
use crate::recovery::{
    ControlFileManager, IndexResourceManager, Lsn, RecoveryManager, RecoverySummary,
    ResourceManager, WalManager,
};
use crate::transaction::{IsolationLevel, LockManager, TransactionManager, TxnContext};

/// An open database directory: container files, the log and the control
/// file. Opening runs restart recovery; dropping shuts down cleanly.
pub struct Database {
    options: DatabaseOptions,
    buffers: Arc<BufferManager>,
    wal: Arc<WalManager>,
    control: Arc<ControlFileManager>,
    recovery: Arc<RecoveryManager>,
    transaction_manager: Arc<TransactionManager>,
    catalog: Arc<Catalog>,
    recovery_summary: RecoverySummary,
    background_workers: Mutex<BackgroundWorkers>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.options.path)
            .field("transaction_manager", &self.transaction_manager)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Database {
    pub fn open(options: DatabaseOptions) -> QuillStoreResult<Self> {
        Self::open_with_comparators(options, ComparatorRegistry::default())
    }

    /// Opens with extra comparators registered next to the built-in ones.
    pub fn open_with_comparators(
        options: DatabaseOptions,
        comparators: ComparatorRegistry,
    ) -> QuillStoreResult<Self> {
        let path = options.path.clone();
        fs::create_dir_all(&path).map_err(io_fault(path.display().to_string()))?;

        let control = Arc::new(ControlFileManager::load_or_init(
            &path,
            options.buffer.page_size,
        )?);
        if !control.snapshot().clean_shutdown {
            warn!("{} was not shut down cleanly", path.display());
        }
        let wal = Arc::new(WalManager::open(&path, options.wal.clone())?);
        let buffers = Arc::new(BufferManager::new(
            &path,
            options.buffer,
            Some(wal.clone()),
        ));
        buffers.start()?;

        let resources: Arc<dyn ResourceManager> = Arc::new(IndexResourceManager::new(
            buffers.clone(),
            comparators.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            wal.clone(),
            buffers.clone(),
            control.clone(),
            resources.clone(),
        ));
        let recovery_summary = recovery.recover()?;
        if recovery_summary.redo_count > 0 || !recovery_summary.loser_transactions.is_empty() {
            info!(
                "recovery redid {} record(s) from lsn {} and rolled back {} transaction(s)",
                recovery_summary.redo_count,
                recovery_summary.redo_lsn,
                recovery_summary.loser_transactions.len()
            );
        }

        let lock_manager = Arc::new(LockManager::new(options.lock));
        let transaction_manager = Arc::new(TransactionManager::new(
            wal.clone(),
            buffers.clone(),
            lock_manager,
            resources,
            recovery_summary.next_txn_id,
        ));
        let catalog = Arc::new(Catalog::open(
            buffers.clone(),
            &transaction_manager,
            comparators,
        )?);

        // restart starts from a clean slate: everything recovery touched is
        // on disk and the next restart reads from here
        buffers.sync_all()?;
        recovery.checkpoint(&transaction_manager)?;
        control.set_clean_shutdown(false)?;

        let mut background_workers = BackgroundWorkers::new();
        if let Some(interval) = options.wal.writer_interval {
            background_workers.register_opt(wal.start_background_flush(interval));
        }
        if let Some(interval) = options.lock.deadlock_interval {
            background_workers.register_opt(transaction_manager.start_deadlock_detector(interval));
        }
        if let Some(interval) = options.checkpoint_interval {
            background_workers.register_opt(spawn_checkpoint_worker(
                Arc::downgrade(&recovery),
                Arc::downgrade(&transaction_manager),
                Arc::downgrade(&catalog),
                interval,
            ));
        }
        info!(
            "opened database at {} ({} background workers)",
            path.display(),
            background_workers.len()
        );

        Ok(Self {
            options,
            buffers,
            wal,
            control,
            recovery,
            transaction_manager,
            catalog,
            recovery_summary,
            background_workers: Mutex::new(background_workers),
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn recovery_summary(&self) -> &RecoverySummary {
        &self.recovery_summary
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transaction_manager
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.options.default_isolation
    }

    /// Begins a transaction with the configured isolation level and lock depth.
    pub fn begin(&self) -> QuillStoreResult<TxnContext> {
        self.begin_with(self.options.default_isolation, self.options.default_lock_depth)
    }

    pub fn begin_with(
        &self,
        isolation_level: IsolationLevel,
        lock_depth: u8,
    ) -> QuillStoreResult<TxnContext> {
        let txn = self.transaction_manager.begin(isolation_level, lock_depth)?;
        Ok(TxnContext::new(self.transaction_manager.clone(), txn))
    }

    pub fn commit(&self, ctx: &TxnContext) -> QuillStoreResult<()> {
        self.transaction_manager.commit(ctx.transaction())
    }

    pub fn rollback(&self, ctx: &TxnContext) -> QuillStoreResult<()> {
        self.transaction_manager.rollback(ctx.transaction())
    }

    /// Index options carrying the configured page capacities.
    pub fn index_options(&self, unique: bool) -> IndexOptions {
        IndexOptions::default()
            .with_unique(unique)
            .with_leaf_capacity(self.options.btree.leaf_capacity)
            .with_internal_capacity(self.options.btree.internal_capacity)
    }

    pub fn create_index(
        &self,
        ctx: &TxnContext,
        name: &str,
        options: &IndexOptions,
    ) -> QuillStoreResult<IndexLease> {
        self.catalog.create_index(ctx, name, options)
    }

    pub fn open_index(&self, ctx: &TxnContext, name: &str) -> QuillStoreResult<IndexLease> {
        self.catalog.open_index(ctx, name)
    }

    pub fn list_indexes(&self, ctx: &TxnContext) -> QuillStoreResult<Vec<IndexDescriptor>> {
        self.catalog.list(ctx)
    }

    /// Bulk loader for an empty index, filling leaves to the configured
    /// fill factor.
    pub fn bulk_insert(
        &self,
        ctx: &TxnContext,
        index: &IndexLease,
        mode: LogMode,
    ) -> QuillStoreResult<BulkInsertContext> {
        Ok(index
            .bulk_insert(ctx, mode)?
            .with_fill_factor(self.options.btree.bulk_fill_factor))
    }

    pub fn checkpoint(&self) -> QuillStoreResult<Lsn> {
        self.recovery.checkpoint(&self.transaction_manager)
    }

    /// Writes back every dirty page, then checkpoints so restart has
    /// nothing to redo.
    pub fn flush(&self) -> QuillStoreResult<Lsn> {
        self.wal.flush()?;
        self.buffers.sync_all()?;
        self.checkpoint()
    }

    /// Stops the workers, rolls back whatever is still running and leaves
    /// the files in a state restart can open without redo.
    pub fn close(&self) -> QuillStoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.background_workers.lock().shutdown_all();
        for txn in self.transaction_manager.active_transactions() {
            warn!("rolling back txn {} at shutdown", txn.id());
            self.transaction_manager.rollback(&txn)?;
        }
        self.flush()?;
        self.buffers.shutdown()?;
        self.control.set_clean_shutdown(true)?;
        info!("closed database at {}", self.options.path.display());
        Ok(())
    }

    /// Stops without writing back any page or ending any transaction. The
    /// log keeps only what was already handed to it, so the next open has
    /// to recover.
    #[doc(hidden)]
    pub fn simulate_crash(self) -> QuillStoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.background_workers.lock().shutdown_all();
        self.wal.flush()?;
        self.buffers.discard_all();
        warn!("simulated crash of {}", self.options.path.display());
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("database shutdown failed: {}", err);
        }
    }
}

fn spawn_checkpoint_worker(
    recovery: Weak<RecoveryManager>,
    txns: Weak<TransactionManager>,
    catalog: Weak<Catalog>,
    interval: Duration,
) -> Option<WorkerHandle> {
    spawn_periodic_worker("checkpointer", WorkerKind::Checkpoint, interval, move || {
        let (Some(recovery), Some(txns)) = (recovery.upgrade(), txns.upgrade()) else {
            return;
        };
        match recovery.checkpoint(&txns) {
            Ok(lsn) => debug!("periodic checkpoint at lsn {}", lsn),
            Err(err) => warn!("periodic checkpoint failed: {}", err),
        }
        if let Some(catalog) = catalog.upgrade() {
            catalog.evict_idle();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuillStoreError;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> DatabaseOptions {
        let mut options = DatabaseOptions::new(dir.path());
        options.buffer = options.buffer.with_page_size(1024usize).with_frames(64usize);
        options.checkpoint_interval = None;
        options
    }

    #[test]
    fn reopen_after_clean_close() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(options(&dir)).unwrap();
            let ctx = db.begin().unwrap();
            let index = db.create_index(&ctx, "kv", &db.index_options(true)).unwrap();
            index.insert(&ctx, b"k", b"v", LogMode::Logged).unwrap();
            drop(index);
            db.commit(&ctx).unwrap();
            db.close().unwrap();
            assert!(db.control.snapshot().clean_shutdown);
        }

        let db = Database::open(options(&dir)).unwrap();
        assert_eq!(db.recovery_summary().redo_count, 0);
        assert!(db.recovery_summary().loser_transactions.is_empty());
        assert!(!db.control.snapshot().clean_shutdown);
        let ctx = db.begin().unwrap();
        let index = db.open_index(&ctx, "kv").unwrap();
        assert_eq!(index.get(&ctx, b"k").unwrap(), Some(b"v".to_vec()));
        drop(index);
        db.commit(&ctx).unwrap();
    }

    #[test]
    fn close_rolls_back_running_transactions() {
        let dir = TempDir::new().unwrap();
        {
            let db = Database::open(options(&dir)).unwrap();
            let setup = db.begin().unwrap();
            db.create_index(&setup, "kv", &db.index_options(true)).unwrap();
            db.commit(&setup).unwrap();

            let open = db.begin().unwrap();
            let index = db.open_index(&open, "kv").unwrap();
            index.insert(&open, b"dangling", b"x", LogMode::Logged).unwrap();
            drop(index);
            db.close().unwrap();
            assert!(matches!(
                db.commit(&open),
                Err(QuillStoreError::Transaction(_))
            ));
        }
        let db = Database::open(options(&dir)).unwrap();
        let ctx = db.begin().unwrap();
        let index = db.open_index(&ctx, "kv").unwrap();
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn transaction_ids_keep_growing_across_restarts() {
        let dir = TempDir::new().unwrap();
        let first = {
            let db = Database::open(options(&dir)).unwrap();
            let ctx = db.begin().unwrap();
            db.commit(&ctx).unwrap();
            ctx.txn_id()
        };
        let db = Database::open(options(&dir)).unwrap();
        let ctx = db.begin().unwrap();
        assert!(ctx.txn_id() > first);
        db.rollback(&ctx).unwrap();
    }
}
