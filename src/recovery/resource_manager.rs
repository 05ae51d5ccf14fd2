use std::sync::Arc;

use dashmap::DashMap;
use log::trace;

use crate::buffer::{Buffer, BufferManager, PageId};
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::index::btree_index::{redo_page_action, restore_images, ImageRestore};
use crate::index::{BPlusTreeIndex, ComparatorRegistry};
use crate::recovery::wal_record::{LogBody, LogRecord, PageAction};
use crate::recovery::{Lsn, WalManager, INVALID_LSN};
use crate::transaction::Transaction;

/// The page images of one split, merge, root change or bulk-built page,
/// newest first.
#[derive(Debug, Clone)]
pub struct ImageGroup {
    pub records: Vec<LogRecord>,
    /// Where the undo chain continues below the change.
    pub resume: Lsn,
    /// False when the change was cut short before its last image was logged.
    pub complete: bool,
}

impl ImageGroup {
    /// Collects the change whose newest image is `newest`.
    pub fn read(wal: &WalManager, newest: LogRecord) -> QuillStoreResult<Self> {
        let complete = newest.undo_next_lsn != INVALID_LSN;
        let start = newest.undo_next_lsn;
        let mut cursor = newest.prev_lsn;
        let mut records = vec![newest];
        while cursor != INVALID_LSN && (!complete || cursor > start) {
            let record = wal.read_record(cursor)?;
            let is_image = matches!(record.body, LogBody::Page(PageAction::PageImage { .. }));
            if !complete && !(is_image && record.undo_next_lsn == INVALID_LSN) {
                break;
            }
            if !is_image {
                return Err(QuillStoreError::Wal(format!(
                    "record {} inside the structure change ending at {} is not a page image",
                    record.lsn, records[0].lsn
                )));
            }
            cursor = record.prev_lsn;
            records.push(record);
        }
        Ok(Self {
            records,
            resume: if complete { start } else { cursor },
            complete,
        })
    }

    pub fn newest_lsn(&self) -> Lsn {
        self.records[0].lsn
    }
}

/// Applies the page changes found in the log. Redo repeats a change unless
/// the page already carries it; undo compensates it with a CLR.
pub trait ResourceManager: Send + Sync {
    /// Returns whether the page was changed.
    fn redo(&self, record: &LogRecord) -> QuillStoreResult<bool>;

    fn undo(&self, txn: &Transaction, record: &LogRecord) -> QuillStoreResult<()>;

    /// Puts the pages of a structure change back to their before images.
    /// Returns false when the change was left in place because other work
    /// has been done on its pages since.
    fn undo_images(&self, txn: &Transaction, group: &ImageGroup) -> QuillStoreResult<bool>;
}

/// Resource manager for B+Tree pages. Containers named by the log are
/// started on first use, so restart does not depend on which ones were
/// running before the crash.
pub struct IndexResourceManager {
    buffers: Arc<BufferManager>,
    registry: ComparatorRegistry,
    indexes: DashMap<PageId, BPlusTreeIndex>,
}

impl std::fmt::Debug for IndexResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexResourceManager")
            .field("open_indexes", &self.indexes.len())
            .finish()
    }
}

impl IndexResourceManager {
    pub fn new(buffers: Arc<BufferManager>, registry: ComparatorRegistry) -> Self {
        Self {
            buffers,
            registry,
            indexes: DashMap::new(),
        }
    }

    fn buffer_for(&self, page_id: PageId) -> QuillStoreResult<Arc<Buffer>> {
        self.buffers.get_or_start_container(page_id.container())
    }

    fn index(&self, meta_page_id: PageId) -> QuillStoreResult<BPlusTreeIndex> {
        if let Some(index) = self.indexes.get(&meta_page_id) {
            return Ok(index.value().clone());
        }
        let buffer = self.buffer_for(meta_page_id)?;
        let index = BPlusTreeIndex::open(buffer, meta_page_id, &self.registry)?;
        self.indexes.insert(meta_page_id, index.clone());
        Ok(index)
    }

    /// Forgets cached index handles, e.g. after their container restarted.
    pub fn clear(&self) {
        self.indexes.clear();
    }
}

impl ResourceManager for IndexResourceManager {
    fn redo(&self, record: &LogRecord) -> QuillStoreResult<bool> {
        let action = match &record.body {
            LogBody::Page(action) | LogBody::Clr { action, .. } => action,
            _ => return Ok(false),
        };
        let buffer = self.buffer_for(action.page_id())?;
        let applied = redo_page_action(&buffer, record.lsn, action)?;
        if applied {
            trace!("redid lsn {} on {}", record.lsn, action.page_id());
        }
        Ok(applied)
    }

    fn undo(&self, txn: &Transaction, record: &LogRecord) -> QuillStoreResult<()> {
        let LogBody::Page(action) = &record.body else {
            return Err(QuillStoreError::Wal(format!(
                "record {} is not an undoable page change",
                record.lsn
            )));
        };
        trace!("undoing lsn {} of txn {}", record.lsn, txn.id());
        match action {
            PageAction::PageImage { page, .. } => Err(QuillStoreError::Wal(format!(
                "image of {} at lsn {} is undone with its structure change",
                page, record.lsn
            ))),
            PageAction::LeafInsert { index, .. }
            | PageAction::LeafDelete { index, .. }
            | PageAction::LeafUpdate { index, .. } => {
                self.index(*index)?.undo_leaf_change(txn, record, action)
            }
        }
    }

    fn undo_images(&self, txn: &Transaction, group: &ImageGroup) -> QuillStoreResult<bool> {
        let mut pages = Vec::with_capacity(group.records.len());
        for record in &group.records {
            let LogBody::Page(PageAction::PageImage {
                page,
                before,
                after,
            }) = &record.body
            else {
                return Err(QuillStoreError::Wal(format!(
                    "record {} is not a page image",
                    record.lsn
                )));
            };
            pages.push(ImageRestore {
                buffer: self.buffer_for(*page)?,
                lsn: record.lsn,
                page: *page,
                before,
                after,
            });
        }
        trace!(
            "undoing {} images of txn {} ending at lsn {}",
            pages.len(),
            txn.id(),
            group.newest_lsn()
        );
        restore_images(txn, group, &pages)
    }
}
