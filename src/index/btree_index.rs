use std::cmp::Ordering;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use derive_with::With;
use log::{debug, trace};

use crate::buffer::{Buffer, LatchMode, PageHandle, PageId, PAGE_LSN_LEN};
use crate::error::{BufferFault, QuillStoreError, QuillStoreResult};
use crate::index::btree_iterator::TreeIndexIterator;
use crate::index::comparator::{ComparatorRef, ComparatorRegistry};
use crate::index::page::{
    internal_entry_len, leaf_entry_len, max_entry_len, page_type, BPlusTreePage,
    BPlusTreePageCodec, InternalPage, LeafPage, MetaPage, MetaPageCodec, INTERNAL_HEADER_LEN,
    LEAF_HEADER_LEN, PAGE_TYPE_LEAF,
};
use crate::recovery::wal_record::{LogRecord, PageAction};
use crate::recovery::{ImageGroup, Lsn, INVALID_LSN};
use crate::transaction::{Transaction, TxnContext};

/// Whether a mutation is written to the log. Unlogged changes mark their pages
/// as owned by the transaction, which forces them to disk at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Logged,
    Unlogged,
}

/// How a leaf change is recorded.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Journal {
    Logged,
    Unlogged,
    /// Undo of the record at `undone`; the chain continues at `undo_next`.
    Compensation { undone: Lsn, undo_next: Lsn },
}

impl From<LogMode> for Journal {
    fn from(mode: LogMode) -> Self {
        match mode {
            LogMode::Logged => Journal::Logged,
            LogMode::Unlogged => Journal::Unlogged,
        }
    }
}

#[derive(Debug, Clone, With)]
pub struct IndexOptions {
    pub comparator: String,
    pub unique: bool,
    pub leaf_capacity: Option<u16>,
    pub internal_capacity: Option<u16>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            comparator: "bytes".to_string(),
            unique: true,
            leaf_capacity: None,
            internal_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: usize,
    pub leaves: usize,
    pub internal_pages: usize,
    pub entries: usize,
}

/// Search target. `Key` sorts before every entry carrying that key in a
/// non-unique index, `First` before everything.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchKey<'a> {
    First,
    Key(&'a [u8]),
    Entry(&'a [u8], &'a [u8]),
}

#[derive(Debug, Clone, Copy)]
enum Intent {
    Insert { entry_len: usize },
    Update { value_len: usize },
    Delete { merge: bool },
}

struct PathNode {
    handle: PageHandle,
    page: BPlusTreePage,
}

/// Latched pages from the lowest ancestor that may change down to the leaf.
struct WritePath {
    meta: Option<(PageHandle, MetaPage)>,
    nodes: Vec<PathNode>,
}

impl WritePath {
    fn pop_leaf(&mut self) -> QuillStoreResult<(PageHandle, LeafPage)> {
        match self.nodes.pop() {
            Some(PathNode {
                handle,
                page: BPlusTreePage::Leaf(leaf),
            }) => Ok((handle, leaf)),
            _ => Err(QuillStoreError::Internal(
                "write descent did not end at a leaf".to_string(),
            )),
        }
    }
}

struct StagedPage {
    handle: PageHandle,
    image: Vec<u8>,
    allocated: bool,
}

/// Pages rewritten by one split, merge or root change. Their images are
/// logged back to back and the last one carries the chain position from
/// before the change, so undo takes the whole change back as one unit.
#[derive(Default)]
struct StructureChange {
    pages: Vec<StagedPage>,
}

impl StructureChange {
    fn stage(&mut self, handle: PageHandle, image: Vec<u8>) {
        self.pages.push(StagedPage {
            handle,
            image,
            allocated: false,
        });
    }

    /// Stages a page allocated for this change.
    fn stage_new(&mut self, handle: PageHandle, image: Vec<u8>) {
        self.pages.push(StagedPage {
            handle,
            image,
            allocated: true,
        });
    }

    fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn apply(&mut self, txn: &Transaction, journal: Journal) -> QuillStoreResult<()> {
        let start = txn.last_lsn();
        let last = self.pages.len().saturating_sub(1);
        for (i, page) in self.pages.iter_mut().enumerate() {
            let handle = &mut page.handle;
            if let Journal::Unlogged = journal {
                write_body(handle, &page.image);
                if page.allocated {
                    handle.assign_new_to(txn.id());
                } else {
                    handle.assign_to(txn.id());
                }
                continue;
            }
            let action = PageAction::PageImage {
                page: handle.page_id(),
                before: handle.image(),
                after: page.image.clone(),
            };
            let undo_next = if i == last { start } else { INVALID_LSN };
            let lsn = txn.log_image(action, undo_next)?;
            write_body(handle, &page.image);
            handle.set_lsn(lsn);
        }
        Ok(())
    }

    fn take(&mut self, page_id: PageId) -> Option<PageHandle> {
        let pos = self
            .pages
            .iter()
            .position(|page| page.handle.page_id() == page_id)?;
        Some(self.pages.swap_remove(pos).handle)
    }
}

/// Copies everything but the page LSN.
fn write_body(handle: &mut PageHandle, image: &[u8]) {
    handle.data_mut()[PAGE_LSN_LEN..].copy_from_slice(&image[PAGE_LSN_LEN..]);
}

fn missing_page_as_access_error(err: QuillStoreError) -> QuillStoreError {
    match err {
        QuillStoreError::Buffer(BufferFault::PageNotFound(page_id)) => {
            QuillStoreError::IndexAccess(format!("index page {} does not exist", page_id))
        }
        other => other,
    }
}

/// Write-ahead-logged B+Tree over one container buffer. The tree is named by
/// its meta page, which holds the root and acts as the root's parent during
/// latch crabbing.
#[derive(Clone)]
pub struct BPlusTreeIndex {
    meta_page_id: PageId,
    buffer: Arc<Buffer>,
    comparator: ComparatorRef,
    unique: bool,
    leaf_capacity: Option<u16>,
    internal_capacity: Option<u16>,
}

impl std::fmt::Debug for BPlusTreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTreeIndex")
            .field("meta_page_id", &self.meta_page_id)
            .field("comparator", &self.comparator.name())
            .field("unique", &self.unique)
            .finish()
    }
}

impl BPlusTreeIndex {
    /// Formats a meta page and an empty root leaf in `buffer`.
    pub fn create(
        ctx: &TxnContext,
        buffer: Arc<Buffer>,
        registry: &ComparatorRegistry,
        options: &IndexOptions,
    ) -> QuillStoreResult<Self> {
        ctx.ensure_running()?;
        let comparator = registry.resolve(&options.comparator)?;
        for (what, capacity) in [
            ("leaf", options.leaf_capacity),
            ("internal", options.internal_capacity),
        ] {
            if matches!(capacity, Some(cap) if cap < 2) {
                return Err(QuillStoreError::IndexOperation(format!(
                    "{} capacity must be at least 2",
                    what
                )));
            }
        }
        let page_size = buffer.page_size();
        let meta_handle = buffer.allocate_page(LatchMode::Exclusive)?;
        let root_handle = buffer.allocate_page(LatchMode::Exclusive)?;
        let meta = MetaPage {
            root: root_handle.page_id(),
            leaf_capacity: options.leaf_capacity,
            internal_capacity: options.internal_capacity,
            unique: options.unique,
            comparator: comparator.name().to_string(),
        };
        let index = Self {
            meta_page_id: meta_handle.page_id(),
            buffer: buffer.clone(),
            comparator,
            unique: options.unique,
            leaf_capacity: options.leaf_capacity,
            internal_capacity: options.internal_capacity,
        };

        let mut change = StructureChange::default();
        change.stage_new(
            root_handle,
            BPlusTreePageCodec::encode_leaf(&LeafPage::default(), page_size)?,
        );
        change.stage_new(meta_handle, MetaPageCodec::encode(&meta, page_size)?);
        change.apply(ctx.transaction(), Journal::Logged)?;
        debug!(
            "created index at {} (root {}, comparator {})",
            index.meta_page_id,
            meta.root,
            meta.comparator
        );
        Ok(index)
    }

    pub fn open(
        buffer: Arc<Buffer>,
        meta_page_id: PageId,
        registry: &ComparatorRegistry,
    ) -> QuillStoreResult<Self> {
        let meta = {
            let handle = buffer
                .fix_page(meta_page_id, LatchMode::Shared)
                .map_err(missing_page_as_access_error)?;
            MetaPageCodec::decode(handle.data())?
        };
        Ok(Self {
            meta_page_id,
            buffer,
            comparator: registry.resolve(&meta.comparator)?,
            unique: meta.unique,
            leaf_capacity: meta.leaf_capacity,
            internal_capacity: meta.internal_capacity,
        })
    }

    pub fn meta_page_id(&self) -> PageId {
        self.meta_page_id
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn comparator(&self) -> &ComparatorRef {
        &self.comparator
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn leaf_capacity(&self) -> Option<u16> {
        self.leaf_capacity
    }

    pub fn internal_capacity(&self) -> Option<u16> {
        self.internal_capacity
    }

    pub(crate) fn page_size(&self) -> usize {
        self.buffer.page_size()
    }

    pub fn insert(
        &self,
        ctx: &TxnContext,
        key: &[u8],
        value: &[u8],
        mode: LogMode,
    ) -> QuillStoreResult<()> {
        ctx.lock_key_write(self.meta_page_id, key)?;
        self.insert_entry(ctx.transaction(), key, value, mode.into())
    }

    /// Removes the entry for `key` (or exactly `(key, value)` when a value is
    /// given) and returns the removed value.
    pub fn delete(
        &self,
        ctx: &TxnContext,
        key: &[u8],
        value: Option<&[u8]>,
        mode: LogMode,
    ) -> QuillStoreResult<Option<Vec<u8>>> {
        ctx.lock_key_write(self.meta_page_id, key)?;
        self.delete_entry(ctx.transaction(), key, value, mode.into(), true)
    }

    /// Replaces the value stored under `key` and returns the previous one.
    pub fn update(
        &self,
        ctx: &TxnContext,
        key: &[u8],
        value: &[u8],
        mode: LogMode,
    ) -> QuillStoreResult<Option<Vec<u8>>> {
        if !self.unique {
            return Err(QuillStoreError::IndexOperation(
                "update requires a unique index".to_string(),
            ));
        }
        ctx.lock_key_write(self.meta_page_id, key)?;
        self.update_entry(ctx.transaction(), key, value, mode.into())
    }

    /// First value stored under `key`.
    pub fn get(&self, ctx: &TxnContext, key: &[u8]) -> QuillStoreResult<Option<Vec<u8>>> {
        let guard = ctx.lock_key_read(self.meta_page_id, key)?;
        let found = self.lookup(key)?;
        guard.release();
        Ok(found)
    }

    /// Entries with keys inside `range`, in index order.
    pub fn scan<R: RangeBounds<Vec<u8>>>(
        &self,
        ctx: &TxnContext,
        range: R,
    ) -> QuillStoreResult<TreeIndexIterator> {
        let scan_lock = ctx.lock_scan(self.meta_page_id)?;
        let lock_keys = ctx.scan_locks_keys(self.meta_page_id);
        Ok(TreeIndexIterator::new(
            self.clone(),
            ctx.clone(),
            range.start_bound().cloned(),
            range.end_bound().cloned(),
            lock_keys,
            scan_lock,
        ))
    }

    pub fn height(&self) -> QuillStoreResult<usize> {
        let mut height = 1;
        let (_, leaf) = self.find_leaf_read_with(SearchKey::First, |_| height += 1)?;
        drop(leaf);
        Ok(height)
    }

    pub fn is_empty(&self) -> QuillStoreResult<bool> {
        Ok(self.seek(SearchKey::First)?.is_none())
    }

    // ---------------------------------------------------------------------
    // ordering

    pub(crate) fn compare_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    /// Index order of two entries: by key, then by value unless unique.
    pub(crate) fn compare_entries(&self, a: (&[u8], &[u8]), b: (&[u8], &[u8])) -> Ordering {
        match self.comparator.compare(a.0, b.0) {
            Ordering::Equal if !self.unique => a.1.cmp(b.1),
            other => other,
        }
    }

    /// Where `search` sorts relative to the entry `(key, value)`.
    pub(crate) fn compare_search(&self, search: SearchKey<'_>, key: &[u8], value: &[u8]) -> Ordering {
        match search {
            SearchKey::First => Ordering::Less,
            SearchKey::Key(k) => match self.comparator.compare(k, key) {
                Ordering::Equal if !self.unique => Ordering::Less,
                other => other,
            },
            SearchKey::Entry(k, v) => self.compare_entries((k, v), (key, value)),
        }
    }

    fn entry_search_key<'a>(&self, key: &'a [u8], value: &'a [u8]) -> SearchKey<'a> {
        if self.unique {
            SearchKey::Key(key)
        } else {
            SearchKey::Entry(key, value)
        }
    }

    /// First slot whose entry is at or above `search`.
    pub(crate) fn leaf_position(&self, leaf: &LeafPage, search: SearchKey<'_>) -> usize {
        leaf.entries
            .partition_point(|(key, value)| self.compare_search(search, key, value) == Ordering::Greater)
    }

    fn route(&self, internal: &InternalPage, search: SearchKey<'_>) -> PageId {
        let index = internal
            .entries
            .partition_point(|(key, value, _)| self.compare_search(search, key, value) != Ordering::Less);
        if index == 0 {
            internal.leftmost
        } else {
            internal.entries[index - 1].2
        }
    }

    fn separator_of(&self, entry: &(Vec<u8>, Vec<u8>)) -> (Vec<u8>, Vec<u8>) {
        if self.unique {
            (entry.0.clone(), Vec::new())
        } else {
            entry.clone()
        }
    }

    pub(crate) fn check_entry(&self, key: &[u8], value: &[u8]) -> QuillStoreResult<()> {
        self.comparator.validate(key)?;
        let limit = max_entry_len(self.page_size());
        let len = leaf_entry_len(key, value);
        if len > limit || key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(QuillStoreError::IndexOperation(format!(
                "entry of {} bytes exceeds the {} byte limit",
                len, limit
            )));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // occupancy

    pub(crate) fn leaf_underfull(&self, count: usize, encoded_len: usize) -> bool {
        count == 0
            || match self.leaf_capacity {
                Some(cap) => count * 2 < cap as usize,
                None => (encoded_len - LEAF_HEADER_LEN) * 4 < self.page_size() - LEAF_HEADER_LEN,
            }
    }

    fn internal_underfull(&self, count: usize, encoded_len: usize) -> bool {
        match self.internal_capacity {
            Some(cap) => count * 2 < cap as usize,
            None => {
                (encoded_len - INTERNAL_HEADER_LEN) * 4 < self.page_size() - INTERNAL_HEADER_LEN
            }
        }
    }

    fn node_underfull(&self, page: &BPlusTreePage) -> bool {
        match page {
            BPlusTreePage::Leaf(leaf) => self.leaf_underfull(leaf.entries.len(), leaf.encoded_len()),
            BPlusTreePage::Internal(internal) => {
                self.internal_underfull(internal.entries.len(), internal.encoded_len())
            }
        }
    }

    fn leaf_has_room(&self, leaf: &LeafPage, added_entries: usize, added_bytes: usize) -> bool {
        self.leaf_capacity
            .map_or(true, |cap| leaf.entries.len() + added_entries <= cap as usize)
            && leaf.encoded_len() + added_bytes <= self.page_size()
    }

    fn max_separator_len(&self) -> usize {
        max_entry_len(self.page_size()) + internal_entry_len(&[], &[]) - leaf_entry_len(&[], &[])
    }

    /// Whether `page` stays within bounds after the operation, so that none
    /// of its ancestors can change.
    fn is_safe(&self, page: &BPlusTreePage, search: SearchKey<'_>, intent: Intent, is_root: bool) -> bool {
        let page_size = self.page_size();
        match (page, intent) {
            (BPlusTreePage::Leaf(leaf), Intent::Insert { entry_len }) => {
                self.leaf_has_room(leaf, 1, entry_len)
            }
            (BPlusTreePage::Leaf(leaf), Intent::Update { value_len }) => {
                let pos = self.leaf_position(leaf, search);
                match leaf.entries.get(pos) {
                    Some((_, old)) => leaf.encoded_len() - old.len() + value_len <= page_size,
                    None => true,
                }
            }
            (BPlusTreePage::Leaf(_), Intent::Delete { merge: false }) => true,
            (BPlusTreePage::Leaf(leaf), Intent::Delete { merge: true }) => {
                if is_root {
                    return true;
                }
                let pos = self.leaf_position(leaf, search);
                match leaf.entries.get(pos) {
                    Some((key, value)) if self.compare_search(search, key, value) == Ordering::Equal => {
                        !self.leaf_underfull(
                            leaf.entries.len() - 1,
                            leaf.encoded_len() - leaf_entry_len(key, value),
                        )
                    }
                    _ => true,
                }
            }
            (BPlusTreePage::Internal(internal), Intent::Insert { .. } | Intent::Update { .. }) => {
                self.internal_capacity
                    .map_or(true, |cap| internal.entries.len() < cap as usize)
                    && internal.encoded_len() + self.max_separator_len() <= page_size
            }
            (BPlusTreePage::Internal(_), Intent::Delete { merge: false }) => true,
            (BPlusTreePage::Internal(internal), Intent::Delete { merge: true }) => {
                if is_root {
                    return internal.entries.len() > 1;
                }
                let largest = internal
                    .entries
                    .iter()
                    .map(|(key, value, _)| internal_entry_len(key, value))
                    .max();
                match largest {
                    Some(largest) => !self.internal_underfull(
                        internal.entries.len() - 1,
                        internal.encoded_len() - largest,
                    ),
                    None => false,
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // descent

    fn decode_node(&self, handle: &PageHandle, is_root: bool) -> QuillStoreResult<BPlusTreePage> {
        BPlusTreePageCodec::decode(handle.data()).map_err(|err| {
            if is_root {
                QuillStoreError::IndexAccess(format!(
                    "root page {} of index {} is unusable: {}",
                    handle.page_id(),
                    self.meta_page_id,
                    err
                ))
            } else {
                err
            }
        })
    }

    fn read_meta(&self, mode: LatchMode) -> QuillStoreResult<(PageHandle, MetaPage)> {
        let handle = self
            .buffer
            .fix_page(self.meta_page_id, mode)
            .map_err(missing_page_as_access_error)?;
        let meta = MetaPageCodec::decode(handle.data())?;
        Ok((handle, meta))
    }

    pub(crate) fn find_leaf_read(&self, search: SearchKey<'_>) -> QuillStoreResult<(PageHandle, LeafPage)> {
        self.find_leaf_read_with(search, |_| {})
    }

    /// S-latch crabbing from the meta page; `on_internal` sees every inner
    /// node passed on the way down.
    fn find_leaf_read_with(
        &self,
        search: SearchKey<'_>,
        mut on_internal: impl FnMut(&InternalPage),
    ) -> QuillStoreResult<(PageHandle, LeafPage)> {
        let (meta_handle, meta) = self.read_meta(LatchMode::Shared)?;
        let mut parent = meta_handle;
        let mut page_id = meta.root;
        let mut is_root = true;
        loop {
            let handle = self
                .buffer
                .fix_page(page_id, LatchMode::Shared)
                .map_err(missing_page_as_access_error)?;
            drop(parent);
            match self.decode_node(&handle, is_root)? {
                BPlusTreePage::Leaf(leaf) => return Ok((handle, leaf)),
                BPlusTreePage::Internal(internal) => {
                    on_internal(&internal);
                    page_id = self.route(&internal, search);
                    parent = handle;
                    is_root = false;
                }
            }
        }
    }

    /// Follows a leaf-chain link with a fresh fetch. Returns `None` when the
    /// link went stale (the target is no longer `from`'s right neighbour).
    pub(crate) fn follow_link(
        &self,
        from: PageId,
        to: PageId,
    ) -> QuillStoreResult<Option<(PageHandle, LeafPage)>> {
        let handle = self.buffer.fix_page(to, LatchMode::Shared)?;
        if page_type(handle.data()) != PAGE_TYPE_LEAF {
            return Ok(None);
        }
        let leaf = BPlusTreePageCodec::decode_leaf(handle.data())?;
        if leaf.prev != Some(from) {
            return Ok(None);
        }
        Ok(Some((handle, leaf)))
    }

    /// First entry at or above `search`, crossing leaves as needed.
    pub(crate) fn seek(&self, search: SearchKey<'_>) -> QuillStoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        'restart: loop {
            let (handle, leaf) = self.find_leaf_read(search)?;
            let pos = self.leaf_position(&leaf, search);
            if let Some(entry) = leaf.entries.get(pos) {
                return Ok(Some(entry.clone()));
            }
            let mut current = handle.page_id();
            let mut next = leaf.next;
            drop(handle);
            while let Some(next_id) = next {
                let Some((handle, leaf)) = self.follow_link(current, next_id)? else {
                    continue 'restart;
                };
                let pos = self.leaf_position(&leaf, search);
                if let Some(entry) = leaf.entries.get(pos) {
                    return Ok(Some(entry.clone()));
                }
                current = handle.page_id();
                next = leaf.next;
            }
            return Ok(None);
        }
    }

    /// Unlocked point read of the first value under `key`.
    pub(crate) fn lookup(&self, key: &[u8]) -> QuillStoreResult<Option<Vec<u8>>> {
        Ok(self
            .seek(SearchKey::Key(key))?
            .filter(|(found, _)| self.compare_keys(found, key) == Ordering::Equal)
            .map(|(_, value)| value))
    }

    /// Unlocked check that exactly `(key, value)` is present.
    pub(crate) fn contains_entry(&self, key: &[u8], value: &[u8]) -> QuillStoreResult<bool> {
        Ok(self
            .seek(SearchKey::Entry(key, value))?
            .map_or(false, |(k, v)| {
                self.compare_keys(&k, key) == Ordering::Equal && v == value
            }))
    }

    /// U-latch crabbing: ancestors are released as soon as a node is safe for
    /// `intent`, then the remaining path is upgraded to X top-down.
    fn descend_for_write(&self, search: SearchKey<'_>, intent: Intent) -> QuillStoreResult<WritePath> {
        let (meta_handle, meta) = self.read_meta(LatchMode::Update)?;
        let root = meta.root;
        let mut path = WritePath {
            meta: Some((meta_handle, meta)),
            nodes: Vec::new(),
        };
        let mut page_id = root;
        loop {
            let handle = self
                .buffer
                .fix_page(page_id, LatchMode::Update)
                .map_err(missing_page_as_access_error)?;
            let page = self.decode_node(&handle, page_id == root)?;
            if self.is_safe(&page, search, intent, page_id == root) {
                path.meta = None;
                path.nodes.clear();
            }
            let child = match &page {
                BPlusTreePage::Internal(internal) => Some(self.route(internal, search)),
                BPlusTreePage::Leaf(_) => None,
            };
            path.nodes.push(PathNode { handle, page });
            match child {
                Some(child) => page_id = child,
                None => break,
            }
        }
        if let Some((handle, _)) = path.meta.as_mut() {
            handle.up_x();
        }
        for node in path.nodes.iter_mut() {
            node.handle.up_x();
        }
        Ok(path)
    }

    // ---------------------------------------------------------------------
    // leaf changes

    fn journal_leaf(
        &self,
        txn: &Transaction,
        journal: Journal,
        handle: &mut PageHandle,
        leaf: &LeafPage,
        action: PageAction,
    ) -> QuillStoreResult<()> {
        let image = BPlusTreePageCodec::encode_leaf(leaf, self.page_size())?;
        let lsn = match journal {
            Journal::Unlogged => None,
            Journal::Logged => Some(txn.log_page(action)?),
            Journal::Compensation { undone, undo_next } => {
                Some(txn.log_clr(undone, undo_next, action)?)
            }
        };
        write_body(handle, &image);
        match lsn {
            Some(lsn) => handle.set_lsn(lsn),
            None => handle.assign_to(txn.id()),
        }
        Ok(())
    }

    pub(crate) fn insert_entry(
        &self,
        txn: &Transaction,
        key: &[u8],
        value: &[u8],
        journal: Journal,
    ) -> QuillStoreResult<()> {
        self.check_entry(key, value)?;
        let search = self.entry_search_key(key, value);
        let entry_len = leaf_entry_len(key, value);
        let mut path = self.descend_for_write(search, Intent::Insert { entry_len })?;
        let (handle, leaf) = path.pop_leaf()?;

        let pos = self.leaf_position(&leaf, search);
        if let Some((k, v)) = leaf.entries.get(pos) {
            if self.compare_search(search, k, v) == Ordering::Equal {
                return Err(QuillStoreError::DuplicateKey);
            }
        }

        let (mut handle, mut leaf) = if self.leaf_has_room(&leaf, 1, entry_len) {
            (handle, leaf)
        } else {
            self.split_leaf(txn, journal, &mut path, handle, leaf, (key, value), 1, entry_len)?
        };
        drop(path);

        let slot = self.leaf_position(&leaf, search);
        leaf.entries.insert(slot, (key.to_vec(), value.to_vec()));
        let action = PageAction::LeafInsert {
            index: self.meta_page_id,
            page: handle.page_id(),
            slot: slot as u16,
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.journal_leaf(txn, journal, &mut handle, &leaf, action)?;
        trace!("inserted into {} at slot {}", handle.page_id(), slot);
        Ok(())
    }

    pub(crate) fn delete_entry(
        &self,
        txn: &Transaction,
        key: &[u8],
        value: Option<&[u8]>,
        journal: Journal,
        merge: bool,
    ) -> QuillStoreResult<Option<Vec<u8>>> {
        let resolved;
        let value = match value {
            Some(value) => Some(value),
            None if !self.unique => match self.lookup(key)? {
                Some(found) => {
                    resolved = found;
                    Some(resolved.as_slice())
                }
                None => return Ok(None),
            },
            None => None,
        };
        let search = match value {
            Some(value) => self.entry_search_key(key, value),
            None => SearchKey::Key(key),
        };
        let mut path = self.descend_for_write(search, Intent::Delete { merge })?;
        let (mut handle, mut leaf) = path.pop_leaf()?;

        let pos = self.leaf_position(&leaf, search);
        let matches = leaf.entries.get(pos).map_or(false, |(k, v)| {
            self.compare_search(search, k, v) == Ordering::Equal
                && value.map_or(true, |wanted| wanted == v.as_slice())
        });
        if !matches {
            return Ok(None);
        }
        let (old_key, old_value) = leaf.entries.remove(pos);
        let action = PageAction::LeafDelete {
            index: self.meta_page_id,
            page: handle.page_id(),
            slot: pos as u16,
            key: old_key,
            value: old_value.clone(),
        };
        self.journal_leaf(txn, journal, &mut handle, &leaf, action)?;
        trace!("deleted from {} at slot {}", handle.page_id(), pos);

        if merge
            && !path.nodes.is_empty()
            && self.leaf_underfull(leaf.entries.len(), leaf.encoded_len())
        {
            self.merge_up(
                txn,
                journal,
                path,
                PathNode {
                    handle,
                    page: BPlusTreePage::Leaf(leaf),
                },
            )?;
        }
        Ok(Some(old_value))
    }

    pub(crate) fn update_entry(
        &self,
        txn: &Transaction,
        key: &[u8],
        value: &[u8],
        journal: Journal,
    ) -> QuillStoreResult<Option<Vec<u8>>> {
        self.check_entry(key, value)?;
        let search = SearchKey::Key(key);
        let mut path = self.descend_for_write(
            search,
            Intent::Update {
                value_len: value.len(),
            },
        )?;
        let (handle, leaf) = path.pop_leaf()?;

        let pos = self.leaf_position(&leaf, search);
        let old_len = match leaf.entries.get(pos) {
            Some((k, v)) if self.compare_keys(k, key) == Ordering::Equal => v.len(),
            _ => return Ok(None),
        };
        let growth = value.len().saturating_sub(old_len);
        let (mut handle, mut leaf) = if self.leaf_has_room(&leaf, 0, growth) {
            (handle, leaf)
        } else {
            self.split_leaf(txn, journal, &mut path, handle, leaf, (key, value), 0, growth)?
        };
        drop(path);

        let slot = self.leaf_position(&leaf, search);
        let old_value = std::mem::replace(&mut leaf.entries[slot].1, value.to_vec());
        let action = PageAction::LeafUpdate {
            index: self.meta_page_id,
            page: handle.page_id(),
            slot: slot as u16,
            key: key.to_vec(),
            old_value: old_value.clone(),
            new_value: value.to_vec(),
        };
        self.journal_leaf(txn, journal, &mut handle, &leaf, action)?;
        Ok(Some(old_value))
    }

    // ---------------------------------------------------------------------
    // structure changes

    /// Split point of a full leaf: both halves must be able to take
    /// `added_entries` more entries, bytes are balanced within that.
    fn leaf_split_point(&self, entries: &[(Vec<u8>, Vec<u8>)], added_entries: usize) -> usize {
        let len = entries.len();
        let (mut lo, mut hi) = (1, len.saturating_sub(1).max(1));
        if let Some(cap) = self.leaf_capacity {
            let room = (cap as usize).saturating_sub(added_entries).max(1);
            lo = lo.max(len.saturating_sub(room));
            hi = hi.min(room);
        }
        let lens: Vec<usize> = entries.iter().map(|(k, v)| leaf_entry_len(k, v)).collect();
        balanced_split(&lens, lo, hi.max(lo), false)
    }

    /// Index of the separator pushed up from an overflowing internal page.
    fn internal_split_point(&self, internal: &InternalPage) -> usize {
        let len = internal.entries.len();
        let (mut lo, mut hi) = (0, len.saturating_sub(1));
        if let Some(cap) = self.internal_capacity {
            let cap = cap as usize;
            lo = lo.max(len.saturating_sub(1).saturating_sub(cap));
            hi = hi.min(cap);
        }
        let lens: Vec<usize> = internal
            .entries
            .iter()
            .map(|(k, v, _)| internal_entry_len(k, v))
            .collect();
        balanced_split(&lens, lo, hi.max(lo), true)
    }

    /// Splits a full leaf before a change that would overflow it and returns
    /// the half that `entry` belongs to, still X-latched.
    #[allow(clippy::too_many_arguments)]
    fn split_leaf(
        &self,
        txn: &Transaction,
        journal: Journal,
        path: &mut WritePath,
        handle: PageHandle,
        leaf: LeafPage,
        entry: (&[u8], &[u8]),
        added_entries: usize,
        added_bytes: usize,
    ) -> QuillStoreResult<(PageHandle, LeafPage)> {
        let page_size = self.page_size();
        let left_id = handle.page_id();
        let mid = self.leaf_split_point(&leaf.entries, added_entries);
        let mut left = leaf;
        let right_entries = left.entries.split_off(mid);
        let right_handle = self.buffer.allocate_page(LatchMode::Exclusive)?;
        let right_id = right_handle.page_id();
        let right = LeafPage {
            prev: Some(left_id),
            next: left.next,
            entries: right_entries,
        };
        left.next = Some(right_id);

        let first = right.entries.first().ok_or_else(|| {
            QuillStoreError::Internal(format!("split of {} left the right half empty", left_id))
        })?;
        let goes_right =
            self.compare_entries(entry, (first.0.as_slice(), first.1.as_slice())) != Ordering::Less;
        let target = if goes_right { &right } else { &left };
        if !self.leaf_has_room(target, added_entries, added_bytes) {
            return Err(QuillStoreError::IndexOperation(format!(
                "entry does not fit {} after a split",
                left_id
            )));
        }
        let (sep_key, sep_value) = self.separator_of(first);

        let mut change = StructureChange::default();
        if let Some(next_id) = right.next {
            let next_handle = self.buffer.fix_page(next_id, LatchMode::Exclusive)?;
            let mut next = BPlusTreePageCodec::decode_leaf(next_handle.data())?;
            next.prev = Some(right_id);
            change.stage(next_handle, BPlusTreePageCodec::encode_leaf(&next, page_size)?);
        }
        self.insert_separator(path, &mut change, sep_key, sep_value, left_id, right_id)?;
        change.stage(handle, BPlusTreePageCodec::encode_leaf(&left, page_size)?);
        change.stage_new(right_handle, BPlusTreePageCodec::encode_leaf(&right, page_size)?);
        change.apply(txn, journal)?;
        debug!(
            "split leaf {} at {} into {} of index {}",
            left_id, mid, right_id, self.meta_page_id
        );

        let (target_id, target) = if goes_right {
            (right_id, right)
        } else {
            (left_id, left)
        };
        let target_handle = change.take(target_id).ok_or_else(|| {
            QuillStoreError::Internal(format!("split lost the handle of {}", target_id))
        })?;
        Ok((target_handle, target))
    }

    /// Adds `(sep, right)` next to `left` in the parent, splitting upward as
    /// long as parents overflow and installing a new root at the top.
    fn insert_separator(
        &self,
        path: &mut WritePath,
        change: &mut StructureChange,
        mut sep_key: Vec<u8>,
        mut sep_value: Vec<u8>,
        mut left: PageId,
        mut right: PageId,
    ) -> QuillStoreResult<()> {
        let page_size = self.page_size();
        loop {
            let Some(PathNode { handle, page }) = path.nodes.pop() else {
                let Some((meta_handle, mut meta)) = path.meta.take() else {
                    return Err(QuillStoreError::Internal(format!(
                        "split of {} reached an unlatched parent",
                        left
                    )));
                };
                let root_handle = self.buffer.allocate_page(LatchMode::Exclusive)?;
                let root = InternalPage {
                    leftmost: left,
                    entries: vec![(sep_key, sep_value, right)],
                };
                meta.root = root_handle.page_id();
                debug!(
                    "new root {} for index {}",
                    root_handle.page_id(),
                    self.meta_page_id
                );
                change.stage_new(root_handle, BPlusTreePageCodec::encode_internal(&root, page_size)?);
                change.stage(meta_handle, MetaPageCodec::encode(&meta, page_size)?);
                return Ok(());
            };
            let BPlusTreePage::Internal(mut internal) = page else {
                return Err(QuillStoreError::Internal(format!(
                    "parent {} of a split is a leaf",
                    handle.page_id()
                )));
            };
            let pos = internal.position_of(left).ok_or_else(|| {
                QuillStoreError::IndexOperation(format!(
                    "page {} is not a child of {}",
                    left,
                    handle.page_id()
                ))
            })?;
            internal.entries.insert(pos, (sep_key, sep_value, right));
            if internal.fits(page_size, self.internal_capacity) {
                change.stage(handle, BPlusTreePageCodec::encode_internal(&internal, page_size)?);
                return Ok(());
            }

            let mid = self.internal_split_point(&internal);
            let mut right_entries = internal.entries.split_off(mid);
            let (up_key, up_value, right_leftmost) = right_entries.remove(0);
            let sibling = InternalPage {
                leftmost: right_leftmost,
                entries: right_entries,
            };
            if !internal.fits(page_size, self.internal_capacity)
                || !sibling.fits(page_size, self.internal_capacity)
            {
                return Err(QuillStoreError::IndexOperation(format!(
                    "separators do not fit after splitting {}",
                    handle.page_id()
                )));
            }
            let sibling_handle = self.buffer.allocate_page(LatchMode::Exclusive)?;
            left = handle.page_id();
            right = sibling_handle.page_id();
            debug!("split internal {} into {}", left, right);
            change.stage(handle, BPlusTreePageCodec::encode_internal(&internal, page_size)?);
            change.stage_new(sibling_handle, BPlusTreePageCodec::encode_internal(&sibling, page_size)?);
            sep_key = up_key;
            sep_value = up_value;
        }
    }

    /// Merges an underfull node with a sibling under the same parent and
    /// repeats one level up while parents become underfull. Nodes that do not
    /// fit together are left underfull.
    fn merge_up(
        &self,
        txn: &Transaction,
        journal: Journal,
        mut path: WritePath,
        mut node: PathNode,
    ) -> QuillStoreResult<()> {
        let page_size = self.page_size();
        let mut change = StructureChange::default();
        let mut node_dirty = false;
        loop {
            let Some(parent_node) = path.nodes.pop() else {
                self.finish_top(&mut path, &mut change, node, node_dirty)?;
                break;
            };
            if !self.node_underfull(&node.page) {
                if node_dirty {
                    change.stage(node.handle, BPlusTreePageCodec::encode(&node.page, page_size)?);
                }
                break;
            }
            let PathNode {
                handle: parent_handle,
                page: BPlusTreePage::Internal(mut parent),
            } = parent_node
            else {
                return Err(QuillStoreError::Internal(
                    "parent of a merge is a leaf".to_string(),
                ));
            };
            let node_id = node.handle.page_id();
            let pos = parent.position_of(node_id).ok_or_else(|| {
                QuillStoreError::IndexOperation(format!(
                    "page {} is not a child of {}",
                    node_id,
                    parent_handle.page_id()
                ))
            })?;
            let sibling_pos = if pos < parent.entries.len() {
                pos + 1
            } else if pos > 0 {
                pos - 1
            } else {
                if node_dirty {
                    change.stage(node.handle, BPlusTreePageCodec::encode(&node.page, page_size)?);
                }
                break;
            };
            let sibling_id = parent.child_at(sibling_pos).ok_or_else(|| {
                QuillStoreError::Internal(format!("no child {} in {}", sibling_pos, parent_handle.page_id()))
            })?;
            let sibling_handle = self.buffer.fix_page(sibling_id, LatchMode::Exclusive)?;
            let sibling_page = BPlusTreePageCodec::decode(sibling_handle.data())?;
            let sibling = PathNode {
                handle: sibling_handle,
                page: sibling_page,
            };
            let sep_index = pos.min(sibling_pos);
            let (left, right) = if sibling_pos > pos {
                (node, sibling)
            } else {
                (sibling, node)
            };
            let (sep_key, sep_value, _) = parent.entries[sep_index].clone();

            let merged = match (&left.page, &right.page) {
                (BPlusTreePage::Leaf(l), BPlusTreePage::Leaf(r)) => {
                    let mut merged = l.clone();
                    merged.entries.extend(r.entries.iter().cloned());
                    merged.next = r.next;
                    merged
                        .fits(page_size, self.leaf_capacity)
                        .then_some(BPlusTreePage::Leaf(merged))
                }
                (BPlusTreePage::Internal(l), BPlusTreePage::Internal(r)) => {
                    let mut merged = l.clone();
                    merged.entries.push((sep_key, sep_value, r.leftmost));
                    merged.entries.extend(r.entries.iter().cloned());
                    merged
                        .fits(page_size, self.internal_capacity)
                        .then_some(BPlusTreePage::Internal(merged))
                }
                _ => {
                    return Err(QuillStoreError::IndexOperation(format!(
                        "siblings {} and {} are on different levels",
                        left.handle.page_id(),
                        right.handle.page_id()
                    )))
                }
            };
            let Some(merged) = merged else {
                // the node is the one that may carry changes from below
                let own = if left.handle.page_id() == node_id { left } else { right };
                if node_dirty {
                    change.stage(own.handle, BPlusTreePageCodec::encode(&own.page, page_size)?);
                }
                break;
            };

            if let BPlusTreePage::Leaf(merged_leaf) = &merged {
                if let Some(next_id) = merged_leaf.next {
                    let next_handle = self.buffer.fix_page(next_id, LatchMode::Exclusive)?;
                    let mut next = BPlusTreePageCodec::decode_leaf(next_handle.data())?;
                    next.prev = Some(left.handle.page_id());
                    change.stage(next_handle, BPlusTreePageCodec::encode_leaf(&next, page_size)?);
                }
            }
            debug!(
                "merged {} into {} under {}",
                right.handle.page_id(),
                left.handle.page_id(),
                parent_handle.page_id()
            );
            change.stage(left.handle, BPlusTreePageCodec::encode(&merged, page_size)?);
            change.stage(right.handle, BPlusTreePageCodec::retired(page_size));
            parent.entries.remove(sep_index);
            node = PathNode {
                handle: parent_handle,
                page: BPlusTreePage::Internal(parent),
            };
            node_dirty = true;
        }
        if !change.is_empty() {
            change.apply(txn, journal)?;
        }
        Ok(())
    }

    /// Stages the topmost changed node of a merge, collapsing an internal
    /// root that is left with a single child.
    fn finish_top(
        &self,
        path: &mut WritePath,
        change: &mut StructureChange,
        node: PathNode,
        node_dirty: bool,
    ) -> QuillStoreResult<()> {
        let page_size = self.page_size();
        if let BPlusTreePage::Internal(internal) = &node.page {
            if internal.entries.is_empty() {
                if let Some((meta_handle, mut meta)) = path.meta.take() {
                    if meta.root == node.handle.page_id() {
                        debug!(
                            "root {} of index {} collapsed into {}",
                            meta.root, self.meta_page_id, internal.leftmost
                        );
                        meta.root = internal.leftmost;
                        change.stage(meta_handle, MetaPageCodec::encode(&meta, page_size)?);
                        change.stage(node.handle, BPlusTreePageCodec::retired(page_size));
                        return Ok(());
                    }
                }
            }
        }
        if node_dirty {
            change.stage(node.handle, BPlusTreePageCodec::encode(&node.page, page_size)?);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // bulk loading support

    /// Writes a bulk-built page as a structure change of its own.
    /// `allocated` tells whether the load allocated the page itself.
    pub(crate) fn write_image(
        &self,
        txn: &Transaction,
        mode: LogMode,
        handle: &mut PageHandle,
        image: Vec<u8>,
        allocated: bool,
    ) -> QuillStoreResult<()> {
        match mode {
            LogMode::Unlogged => {
                write_body(handle, &image);
                if allocated {
                    handle.assign_new_to(txn.id());
                } else {
                    handle.assign_to(txn.id());
                }
            }
            LogMode::Logged => {
                let action = PageAction::PageImage {
                    page: handle.page_id(),
                    before: handle.image(),
                    after: image.clone(),
                };
                let lsn = txn.log_image(action, txn.last_lsn())?;
                write_body(handle, &image);
                handle.set_lsn(lsn);
            }
        }
        Ok(())
    }

    /// Points the meta page at `root`.
    pub(crate) fn install_root(
        &self,
        txn: &Transaction,
        mode: LogMode,
        root: PageId,
    ) -> QuillStoreResult<()> {
        let (mut handle, mut meta) = self.read_meta(LatchMode::Exclusive)?;
        meta.root = root;
        let image = MetaPageCodec::encode(&meta, self.page_size())?;
        self.write_image(txn, mode, &mut handle, image, false)
    }

    /// The root page, when it is an empty leaf.
    pub(crate) fn empty_root(&self) -> QuillStoreResult<Option<PageId>> {
        let (_meta_handle, meta) = self.read_meta(LatchMode::Shared)?;
        let handle = self.buffer.fix_page(meta.root, LatchMode::Shared)?;
        Ok(match self.decode_node(&handle, true)? {
            BPlusTreePage::Leaf(leaf) if leaf.entries.is_empty() => Some(meta.root),
            _ => None,
        })
    }

    // ---------------------------------------------------------------------
    // undo

    /// Logical undo of a leaf change: the entry is looked up again from the
    /// meta page, since the page in the record may have been split or merged
    /// since.
    pub(crate) fn undo_leaf_change(
        &self,
        txn: &Transaction,
        record: &LogRecord,
        action: &PageAction,
    ) -> QuillStoreResult<()> {
        let journal = Journal::Compensation {
            undone: record.lsn,
            undo_next: record.prev_lsn,
        };
        let missing = || {
            QuillStoreError::Wal(format!(
                "entry changed by record {} is missing from index {}",
                record.lsn, self.meta_page_id
            ))
        };
        match action {
            PageAction::LeafInsert { key, value, .. } => {
                self.delete_entry(txn, key, Some(value), journal, false)?
                    .ok_or_else(missing)?;
            }
            PageAction::LeafDelete { key, value, .. } => {
                self.insert_entry(txn, key, value, journal)?;
            }
            PageAction::LeafUpdate { key, old_value, .. } => {
                self.update_entry(txn, key, old_value, journal)?
                    .ok_or_else(missing)?;
            }
            PageAction::PageImage { page, .. } => {
                return Err(QuillStoreError::Internal(format!(
                    "page image of {} is not a leaf change",
                    page
                )))
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // diagnostics

    /// Checks ordering, separator bounds, uniform leaf depth, page capacities
    /// and the leaf chain. Meant for quiescent trees.
    pub fn verify(&self) -> QuillStoreResult<TreeStats> {
        let root = {
            let (_handle, meta) = self.read_meta(LatchMode::Shared)?;
            meta.root
        };
        let mut walk = VerifyWalk {
            stats: TreeStats::default(),
            leaves: Vec::new(),
            leaf_depth: None,
        };
        self.verify_node(root, None, None, 1, &mut walk)?;

        for (i, (id, prev, next)) in walk.leaves.iter().enumerate() {
            let expected_prev = i.checked_sub(1).map(|p| walk.leaves[p].0);
            let expected_next = walk.leaves.get(i + 1).map(|leaf| leaf.0);
            if *prev != expected_prev || *next != expected_next {
                return Err(QuillStoreError::IndexOperation(format!(
                    "leaf {} links {:?}/{:?}, expected {:?}/{:?}",
                    id, prev, next, expected_prev, expected_next
                )));
            }
        }
        walk.stats.height = walk.leaf_depth.unwrap_or(1);
        Ok(walk.stats)
    }

    fn verify_node(
        &self,
        page_id: PageId,
        lower: Option<(Vec<u8>, Vec<u8>)>,
        upper: Option<(Vec<u8>, Vec<u8>)>,
        depth: usize,
        walk: &mut VerifyWalk,
    ) -> QuillStoreResult<()> {
        let page = {
            let handle = self.buffer.fix_page(page_id, LatchMode::Shared)?;
            self.decode_node(&handle, depth == 1)?
        };
        let page_size = self.page_size();
        let violation = |what: &str| {
            Err(QuillStoreError::IndexOperation(format!(
                "page {} {}",
                page_id, what
            )))
        };
        let in_bounds = |key: &[u8], value: &[u8]| {
            lower.as_ref().map_or(true, |(k, v)| {
                self.compare_entries((key, value), (k, v)) != Ordering::Less
            }) && upper.as_ref().map_or(true, |(k, v)| {
                self.compare_entries((key, value), (k, v)) == Ordering::Less
            })
        };
        match page {
            BPlusTreePage::Leaf(leaf) => {
                if !leaf.fits(page_size, self.leaf_capacity) {
                    return violation("exceeds its capacity");
                }
                for pair in leaf.entries.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    if self.compare_entries((&a.0, &a.1), (&b.0, &b.1)) != Ordering::Less {
                        return violation("has unsorted or duplicate entries");
                    }
                }
                if leaf.entries.iter().any(|(k, v)| !in_bounds(k, v)) {
                    return violation("has entries outside its separators");
                }
                match walk.leaf_depth {
                    None => walk.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return violation("is at a different depth than other leaves")
                    }
                    Some(_) => {}
                }
                walk.stats.leaves += 1;
                walk.stats.entries += leaf.entries.len();
                walk.leaves.push((page_id, leaf.prev, leaf.next));
            }
            BPlusTreePage::Internal(internal) => {
                if !internal.fits(page_size, self.internal_capacity) {
                    return violation("exceeds its capacity");
                }
                for pair in internal.entries.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    if self.compare_entries((&a.0, &a.1), (&b.0, &b.1)) != Ordering::Less {
                        return violation("has unsorted separators");
                    }
                }
                if internal.entries.iter().any(|(k, v, _)| !in_bounds(k, v)) {
                    return violation("has separators outside its bounds");
                }
                walk.stats.internal_pages += 1;
                let mut child_lower = lower.clone();
                let mut child = internal.leftmost;
                for (key, value, next_child) in &internal.entries {
                    let bound = Some((key.clone(), value.clone()));
                    self.verify_node(child, child_lower, bound.clone(), depth + 1, walk)?;
                    child_lower = bound;
                    child = *next_child;
                }
                self.verify_node(child, child_lower, upper, depth + 1, walk)?;
            }
        }
        Ok(())
    }
}

struct VerifyWalk {
    stats: TreeStats,
    leaves: Vec<(PageId, Option<PageId>, Option<PageId>)>,
    leaf_depth: Option<usize>,
}

/// Split index in `lo..=hi` that best balances the bytes on both sides. With
/// `skip_mid` the entry at the split index moves up and counts on neither.
fn balanced_split(lens: &[usize], lo: usize, hi: usize, skip_mid: bool) -> usize {
    let total: usize = lens.iter().sum();
    let mut best = lo;
    let mut best_diff = usize::MAX;
    let mut prefix: usize = lens[..lo.min(lens.len())].iter().sum();
    for mid in lo..=hi.min(lens.len().saturating_sub(1)) {
        let mid_len = if skip_mid { lens[mid] } else { 0 };
        let right = total - prefix - mid_len;
        let diff = prefix.abs_diff(right);
        if diff < best_diff {
            best = mid;
            best_diff = diff;
        }
        prefix += lens[mid];
    }
    best
}

/// Physical redo of a page action, skipped when the page already carries the
/// record's effect.
pub(crate) fn redo_page_action(
    buffer: &Arc<Buffer>,
    lsn: Lsn,
    action: &PageAction,
) -> QuillStoreResult<bool> {
    let page_id = action.page_id();
    let mut handle = buffer.fix_page_for_redo(page_id)?;
    if handle.lsn() >= lsn {
        return Ok(false);
    }
    let page_size = buffer.page_size();
    let bad_slot = |slot: u16| {
        QuillStoreError::Wal(format!(
            "record {} does not match slot {} of page {}",
            lsn, slot, page_id
        ))
    };
    let image = match action {
        PageAction::PageImage { after, .. } => {
            if after.len() != page_size {
                return Err(QuillStoreError::Wal(format!(
                    "record {} carries a {} byte image for {} byte pages",
                    lsn,
                    after.len(),
                    page_size
                )));
            }
            after.clone()
        }
        PageAction::LeafInsert {
            slot, key, value, ..
        } => {
            let mut leaf = BPlusTreePageCodec::decode_leaf(handle.data())?;
            if *slot as usize > leaf.entries.len() {
                return Err(bad_slot(*slot));
            }
            leaf.entries
                .insert(*slot as usize, (key.clone(), value.clone()));
            BPlusTreePageCodec::encode_leaf(&leaf, page_size)?
        }
        PageAction::LeafDelete { slot, key, .. } => {
            let mut leaf = BPlusTreePageCodec::decode_leaf(handle.data())?;
            match leaf.entries.get(*slot as usize) {
                Some((found, _)) if found == key => {
                    leaf.entries.remove(*slot as usize);
                }
                _ => return Err(bad_slot(*slot)),
            }
            BPlusTreePageCodec::encode_leaf(&leaf, page_size)?
        }
        PageAction::LeafUpdate {
            slot,
            key,
            new_value,
            ..
        } => {
            let mut leaf = BPlusTreePageCodec::decode_leaf(handle.data())?;
            match leaf.entries.get_mut(*slot as usize) {
                Some((found, value)) if found == key => *value = new_value.clone(),
                _ => return Err(bad_slot(*slot)),
            }
            BPlusTreePageCodec::encode_leaf(&leaf, page_size)?
        }
    };
    write_body(&mut handle, &image);
    handle.set_lsn(lsn);
    Ok(true)
}

/// One page of a structure change being undone.
pub(crate) struct ImageRestore<'a> {
    pub buffer: Arc<Buffer>,
    pub lsn: Lsn,
    pub page: PageId,
    pub before: &'a [u8],
    pub after: &'a [u8],
}

const RESTORE_LATCH_ATTEMPTS: u32 = 50;
const RESTORE_LATCH_BACKOFF: Duration = Duration::from_millis(2);

/// Physical undo of a structure change: every page gets its before image
/// back under a CLR. A finished change is left in place when any of its pages
/// moved on from the logged after image, since later work then depends on it,
/// or when its pages stay latched by others. A change cut short is always
/// taken back.
pub(crate) fn restore_images(
    txn: &Transaction,
    group: &ImageGroup,
    pages: &[ImageRestore<'_>],
) -> QuillStoreResult<bool> {
    for page in pages {
        let page_size = page.buffer.page_size();
        if page.before.len() != page_size || (group.complete && page.after.len() != page_size) {
            return Err(QuillStoreError::Wal(format!(
                "record {} has no usable images of {}",
                page.lsn, page.page
            )));
        }
    }
    let mut handles = if group.complete {
        match latch_restore_pages(pages)? {
            Some(handles) => handles,
            None => {
                debug!(
                    "pages of the change at lsn {} stay busy",
                    group.newest_lsn()
                );
                return Ok(false);
            }
        }
    } else {
        pages
            .iter()
            .map(|page| page.buffer.fix_page(page.page, LatchMode::Exclusive))
            .collect::<QuillStoreResult<Vec<_>>>()?
    };

    if group.complete {
        for (page, handle) in pages.iter().zip(&handles) {
            let current = &handle.data()[PAGE_LSN_LEN..];
            if current != &page.after[PAGE_LSN_LEN..] && current != &page.before[PAGE_LSN_LEN..] {
                debug!(
                    "{} moved on since lsn {}, keeping the change at lsn {}",
                    page.page,
                    page.lsn,
                    group.newest_lsn()
                );
                return Ok(false);
            }
        }
    }
    let changed: Vec<usize> = (0..pages.len())
        .filter(|&i| handles[i].data()[PAGE_LSN_LEN..] != pages[i].before[PAGE_LSN_LEN..])
        .collect();
    for (n, &i) in changed.iter().enumerate() {
        let page = &pages[i];
        let undo_next = if n + 1 == changed.len() {
            group.resume
        } else {
            group.newest_lsn()
        };
        let lsn = txn.log_clr(
            page.lsn,
            undo_next,
            PageAction::PageImage {
                page: page.page,
                before: Vec::new(),
                after: page.before.to_vec(),
            },
        )?;
        let handle = &mut handles[i];
        write_body(handle, page.before);
        handle.set_lsn(lsn);
    }
    trace!(
        "restored {} of {} pages of the change at lsn {}",
        changed.len(),
        pages.len(),
        group.newest_lsn()
    );
    Ok(true)
}

/// X-latches all pages without waiting on any of them while holding others.
fn latch_restore_pages(pages: &[ImageRestore<'_>]) -> QuillStoreResult<Option<Vec<PageHandle>>> {
    for _ in 0..RESTORE_LATCH_ATTEMPTS {
        let mut handles = Vec::with_capacity(pages.len());
        for page in pages {
            match page.buffer.try_fix_page(page.page, LatchMode::Exclusive)? {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }
        if handles.len() == pages.len() {
            return Ok(Some(handles));
        }
        drop(handles);
        thread::sleep(RESTORE_LATCH_BACKOFF);
    }
    Ok(None)
}
