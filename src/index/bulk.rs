use std::cmp::Ordering;

use log::{debug, warn};

use crate::buffer::{LatchMode, PageHandle, PageId, PAGE_LSN_LEN};
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::index::btree_index::{BPlusTreeIndex, LogMode};
use crate::index::page::{BPlusTreePageCodec, InternalPage, LeafPage};
use crate::recovery::Lsn;
use crate::transaction::TxnContext;

struct OpenLeaf {
    handle: PageHandle,
    leaf: LeafPage,
}

impl OpenLeaf {
    fn id(&self) -> PageId {
        self.handle.page_id()
    }
}

/// The node of one upper level that is still taking separators.
struct LevelBuilder {
    handle: PageHandle,
    node: InternalPage,
}

/// Streams sorted entries into an empty index, writing each page once.
///
/// The existing root leaf becomes the leftmost leaf and is written last,
/// after the new root is installed, so a failed load leaves the tree as it
/// was. Besides it at most two more leaves
/// (left and right) are open. Separators of closed leaves wait in a pending
/// list that is flushed into the upper levels once it reaches the fan-out.
pub struct BulkInsertContext {
    index: BPlusTreeIndex,
    ctx: TxnContext,
    mode: LogMode,
    leftmost: Option<OpenLeaf>,
    left: Option<OpenLeaf>,
    right: Option<OpenLeaf>,
    leftmost_before: Vec<u8>,
    pending: Vec<(Vec<u8>, Vec<u8>, PageId)>,
    levels: Vec<LevelBuilder>,
    last: Option<(Vec<u8>, Vec<u8>)>,
    first_split_lsn: Option<Lsn>,
    fill_factor: f32,
    inserted: u64,
    closed: bool,
    #[cfg(test)]
    fail_before_root: bool,
}

impl std::fmt::Debug for BulkInsertContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkInsertContext")
            .field("index", &self.index.meta_page_id())
            .field("mode", &self.mode)
            .field("inserted", &self.inserted)
            .field("levels", &self.levels.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl BulkInsertContext {
    pub(crate) fn new(
        index: BPlusTreeIndex,
        ctx: TxnContext,
        mode: LogMode,
        root: PageHandle,
    ) -> Self {
        let leftmost_before = root.image();
        Self {
            index,
            ctx,
            mode,
            leftmost: Some(OpenLeaf {
                handle: root,
                leaf: LeafPage::default(),
            }),
            left: None,
            right: None,
            leftmost_before,
            pending: Vec::new(),
            levels: Vec::new(),
            last: None,
            first_split_lsn: None,
            fill_factor: 1.0,
            inserted: 0,
            closed: false,
            #[cfg(test)]
            fail_before_root: false,
        }
    }

    /// Share of each leaf filled before the next one is opened, clamped to
    /// `0.5..=1.0`.
    pub fn with_fill_factor(mut self, fill_factor: f32) -> Self {
        self.fill_factor = fill_factor.clamp(0.5, 1.0);
        self
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Appends one entry. Entries must arrive in strictly ascending index
    /// order. Any error cleans the context up and ends the load.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> QuillStoreResult<()> {
        if self.closed {
            return Err(QuillStoreError::IndexOperation(
                "bulk insert context is closed".to_string(),
            ));
        }
        let result = self.append(key, value);
        self.fail_on(result)
    }

    /// Writes the remaining pages and installs the new root.
    pub fn finish(mut self) -> QuillStoreResult<u64> {
        if self.closed {
            return Err(QuillStoreError::IndexOperation(
                "bulk insert context is closed".to_string(),
            ));
        }
        let result = self.complete();
        self.fail_on(result)?;
        self.closed = true;
        debug!(
            "bulk loaded {} entries into index {}",
            self.inserted,
            self.index.meta_page_id()
        );
        Ok(self.inserted)
    }

    /// Drops every open page and takes back whatever the load wrote.
    pub fn cleanup(&mut self) -> QuillStoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.left = None;
        self.right = None;
        self.levels.clear();
        self.pending.clear();
        let leftmost = self.leftmost.take();
        if self.mode == LogMode::Unlogged {
            if let Some(mut open) = leftmost {
                if open.handle.mode().is_none() {
                    open.handle.latch(LatchMode::Exclusive);
                }
                open.handle.data_mut()[PAGE_LSN_LEN..]
                    .copy_from_slice(&self.leftmost_before[PAGE_LSN_LEN..]);
                open.handle.assign_to(self.ctx.txn_id());
            }
        } else {
            drop(leftmost);
        }
        if let Some(savepoint) = self.first_split_lsn.take() {
            warn!(
                "undoing bulk load of index {} back to lsn {}",
                self.index.meta_page_id(),
                savepoint
            );
            self.ctx
                .manager()
                .undo(self.ctx.transaction(), savepoint)?;
        }
        Ok(())
    }

    fn fail_on<T>(&mut self, result: QuillStoreResult<T>) -> QuillStoreResult<T> {
        if let Err(err) = &result {
            if let Err(cleanup_err) = self.cleanup() {
                warn!(
                    "cleanup after failed bulk load ({}) also failed: {}",
                    err, cleanup_err
                );
            }
        }
        result
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> QuillStoreResult<()> {
        self.index.check_entry(key, value)?;
        if let Some((last_key, last_value)) = &self.last {
            if self.index.compare_entries((key, value), (last_key, last_value)) != Ordering::Greater {
                return Err(QuillStoreError::IndexOperation(
                    "bulk insert input is not strictly ascending".to_string(),
                ));
            }
        }
        let (page_size, capacity) = self.leaf_limits();
        let entry = (key.to_vec(), value.to_vec());
        let tail = self.tail()?;
        tail.leaf.entries.push(entry);
        if !tail.leaf.fits(page_size, capacity) {
            let entry = tail.leaf.entries.pop();
            self.open_leaf()?;
            let tail = self.tail()?;
            tail.leaf.entries.extend(entry);
        }
        self.last = Some((key.to_vec(), value.to_vec()));
        self.inserted += 1;
        Ok(())
    }

    fn leaf_limits(&self) -> (usize, Option<u16>) {
        let fill = self.fill_factor;
        let bytes = (self.index.page_size() as f32 * fill) as usize;
        let capacity = self
            .index
            .leaf_capacity()
            .map(|cap| ((cap as f32 * fill).ceil() as u16).clamp(1, cap));
        (bytes, capacity)
    }

    fn tail(&mut self) -> QuillStoreResult<&mut OpenLeaf> {
        self.right
            .as_mut()
            .or(self.left.as_mut())
            .or(self.leftmost.as_mut())
            .ok_or_else(|| QuillStoreError::Internal("bulk insert has no open leaf".to_string()))
    }

    /// Starts a new leaf to the right of the current tail, closing the left
    /// leaf when three are already open.
    fn open_leaf(&mut self) -> QuillStoreResult<()> {
        let handle = self
            .index
            .buffer()
            .allocate_page(LatchMode::Exclusive)?;
        let new_id = handle.page_id();
        let tail = self.tail()?;
        tail.leaf.next = Some(new_id);
        let fresh = OpenLeaf {
            handle,
            leaf: LeafPage {
                prev: Some(tail.id()),
                next: None,
                entries: Vec::new(),
            },
        };
        if self.left.is_none() {
            self.left = Some(fresh);
        } else if self.right.is_none() {
            self.right = Some(fresh);
        } else {
            let left = self.left.take();
            self.left = self.right.take();
            self.right = Some(fresh);
            if let Some(left) = left {
                self.close_leaf(left)?;
            }
        }
        Ok(())
    }

    fn write(&mut self, handle: &mut PageHandle, image: Vec<u8>, allocated: bool) -> QuillStoreResult<()> {
        if self.first_split_lsn.is_none() && self.mode == LogMode::Logged {
            self.first_split_lsn = Some(self.ctx.transaction().last_lsn());
        }
        self.index
            .write_image(self.ctx.transaction(), self.mode, handle, image, allocated)
    }

    /// Writes a non-leftmost leaf and queues its separator.
    fn close_leaf(&mut self, mut open: OpenLeaf) -> QuillStoreResult<()> {
        let first = open.leaf.entries.first().cloned().ok_or_else(|| {
            QuillStoreError::Internal(format!("bulk leaf {} is empty", open.id()))
        })?;
        let (sep_key, sep_value) = if self.index.is_unique() {
            (first.0, Vec::new())
        } else {
            first
        };
        let image = BPlusTreePageCodec::encode_leaf(&open.leaf, self.index.page_size())?;
        self.write(&mut open.handle, image, true)?;
        self.pending.push((sep_key, sep_value, open.id()));
        if self.pending.len() >= self.fan_out() {
            self.flush_pending()?;
        }
        Ok(())
    }

    fn fan_out(&self) -> usize {
        match self.index.internal_capacity() {
            Some(cap) => cap as usize,
            None => 64,
        }
    }

    fn flush_pending(&mut self) -> QuillStoreResult<()> {
        let leftmost_id = match &self.leftmost {
            Some(open) => open.id(),
            None => {
                return Err(QuillStoreError::Internal(
                    "bulk insert lost its leftmost leaf".to_string(),
                ))
            }
        };
        for (key, value, child) in std::mem::take(&mut self.pending) {
            self.add_separator(0, leftmost_id, key, value, child)?;
        }
        Ok(())
    }

    /// Adds `(key, child)` to level `level`, creating the level with
    /// `first_child` as its leftmost child when it does not exist yet.
    fn add_separator(
        &mut self,
        level: usize,
        first_child: PageId,
        key: Vec<u8>,
        value: Vec<u8>,
        child: PageId,
    ) -> QuillStoreResult<()> {
        if level == self.levels.len() {
            let handle = self
                .index
                .buffer()
                .allocate_page(LatchMode::Exclusive)?;
            self.levels.push(LevelBuilder {
                handle,
                node: InternalPage::new(first_child),
            });
        }
        let page_size = self.index.page_size();
        let capacity = self.index.internal_capacity();
        let builder = &mut self.levels[level];
        builder.node.entries.push((key, value, child));
        if builder.node.fits(page_size, capacity) {
            return Ok(());
        }

        // the new separator moves up and its child starts the next node
        let (up_key, up_value, up_child) = builder.node.entries.pop().ok_or_else(|| {
            QuillStoreError::Internal("bulk level lost its separator".to_string())
        })?;
        let handle = self
            .index
            .buffer()
            .allocate_page(LatchMode::Exclusive)?;
        let new_id = handle.page_id();
        let full = std::mem::replace(
            &mut self.levels[level],
            LevelBuilder {
                handle,
                node: InternalPage::new(up_child),
            },
        );
        let full_id = full.handle.page_id();
        self.close_level_node(full)?;
        self.add_separator(level + 1, full_id, up_key, up_value, new_id)
    }

    fn close_level_node(&mut self, mut builder: LevelBuilder) -> QuillStoreResult<()> {
        let image = BPlusTreePageCodec::encode_internal(&builder.node, self.index.page_size())?;
        self.write(&mut builder.handle, image, true)
    }

    /// Moves entries from `peer` into an underfull last leaf.
    fn balance(&self, peer: &mut LeafPage, last: &mut LeafPage) {
        let page_size = self.index.page_size();
        let capacity = self.index.leaf_capacity();
        while self
            .index
            .leaf_underfull(last.entries.len(), last.encoded_len())
        {
            let Some(moved) = peer.entries.pop() else {
                break;
            };
            last.entries.insert(0, moved);
            if peer.entries.is_empty()
                || self
                    .index
                    .leaf_underfull(peer.entries.len(), peer.encoded_len())
                || !last.fits(page_size, capacity)
            {
                let moved = last.entries.remove(0);
                peer.entries.push(moved);
                break;
            }
        }
    }

    fn take_leftmost(&mut self) -> QuillStoreResult<OpenLeaf> {
        self.leftmost.take().ok_or_else(|| {
            QuillStoreError::Internal("bulk insert lost its leftmost leaf".to_string())
        })
    }

    fn complete(&mut self) -> QuillStoreResult<()> {
        let mut leftmost = self.take_leftmost()?;
        let mut left = self.left.take();
        let mut right = self.right.take();
        match (&mut left, &mut right) {
            (Some(left), Some(right)) => self.balance(&mut left.leaf, &mut right.leaf),
            (Some(left), None) => self.balance(&mut leftmost.leaf, &mut left.leaf),
            _ => {}
        }
        let leftmost_id = leftmost.id();
        let image = BPlusTreePageCodec::encode_leaf(&leftmost.leaf, self.index.page_size())?;
        // readers holding the meta page may be waiting for the leftmost leaf,
        // so it is unlatched while the root is installed
        leftmost.handle.unlatch();
        // closing needs the leftmost id for the first level
        self.leftmost = Some(leftmost);
        for open in [left, right].into_iter().flatten() {
            self.close_leaf(open)?;
        }
        self.flush_pending()?;

        let levels = std::mem::take(&mut self.levels);
        let mut root = leftmost_id;
        for builder in levels {
            root = builder.handle.page_id();
            self.close_level_node(builder)?;
        }
        #[cfg(test)]
        if self.fail_before_root {
            return Err(QuillStoreError::Internal(
                "bulk load stopped before installing the root".to_string(),
            ));
        }
        if root != leftmost_id {
            self.index
                .install_root(self.ctx.transaction(), self.mode, root)?;
        }

        let mut leftmost = self.take_leftmost()?;
        leftmost.handle.latch(LatchMode::Exclusive);
        let written = self.write(&mut leftmost.handle, image, false);
        self.leftmost = Some(leftmost);
        written
    }
}

impl Drop for BulkInsertContext {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.cleanup() {
            warn!(
                "cleanup of unfinished bulk load into index {} failed: {}",
                self.index.meta_page_id(),
                err
            );
        }
    }
}

impl BPlusTreeIndex {
    /// Opens a bulk load. The index must be empty; it stays locked
    /// exclusively until the transaction ends.
    pub fn bulk_insert(&self, ctx: &TxnContext, mode: LogMode) -> QuillStoreResult<BulkInsertContext> {
        ctx.lock_index_exclusive(self.meta_page_id())?;
        let Some(root) = self.empty_root()? else {
            return Err(QuillStoreError::IndexOperation(format!(
                "bulk insert into index {} needs an empty index",
                self.meta_page_id()
            )));
        };
        let handle = self.buffer().fix_page(root, LatchMode::Exclusive)?;
        Ok(BulkInsertContext::new(
            self.clone(),
            ctx.clone(),
            mode,
            handle,
        ))
    }

    /// Bulk loads `entries`, which must be sorted, and returns how many were
    /// written.
    pub fn bulk_load<I>(&self, ctx: &TxnContext, entries: I, mode: LogMode) -> QuillStoreResult<u64>
    where
        I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
    {
        let mut bulk = self.bulk_insert(ctx, mode)?;
        for (key, value) in entries {
            bulk.insert(&key, &value)?;
        }
        bulk.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::btree_index::IndexOptions;
    use crate::index::test_util::{key, scan_all, value, TestEngine};

    fn entries(n: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n).map(|i| (key(i), value(i))).collect()
    }

    fn capped() -> IndexOptions {
        IndexOptions::default()
            .with_leaf_capacity(Some(8u16))
            .with_internal_capacity(Some(4u16))
    }

    #[test]
    fn bulk_load_matches_incremental_inserts() {
        let engine = TestEngine::new(1024);
        let loaded = engine.create_index(&capped());
        let inserted = engine.create_index(&capped());
        let ctx = engine.ctx();
        assert_eq!(loaded.bulk_load(&ctx, entries(700), LogMode::Logged).unwrap(), 700);
        for (k, v) in entries(700) {
            inserted.insert(&ctx, &k, &v, LogMode::Logged).unwrap();
        }
        engine.commit(&ctx);

        let stats = loaded.verify().unwrap();
        assert_eq!(stats.entries, 700);
        assert!(stats.height >= 3);
        let reader = engine.ctx();
        assert_eq!(scan_all(&loaded, &reader), scan_all(&inserted, &reader));
        assert_eq!(loaded.get(&reader, &key(321)).unwrap(), Some(value(321)));
        engine.commit(&reader);

        // the loaded tree keeps working as a regular index
        let writer = engine.ctx();
        loaded.insert(&writer, b"key00350a", b"x", LogMode::Logged).unwrap();
        for i in 0..300 {
            loaded.delete(&writer, &key(i), None, LogMode::Logged).unwrap();
        }
        engine.commit(&writer);
        assert_eq!(loaded.verify().unwrap().entries, 401);
    }

    #[test]
    fn fill_factor_leaves_room_in_leaves() {
        let engine = TestEngine::new(1024);
        let full = engine.create_index(&capped());
        let half = engine.create_index(&capped());
        let ctx = engine.ctx();
        full.bulk_load(&ctx, entries(200), LogMode::Logged).unwrap();
        let mut bulk = half
            .bulk_insert(&ctx, LogMode::Logged)
            .unwrap()
            .with_fill_factor(0.1);
        for (k, v) in entries(200) {
            bulk.insert(&k, &v).unwrap();
        }
        assert_eq!(bulk.inserted(), 200);
        bulk.finish().unwrap();
        engine.commit(&ctx);

        let full_stats = full.verify().unwrap();
        let half_stats = half.verify().unwrap();
        assert_eq!(full_stats.leaves, 25);
        assert_eq!(half_stats.leaves, 50);
        assert_eq!(half_stats.entries, 200);
    }

    #[test]
    fn unsorted_input_leaves_the_index_empty() {
        let engine = TestEngine::new(1024);
        let index = engine.create_index(&capped());
        let ctx = engine.ctx();
        let mut bulk = index.bulk_insert(&ctx, LogMode::Logged).unwrap();
        for (k, v) in entries(300) {
            bulk.insert(&k, &v).unwrap();
        }
        assert!(matches!(
            bulk.insert(&key(5), b"late"),
            Err(QuillStoreError::IndexOperation(_))
        ));
        assert!(bulk.insert(&key(400), b"after").is_err());
        drop(bulk);

        assert!(index.is_empty().unwrap());
        assert_eq!(index.verify().unwrap().entries, 0);
        // the transaction survives and can load again
        index.bulk_load(&ctx, entries(10), LogMode::Logged).unwrap();
        engine.commit(&ctx);
        assert_eq!(index.verify().unwrap().entries, 10);
    }

    #[test]
    fn abandoned_load_is_taken_back() {
        let engine = TestEngine::new(1024);
        let index = engine.create_index(&capped());
        let ctx = engine.ctx();
        let mut bulk = index.bulk_insert(&ctx, LogMode::Unlogged).unwrap();
        for (k, v) in entries(100) {
            bulk.insert(&k, &v).unwrap();
        }
        drop(bulk);
        assert!(index.is_empty().unwrap());
        engine.commit(&ctx);
        assert_eq!(index.verify().unwrap().entries, 0);
    }

    #[test]
    fn rollback_undoes_a_finished_load() {
        let engine = TestEngine::new(1024);
        let index = engine.create_index(&capped());
        let ctx = engine.ctx();
        index.bulk_load(&ctx, entries(250), LogMode::Logged).unwrap();
        assert_eq!(index.verify().unwrap().entries, 250);
        engine.txns.rollback(ctx.transaction()).unwrap();

        assert!(index.is_empty().unwrap());
        assert_eq!(index.height().unwrap(), 1);
        index.verify().unwrap();
    }

    #[test]
    fn only_empty_indexes_take_bulk_loads() {
        let engine = TestEngine::new(1024);
        let index = engine.create_index(&capped());
        let ctx = engine.ctx();
        index.insert(&ctx, b"a", b"1", LogMode::Logged).unwrap();
        engine.commit(&ctx);

        let ctx = engine.ctx();
        assert!(matches!(
            index.bulk_insert(&ctx, LogMode::Logged),
            Err(QuillStoreError::IndexOperation(_))
        ));
        engine.commit(&ctx);
    }

    #[test]
    fn unlogged_load_is_forced_at_commit() {
        let engine = TestEngine::new(1024);
        let index = engine.create_index(&capped().with_unique(false));
        index.buffer().flush_all().unwrap();
        let ctx = engine.ctx();
        let sorted: Vec<_> = (0..50u32)
            .flat_map(|i| (0..3u8).map(move |v| (key(i), vec![v])))
            .collect();
        index.bulk_load(&ctx, sorted.clone(), LogMode::Unlogged).unwrap();
        engine.commit(&ctx);
        assert_eq!(index.buffer().dirty_count(), 0);
        let reader = engine.ctx();
        assert_eq!(scan_all(&index, &reader), sorted);
        engine.commit(&reader);
    }

    #[test]
    fn load_failing_before_the_root_leaves_pages_untouched() {
        for mode in [LogMode::Unlogged, LogMode::Logged] {
            let engine = TestEngine::new(1024);
            let index = engine.create_index(&capped());
            let meta_id = index.meta_page_id();
            let leftmost_id = index.empty_root().unwrap().unwrap();
            let body = |page_id: PageId| {
                let handle = index.buffer().fix_page(page_id, LatchMode::Shared).unwrap();
                handle.data()[PAGE_LSN_LEN..].to_vec()
            };
            let (meta_before, leaf_before) = (body(meta_id), body(leftmost_id));

            let ctx = engine.ctx();
            let mut bulk = index.bulk_insert(&ctx, mode).unwrap();
            bulk.fail_before_root = true;
            for (k, v) in entries(300) {
                bulk.insert(&k, &v).unwrap();
            }
            assert!(matches!(bulk.finish(), Err(QuillStoreError::Internal(_))));

            assert_eq!(body(meta_id), meta_before, "{:?}", mode);
            assert_eq!(body(leftmost_id), leaf_before, "{:?}", mode);
            assert!(index.is_empty().unwrap());
            engine.commit(&ctx);
            assert_eq!(index.verify().unwrap().entries, 0);
        }
    }
}
