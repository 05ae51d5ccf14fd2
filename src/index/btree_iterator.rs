use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;

use crate::buffer::PageId;
use crate::error::QuillStoreResult;
use crate::index::btree_index::{BPlusTreeIndex, SearchKey};
use crate::index::page::LeafPage;
use crate::transaction::{ReadLockGuard, TxnContext};

/// Range scan over the leaf chain. Each leaf is copied out under a short S
/// latch; the next leaf is reached through its link, or by a fresh descent
/// when the link no longer leads where it did.
pub struct TreeIndexIterator {
    index: BPlusTreeIndex,
    ctx: TxnContext,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    lock_keys: bool,
    _scan_lock: ReadLockGuard,
    batch: VecDeque<(Vec<u8>, Vec<u8>)>,
    current: Option<PageId>,
    next_leaf: Option<PageId>,
    last: Option<(Vec<u8>, Vec<u8>)>,
    started: bool,
    done: bool,
}

impl std::fmt::Debug for TreeIndexIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIndexIterator")
            .field("index", &self.index.meta_page_id())
            .field("current", &self.current)
            .field("buffered", &self.batch.len())
            .field("done", &self.done)
            .finish()
    }
}

impl TreeIndexIterator {
    pub(crate) fn new(
        index: BPlusTreeIndex,
        ctx: TxnContext,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
        lock_keys: bool,
        scan_lock: ReadLockGuard,
    ) -> Self {
        Self {
            index,
            ctx,
            start,
            end,
            lock_keys,
            _scan_lock: scan_lock,
            batch: VecDeque::new(),
            current: None,
            next_leaf: None,
            last: None,
            started: false,
            done: false,
        }
    }

    fn load(&mut self, page_id: PageId, leaf: LeafPage, skip: usize) {
        self.current = Some(page_id);
        self.next_leaf = leaf.next;
        self.batch = leaf.entries.into_iter().skip(skip).collect();
    }

    /// Positions on the first entry after the last one returned, or at the
    /// start bound before anything was returned.
    fn descend(&mut self) -> QuillStoreResult<()> {
        let index = &self.index;
        let (handle, leaf, skip) = match (&self.last, &self.start) {
            (Some((key, value)), _) => {
                let search = SearchKey::Entry(key, value);
                let (handle, leaf) = index.find_leaf_read(search)?;
                let mut pos = index.leaf_position(&leaf, search);
                while leaf.entries.get(pos).map_or(false, |(k, v)| {
                    index.compare_search(search, k, v) == Ordering::Equal
                }) {
                    pos += 1;
                }
                (handle, leaf, pos)
            }
            (None, Bound::Unbounded) => {
                let (handle, leaf) = index.find_leaf_read(SearchKey::First)?;
                (handle, leaf, 0)
            }
            (None, Bound::Included(key) | Bound::Excluded(key)) => {
                let search = SearchKey::Key(key);
                let (handle, leaf) = index.find_leaf_read(search)?;
                let pos = index.leaf_position(&leaf, search);
                (handle, leaf, pos)
            }
        };
        let page_id = handle.page_id();
        drop(handle);
        self.load(page_id, leaf, skip);
        Ok(())
    }

    fn advance(&mut self) -> QuillStoreResult<bool> {
        if !self.started {
            self.started = true;
            self.descend()?;
            return Ok(true);
        }
        let (Some(current), Some(next)) = (self.current, self.next_leaf) else {
            return Ok(false);
        };
        match self.index.follow_link(current, next)? {
            Some((handle, leaf)) => {
                let page_id = handle.page_id();
                drop(handle);
                self.load(page_id, leaf, 0);
            }
            None => self.descend()?,
        }
        Ok(true)
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Excluded(start) => self.index.compare_keys(key, start) != Ordering::Greater,
            Bound::Included(start) => self.index.compare_keys(key, start) == Ordering::Less,
            Bound::Unbounded => false,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => self.index.compare_keys(key, end) == Ordering::Greater,
            Bound::Excluded(end) => self.index.compare_keys(key, end) != Ordering::Less,
            Bound::Unbounded => false,
        }
    }

    /// Locks the key and reads the entry again, since it may have changed
    /// while the lock was awaited.
    fn confirm(&self, key: Vec<u8>, value: Vec<u8>) -> QuillStoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let guard = self
            .ctx
            .lock_key_read(self.index.meta_page_id(), &key)?;
        let current = if self.index.is_unique() {
            self.index.lookup(&key)?.map(|value| (key, value))
        } else if self.index.contains_entry(&key, &value)? {
            Some((key, value))
        } else {
            None
        };
        guard.release();
        Ok(current)
    }

    fn next_entry(&mut self) -> QuillStoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some((key, value)) = self.batch.pop_front() else {
                if !self.advance()? {
                    return Ok(None);
                }
                continue;
            };
            if self.before_start(&key) {
                continue;
            }
            if self.past_end(&key) {
                return Ok(None);
            }
            self.last = Some((key.clone(), value.clone()));
            if !self.lock_keys {
                return Ok(Some((key, value)));
            }
            if let Some(entry) = self.confirm(key, value)? {
                return Ok(Some(entry));
            }
        }
    }
}

impl Iterator for TreeIndexIterator {
    type Item = QuillStoreResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::index::btree_index::{IndexOptions, LogMode};
    use crate::index::test_util::{key, scan_all, value, TestEngine};
    use crate::transaction::IsolationLevel;

    fn capped() -> IndexOptions {
        IndexOptions::default()
            .with_leaf_capacity(Some(4u16))
            .with_internal_capacity(Some(4u16))
    }

    #[test]
    fn scan_survives_merges_behind_it() {
        let engine = TestEngine::new(512);
        let index = engine.create_index(&capped());
        let ctx = engine.ctx();
        for i in 0..100 {
            index.insert(&ctx, &key(i), &value(i), LogMode::Logged).unwrap();
        }
        let mut scan = index.scan(&ctx, ..).unwrap();
        let mut seen: Vec<_> = scan.by_ref().take(10).map(|e| e.unwrap().0).collect();
        for i in 20..60 {
            index.delete(&ctx, &key(i), None, LogMode::Logged).unwrap();
        }
        seen.extend(scan.map(|e| e.unwrap().0));
        let expected: Vec<_> = (0..20).chain(60..100).map(key).collect();
        assert_eq!(seen, expected);
        engine.commit(&ctx);
    }

    #[test]
    fn dirty_reads_follow_isolation() {
        let engine = TestEngine::new(512);
        let index = engine.create_index(&capped());
        let setup = engine.ctx();
        for i in (0..20).filter(|i| i % 2 == 0) {
            index.insert(&setup, &key(i), &value(i), LogMode::Logged).unwrap();
        }
        engine.commit(&setup);

        let writer = engine.ctx();
        index.insert(&writer, &key(7), b"uncommitted", LogMode::Logged).unwrap();

        let dirty = engine.ctx_with(IsolationLevel::ReadUncommitted);
        assert_eq!(scan_all(&index, &dirty).len(), 11);

        let reader = {
            let index = index.clone();
            let txns = engine.txns.clone();
            thread::spawn(move || {
                let txn = txns.begin(IsolationLevel::ReadCommitted, 1).unwrap();
                let ctx = crate::transaction::TxnContext::new(txns.clone(), txn);
                let found = scan_all(&index, &ctx);
                txns.commit(ctx.transaction()).unwrap();
                found
            })
        };
        thread::sleep(Duration::from_millis(100));
        engine.txns.rollback(writer.transaction()).unwrap();
        let found = reader.join().unwrap();
        assert_eq!(found.len(), 10);
        assert!(found.iter().all(|(k, _)| k != &key(7)));
    }
}
