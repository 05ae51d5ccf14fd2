use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::buffer::PageId;
use crate::error::QuillStoreResult;
use crate::index::BPlusTreeIndex;

#[derive(Debug)]
struct RegisteredIndex {
    index: BPlusTreeIndex,
    leases: AtomicUsize,
}

/// Open index handles keyed by meta page. One registry belongs to one
/// database and is handed to whoever opens indexes.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    inner: DashMap<PageId, Arc<RegisteredIndex>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Checks out the handle for `meta_page_id`, opening it with `open` when
    /// it is not registered yet.
    pub fn lease<F>(&self, meta_page_id: PageId, open: F) -> QuillStoreResult<IndexLease>
    where
        F: FnOnce() -> QuillStoreResult<BPlusTreeIndex>,
    {
        if let Some(entry) = self.inner.get(&meta_page_id) {
            return Ok(IndexLease::acquire(entry.value().clone()));
        }
        let index = open()?;
        let entry = self
            .inner
            .entry(meta_page_id)
            .or_insert_with(|| {
                Arc::new(RegisteredIndex {
                    index,
                    leases: AtomicUsize::new(0),
                })
            })
            .value()
            .clone();
        Ok(IndexLease::acquire(entry))
    }

    pub fn unregister(&self, meta_page_id: PageId) -> bool {
        self.inner.remove(&meta_page_id).is_some()
    }

    /// Drops handles nobody holds a lease on. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        let before = self.inner.len();
        self.inner
            .retain(|_, entry| entry.leases.load(Ordering::Acquire) > 0);
        let evicted = before.saturating_sub(self.inner.len());
        if evicted > 0 {
            debug!("evicted {} idle index handles", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn lease_count(&self, meta_page_id: PageId) -> Option<usize> {
        self.inner
            .get(&meta_page_id)
            .map(|entry| entry.leases.load(Ordering::Acquire))
    }
}

/// A checked-out index handle. The registry keeps the handle while any lease
/// is alive; transactions park a lease on their cleanup list so it is
/// returned when they finish.
#[derive(Debug)]
pub struct IndexLease {
    entry: Arc<RegisteredIndex>,
}

impl IndexLease {
    fn acquire(entry: Arc<RegisteredIndex>) -> Self {
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }

    pub fn index(&self) -> &BPlusTreeIndex {
        &self.entry.index
    }
}

impl Clone for IndexLease {
    fn clone(&self) -> Self {
        Self::acquire(self.entry.clone())
    }
}

impl Deref for IndexLease {
    type Target = BPlusTreeIndex;

    fn deref(&self) -> &BPlusTreeIndex {
        &self.entry.index
    }
}

impl Drop for IndexLease {
    fn drop(&mut self) {
        self.entry.leases.fetch_sub(1, Ordering::AcqRel);
    }
}
