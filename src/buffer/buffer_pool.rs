//! Buffer pool for a single container: frame storage, page table, replacement
//! and LSN-ordered write-back.

use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::latch::{Latch, LatchMode};
use crate::buffer::page::PageHandle;
use crate::buffer::{ContainerId, PageId};
use crate::config::BufferPoolConfig;
use crate::error::{BufferFault, QuillStoreError, QuillStoreResult};
use crate::recovery::{Lsn, WalManager, INVALID_LSN};
use crate::storage::container::Container;
use crate::transaction::TransactionId;
use crate::utils::cache::lru_k::LruKReplacer;
use crate::utils::cache::Replacer;

pub type FrameId = usize;

/// Every page stores its LSN in its first eight bytes.
pub const PAGE_LSN_LEN: usize = 8;

#[derive(Debug, Default, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
    pub lsn: Lsn,
    /// First LSN that dirtied the frame since its last write-back.
    pub rec_lsn: Option<Lsn>,
    /// Transaction owning unlogged changes on this frame.
    pub assigned_txn: Option<TransactionId>,
    /// The unlogged changes hit a page that existed before the transaction,
    /// so the frame is not evicted until the transaction ends.
    pub held_for_commit: bool,
}

pub(crate) struct Frame {
    pub(crate) latch: Latch,
    data: UnsafeCell<Box<[u8]>>,
    meta: Mutex<FrameMeta>,
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
}

enum Victim {
    Clean(FrameId),
    Dirty(FrameId),
}

pub struct Buffer {
    container: Arc<Container>,
    frames: Box<[Frame]>,
    state: Mutex<PoolState>,
    frame_released: Condvar,
    wal: Option<Arc<WalManager>>,
    config: BufferPoolConfig,
}

// Frame bytes are only touched through a PageHandle holding the frame latch
// in the matching mode while the frame is pinned.
unsafe impl Sync for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("container", &self.container.id())
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl Buffer {
    pub fn new(
        container: Arc<Container>,
        config: BufferPoolConfig,
        wal: Option<Arc<WalManager>>,
    ) -> Self {
        let page_size = container.page_size();
        let frames: Vec<Frame> = (0..config.frames.max(1))
            .map(|_| Frame {
                latch: Latch::new(),
                data: UnsafeCell::new(vec![0u8; page_size].into_boxed_slice()),
                meta: Mutex::new(FrameMeta::default()),
            })
            .collect();
        let free_list = (0..frames.len()).collect();
        Self {
            container,
            frames: frames.into_boxed_slice(),
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruKReplacer::with_k(config.lru_k.max(1)),
            }),
            frame_released: Condvar::new(),
            wal,
            config,
        }
    }

    pub fn container_id(&self) -> ContainerId {
        self.container.id()
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    pub fn page_size(&self) -> usize {
        self.container.page_size()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id]
    }

    /// Page bytes of `frame_id`.
    ///
    /// # Safety
    /// The caller must hold the frame pinned and latched (any mode) for as long
    /// as the slice lives.
    pub(crate) unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        &*self.frames[frame_id].data.get()
    }

    /// Mutable page bytes of `frame_id`.
    ///
    /// # Safety
    /// The caller must hold the frame pinned and latched in X mode, and must
    /// not create any other reference to the bytes while this one lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        &mut *self.frames[frame_id].data.get()
    }

    pub(crate) fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.frames[frame_id].meta.lock()
    }

    /// Pins `page_id` and latches it in `mode`. Blocks while no frame is
    /// evictable and fails with a capacity fault once `fix_timeout` passes.
    pub fn fix_page(self: &Arc<Self>, page_id: PageId, mode: LatchMode) -> QuillStoreResult<PageHandle> {
        if page_id.container() != self.container_id() || !self.container.is_allocated(page_id) {
            return Err(BufferFault::PageNotFound(page_id).into());
        }
        self.install(page_id, mode, true, true)?
            .ok_or_else(|| QuillStoreError::Internal(format!("fix of {} gave up", page_id)))
    }

    /// Like `fix_page`, but returns `None` instead of waiting when the page
    /// is resident and latched incompatibly.
    pub fn try_fix_page(
        self: &Arc<Self>,
        page_id: PageId,
        mode: LatchMode,
    ) -> QuillStoreResult<Option<PageHandle>> {
        if page_id.container() != self.container_id() || !self.container.is_allocated(page_id) {
            return Err(BufferFault::PageNotFound(page_id).into());
        }
        self.install(page_id, mode, true, false)
    }

    /// Allocates a fresh zeroed page in the container and returns it pinned
    /// and latched in `mode`.
    pub fn allocate_page(self: &Arc<Self>, mode: LatchMode) -> QuillStoreResult<PageHandle> {
        let page_id = self.container.allocate_page()?;
        trace!("allocated page {}", page_id);
        self.install(page_id, mode, false, true)?.ok_or_else(|| {
            QuillStoreError::Internal(format!("fix of new page {} gave up", page_id))
        })
    }

    /// Fixes a page that redo found in the log, counting it as allocated even
    /// if the container header never recorded it.
    pub fn fix_page_for_redo(self: &Arc<Self>, page_id: PageId) -> QuillStoreResult<PageHandle> {
        self.container.note_page(page_id)?;
        self.fix_page(page_id, LatchMode::Exclusive)
    }

    /// Without `wait`, a resident page whose latch is taken yields `None`.
    fn install(
        self: &Arc<Self>,
        page_id: PageId,
        mode: LatchMode,
        load: bool,
        wait: bool,
    ) -> QuillStoreResult<Option<PageHandle>> {
        let started = Instant::now();
        let deadline = started + self.config.fix_timeout;
        loop {
            let mut state = self.state.lock();
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                self.pin_locked(&mut state, frame_id);
                drop(state);
                let latch = &self.frames[frame_id].latch;
                if wait {
                    latch.latch(mode);
                } else if !latch.try_latch(mode) {
                    self.unfix(frame_id);
                    return Ok(None);
                }
                let handle = PageHandle::adopt(Arc::clone(self), frame_id, page_id, mode);
                if self.frame_meta(frame_id).page_id == page_id {
                    return Ok(Some(handle));
                }
                // the load that installed this frame failed; try again
                drop(handle);
                continue;
            }

            match self.pick_victim(&mut state) {
                Some(Victim::Clean(frame_id)) => {
                    let old = self.frame_meta(frame_id).page_id;
                    if old.is_valid() {
                        state.page_table.remove(&old);
                    }
                    state.page_table.insert(page_id, frame_id);
                    {
                        let mut meta = self.frame_meta(frame_id);
                        *meta = FrameMeta {
                            page_id,
                            pin_count: 1,
                            ..FrameMeta::default()
                        };
                    }
                    state.replacer.record_access(frame_id);
                    state.replacer.set_evictable(frame_id, false);
                    // unpinned frames are never latched, so this cannot block
                    self.frames[frame_id].latch.latch_x();
                    drop(state);
                    return self.finish_install(frame_id, page_id, mode, load).map(Some);
                }
                Some(Victim::Dirty(frame_id)) => {
                    self.pin_locked(&mut state, frame_id);
                    drop(state);
                    let flushed = self.write_back(frame_id);
                    self.unfix(frame_id);
                    flushed?;
                }
                None => {
                    if Instant::now() >= deadline {
                        return Err(BufferFault::Capacity {
                            container: self.container_id(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        }
                        .into());
                    }
                    self.frame_released.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn finish_install(
        self: &Arc<Self>,
        frame_id: FrameId,
        page_id: PageId,
        mode: LatchMode,
        load: bool,
    ) -> QuillStoreResult<PageHandle> {
        let handle = PageHandle::adopt(Arc::clone(self), frame_id, page_id, LatchMode::Exclusive);
        // SAFETY: frame pinned and X-latched by `handle`.
        let data = unsafe { self.frame_slice_mut(frame_id) };
        let loaded = if load {
            self.container.read_page(page_id, data)
        } else {
            data.fill(0);
            Ok(())
        };
        match loaded {
            Ok(()) => {
                let lsn = read_page_lsn(data);
                self.frame_meta(frame_id).lsn = lsn;
                let mut handle = handle;
                handle.relatch_from_exclusive(mode);
                Ok(handle)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.page_table.remove(&page_id);
                    self.frame_meta(frame_id).page_id = PageId::INVALID;
                }
                drop(handle);
                Err(err)
            }
        }
    }

    fn pin_locked(&self, state: &mut PoolState, frame_id: FrameId) {
        self.frame_meta(frame_id).pin_count += 1;
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
    }

    fn pick_victim(&self, state: &mut PoolState) -> Option<Victim> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Some(Victim::Clean(frame_id));
        }
        let frame_id = state.replacer.evict()?;
        let meta = self.frame_meta(frame_id);
        debug_assert_eq!(meta.pin_count, 0);
        if meta.is_dirty {
            Some(Victim::Dirty(frame_id))
        } else {
            Some(Victim::Clean(frame_id))
        }
    }

    /// Drops one pin. Called by `PageHandle` after its latch is gone.
    pub(crate) fn unfix(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let mut meta = self.frame_meta(frame_id);
        if meta.pin_count == 0 {
            panic!("pin discipline violated: unfix of unpinned frame {}", frame_id);
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            if meta.held_for_commit {
                return;
            }
            if meta.page_id.is_valid() {
                state.replacer.set_evictable(frame_id, true);
            } else {
                state.replacer.remove(frame_id);
                state.free_list.push_back(frame_id);
            }
            drop(meta);
            self.frame_released.notify_all();
        }
    }

    /// Writes a pinned frame back if it is dirty, forcing the log up to the
    /// page LSN first.
    fn write_back(&self, frame_id: FrameId) -> QuillStoreResult<bool> {
        let frame = &self.frames[frame_id];
        frame.latch.latch_s();
        let result = self.write_back_latched(frame_id);
        frame.latch.unlatch(LatchMode::Shared);
        result
    }

    pub(crate) fn write_back_latched(&self, frame_id: FrameId) -> QuillStoreResult<bool> {
        let (page_id, lsn) = {
            let meta = self.frame_meta(frame_id);
            if !meta.is_dirty {
                return Ok(false);
            }
            (meta.page_id, meta.lsn)
        };
        if let Some(wal) = &self.wal {
            if lsn != INVALID_LSN {
                wal.flush_until(lsn)?;
            }
        }
        // SAFETY: the caller holds the frame pinned and latched.
        let data = unsafe { self.frame_slice(frame_id) };
        self.container.write_page(page_id, data)?;
        let mut meta = self.frame_meta(frame_id);
        meta.is_dirty = false;
        meta.rec_lsn = None;
        meta.assigned_txn = None;
        meta.held_for_commit = false;
        trace!("wrote back page {} at lsn {}", page_id, lsn);
        Ok(true)
    }

    /// Writes `page_id` back if it is resident and dirty. Must not be called
    /// while the caller holds a U or X latch on the same page.
    pub fn flush_page(&self, page_id: PageId) -> QuillStoreResult<bool> {
        let frame_id = {
            let mut state = self.state.lock();
            let Some(&frame_id) = state.page_table.get(&page_id) else {
                return Ok(false);
            };
            self.pin_locked(&mut state, frame_id);
            frame_id
        };
        let result = self.write_back(frame_id);
        self.unfix(frame_id);
        result
    }

    fn flush_matching(&self, mut select: impl FnMut(&FrameMeta) -> bool) -> QuillStoreResult<usize> {
        let candidates: Vec<PageId> = {
            let state = self.state.lock();
            state
                .page_table
                .iter()
                .filter(|(_, frame_id)| {
                    let meta = self.frame_meta(**frame_id);
                    meta.is_dirty && select(&meta)
                })
                .map(|(page_id, _)| *page_id)
                .collect()
        };
        let mut written = 0;
        for page_id in candidates {
            if self.flush_page(page_id)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Writes back every dirty frame; returns how many were written.
    pub fn flush_all(&self) -> QuillStoreResult<usize> {
        let written = self.flush_matching(|_| true)?;
        debug!(
            "flushed {} pages of container {}",
            written,
            self.container_id()
        );
        Ok(written)
    }

    /// Forces pages carrying unlogged changes of `txn` to disk.
    pub fn flush_assigned(&self, txn: TransactionId) -> QuillStoreResult<usize> {
        self.flush_matching(|meta| meta.assigned_txn == Some(txn))
    }

    /// Lets frames held for `txn` be evicted again once it has rolled back.
    pub fn release_assigned(&self, txn: TransactionId) {
        let mut state = self.state.lock();
        let mut released = 0;
        for frame_id in 0..self.frames.len() {
            let mut meta = self.frame_meta(frame_id);
            if meta.assigned_txn != Some(txn) {
                continue;
            }
            meta.assigned_txn = None;
            if meta.held_for_commit {
                meta.held_for_commit = false;
                if meta.pin_count == 0 {
                    state.replacer.set_evictable(frame_id, true);
                    released += 1;
                }
            }
        }
        drop(state);
        if released > 0 {
            trace!("released {} frames held for txn {}", released, txn);
            self.frame_released.notify_all();
        }
    }

    pub fn sync(&self) -> QuillStoreResult<()> {
        self.container.sync()
    }

    pub fn dirty_count(&self) -> usize {
        (0..self.frames.len())
            .filter(|frame_id| self.frame_meta(*frame_id).is_dirty)
            .count()
    }

    /// Smallest recLSN over dirty frames, `None` when nothing is dirty.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        (0..self.frames.len())
            .filter_map(|frame_id| {
                let meta = self.frame_meta(frame_id);
                if meta.is_dirty {
                    meta.rec_lsn
                } else {
                    None
                }
            })
            .min()
    }

    /// Current pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|frame_id| self.frame_meta(*frame_id).pin_count)
    }

    pub fn pinned_frames(&self) -> usize {
        (0..self.frames.len())
            .filter(|frame_id| self.frame_meta(*frame_id).pin_count > 0)
            .count()
    }

    /// Log position that the next unlogged change must not be redone before.
    pub(crate) fn wal_tail(&self) -> Lsn {
        self.wal
            .as_ref()
            .map(|wal| wal.max_assigned_lsn())
            .unwrap_or(INVALID_LSN)
    }
}

pub(crate) fn read_page_lsn(data: &[u8]) -> Lsn {
    let mut raw = [0u8; PAGE_LSN_LEN];
    raw.copy_from_slice(&data[..PAGE_LSN_LEN]);
    Lsn::from_le_bytes(raw)
}

pub(crate) fn write_page_lsn(data: &mut [u8], lsn: Lsn) {
    data[..PAGE_LSN_LEN].copy_from_slice(&lsn.to_le_bytes());
}
