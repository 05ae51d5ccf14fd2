use std::sync::Arc;

use crate::buffer::buffer_pool::{read_page_lsn, write_page_lsn, Buffer, FrameId, FrameMeta};
use crate::buffer::latch::LatchMode;
use crate::buffer::PageId;
use crate::recovery::Lsn;
use crate::transaction::TransactionId;

/// A pinned frame together with its latch. Dropping the handle releases the
/// latch (if still held) and then the pin, on every exit path.
pub struct PageHandle {
    buffer: Arc<Buffer>,
    frame_id: FrameId,
    page_id: PageId,
    mode: Option<LatchMode>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame_id)
            .field("mode", &self.mode)
            .finish()
    }
}

impl PageHandle {
    /// Wraps a frame that is already pinned and latched in `mode`.
    pub(crate) fn adopt(
        buffer: Arc<Buffer>,
        frame_id: FrameId,
        page_id: PageId,
        mode: LatchMode,
    ) -> Self {
        Self {
            buffer,
            frame_id,
            page_id,
            mode: Some(mode),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn mode(&self) -> Option<LatchMode> {
        self.mode
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn data(&self) -> &[u8] {
        if self.mode.is_none() {
            panic!("latch misuse: reading page {} without a latch", self.page_id);
        }
        // SAFETY: pinned and latched.
        unsafe { self.buffer.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        if self.mode != Some(LatchMode::Exclusive) {
            panic!(
                "latch misuse: writing page {} in mode {:?}",
                self.page_id, self.mode
            );
        }
        // SAFETY: pinned and X-latched; the returned borrow is tied to &mut self.
        unsafe { self.buffer.frame_slice_mut(self.frame_id) }
    }

    /// Copy of the current page bytes.
    pub fn image(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    pub fn lsn(&self) -> Lsn {
        read_page_lsn(self.data())
    }

    /// Stamps the page with `lsn` and marks it dirty.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        write_page_lsn(self.data_mut(), lsn);
        let mut meta = self.buffer.frame_meta(self.frame_id);
        meta.lsn = lsn;
        meta.is_dirty = true;
        meta.rec_lsn.get_or_insert(lsn);
    }

    /// Marks the page dirty without a log record behind the change.
    pub fn mark_dirty(&mut self) {
        let tail = self.buffer.wal_tail();
        let mut meta = self.buffer.frame_meta(self.frame_id);
        meta.is_dirty = true;
        meta.rec_lsn.get_or_insert(tail);
    }

    /// Marks an unlogged change owned by `txn`; the page is forced at commit
    /// and stays resident until then.
    pub fn assign_to(&mut self, txn: TransactionId) {
        self.mark_dirty();
        let mut meta = self.buffer.frame_meta(self.frame_id);
        meta.assigned_txn = Some(txn);
        meta.held_for_commit = true;
    }

    /// Unlogged change to a page `txn` allocated itself. Such a page may be
    /// written back early, since nothing outside the transaction refers to
    /// it yet.
    pub fn assign_new_to(&mut self, txn: TransactionId) {
        self.mark_dirty();
        let mut meta = self.buffer.frame_meta(self.frame_id);
        meta.assigned_txn = Some(txn);
    }

    /// Replaces the page bytes and stamps `lsn` on top of the image.
    pub fn overwrite(&mut self, image: &[u8], lsn: Option<Lsn>) {
        let data = self.data_mut();
        data.copy_from_slice(image);
        match lsn {
            Some(lsn) => self.set_lsn(lsn),
            None => {
                let lsn = read_page_lsn(self.data());
                self.buffer.frame_meta(self.frame_id).lsn = lsn;
                self.mark_dirty();
            }
        }
    }

    pub fn meta(&self) -> FrameMeta {
        self.buffer.frame_meta(self.frame_id).clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.meta().is_dirty
    }

    pub fn pin_count(&self) -> u32 {
        self.meta().pin_count
    }

    /// Writes the page back while holding it in S, U or X mode.
    pub fn flush(&self) -> crate::error::QuillStoreResult<bool> {
        if self.mode.is_none() {
            panic!("latch misuse: flushing page {} without a latch", self.page_id);
        }
        self.buffer.write_back_latched(self.frame_id)
    }

    /// Re-latches a page whose latch was released with `unlatch`.
    pub fn latch(&mut self, mode: LatchMode) {
        if self.mode.is_some() {
            panic!("latch misuse: page {} is already latched", self.page_id);
        }
        self.buffer.frame(self.frame_id).latch.latch(mode);
        self.mode = Some(mode);
    }

    /// Conditional re-latch; returns false instead of blocking.
    pub fn try_latch(&mut self, mode: LatchMode) -> bool {
        if self.mode.is_some() {
            panic!("latch misuse: page {} is already latched", self.page_id);
        }
        let acquired = self.buffer.frame(self.frame_id).latch.try_latch(mode);
        if acquired {
            self.mode = Some(mode);
        }
        acquired
    }

    fn expect_mode(&self, op: &str, allowed: &[LatchMode]) {
        if !self.mode.map_or(false, |mode| allowed.contains(&mode)) {
            panic!(
                "latch misuse: {} on page {} held in mode {:?}",
                op, self.page_id, self.mode
            );
        }
    }

    /// Upgrade of this handle's own U latch.
    pub fn up_x(&mut self) {
        self.expect_mode("up_x", &[LatchMode::Update]);
        self.buffer.frame(self.frame_id).latch.up_x();
        self.mode = Some(LatchMode::Exclusive);
    }

    pub fn down_s(&mut self) {
        self.expect_mode("down_s", &[LatchMode::Update, LatchMode::Exclusive]);
        self.buffer.frame(self.frame_id).latch.down_s();
        self.mode = Some(LatchMode::Shared);
    }

    pub fn down_u(&mut self) {
        self.expect_mode("down_u", &[LatchMode::Exclusive]);
        self.buffer.frame(self.frame_id).latch.down_u();
        self.mode = Some(LatchMode::Update);
    }

    /// Releases the latch but keeps the pin.
    pub fn unlatch(&mut self) {
        match self.mode.take() {
            Some(mode) => self.buffer.frame(self.frame_id).latch.unlatch(mode),
            None => panic!("latch misuse: page {} is not latched", self.page_id),
        }
    }

    pub(crate) fn relatch_from_exclusive(&mut self, mode: LatchMode) {
        match mode {
            LatchMode::Exclusive => {}
            LatchMode::Update => self.down_u(),
            LatchMode::Shared => self.down_s(),
        }
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Some(mode) = self.mode.take() {
            self.buffer.frame(self.frame_id).latch.unlatch(mode);
        }
        self.buffer.unfix(self.frame_id);
    }
}
