use bytes::BufMut;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

// WAL frame
// +---------+---------+--------------+------------------+---------+------+--------+
// | len(4)  | crc(4)  | prev_lsn(8)  | undo_next_lsn(8) | txn(8)  | kind | body   |
// +---------+---------+--------------+------------------+---------+------+--------+
// - all integers little-endian; len counts the whole frame
// - the record's LSN is the byte offset of the frame in the log file and is
//   not stored in the frame
// - crc covers everything after the crc field

use crate::buffer::PageId;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::recovery::Lsn;
use crate::transaction::TransactionId;

pub const FRAME_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    End = 4,
    Page = 5,
    Clr = 6,
    Checkpoint = 7,
}

impl RecordKind {
    fn from_u8(value: u8) -> QuillStoreResult<Self> {
        Ok(match value {
            1 => RecordKind::Begin,
            2 => RecordKind::Commit,
            3 => RecordKind::Abort,
            4 => RecordKind::End,
            5 => RecordKind::Page,
            6 => RecordKind::Clr,
            7 => RecordKind::Checkpoint,
            other => {
                return Err(QuillStoreError::Wal(format!(
                    "unknown record kind {}",
                    other
                )))
            }
        })
    }
}

/// A change to one page that can be redone and undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    LeafInsert {
        index: PageId,
        page: PageId,
        slot: u16,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    LeafDelete {
        index: PageId,
        page: PageId,
        slot: u16,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    LeafUpdate {
        index: PageId,
        page: PageId,
        slot: u16,
        key: Vec<u8>,
        old_value: Vec<u8>,
        new_value: Vec<u8>,
    },
    /// Full before/after images, used for splits, merges, root changes and
    /// bulk-loaded pages.
    PageImage {
        page: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
}

impl PageAction {
    pub fn page_id(&self) -> PageId {
        match self {
            PageAction::LeafInsert { page, .. }
            | PageAction::LeafDelete { page, .. }
            | PageAction::LeafUpdate { page, .. }
            | PageAction::PageImage { page, .. } => *page,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            PageAction::LeafInsert { .. } => 1,
            PageAction::LeafDelete { .. } => 2,
            PageAction::LeafUpdate { .. } => 3,
            PageAction::PageImage { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBody {
    /// Transactions running when the checkpoint was taken, with their last LSN.
    pub active: Vec<(TransactionId, Lsn)>,
    /// Where redo has to start for this checkpoint to be usable.
    pub redo_lsn: Lsn,
    /// Lower bound for transaction ids handed out after restart.
    pub next_txn_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogBody {
    Begin,
    Commit,
    Abort,
    End,
    Page(PageAction),
    /// Compensation for the record at `undone_lsn`; `action` is redo-only.
    Clr { undone_lsn: Lsn, action: PageAction },
    Checkpoint(CheckpointBody),
}

impl LogBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogBody::Begin => RecordKind::Begin,
            LogBody::Commit => RecordKind::Commit,
            LogBody::Abort => RecordKind::Abort,
            LogBody::End => RecordKind::End,
            LogBody::Page(_) => RecordKind::Page,
            LogBody::Clr { .. } => RecordKind::Clr,
            LogBody::Checkpoint(_) => RecordKind::Checkpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub undo_next_lsn: Lsn,
    pub txn_id: TransactionId,
    pub body: LogBody,
}

pub fn encode_frame(
    prev_lsn: Lsn,
    undo_next_lsn: Lsn,
    txn_id: TransactionId,
    body: &LogBody,
) -> QuillStoreResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + 64);
    frame.put_u32_le(0);
    frame.put_u32_le(0);
    frame.put_u64_le(prev_lsn);
    frame.put_u64_le(undo_next_lsn);
    frame.put_u64_le(txn_id);
    frame.put_u8(body.kind() as u8);
    match body {
        LogBody::Begin | LogBody::Commit | LogBody::Abort | LogBody::End => {}
        LogBody::Page(action) => encode_action(&mut frame, action),
        LogBody::Clr { undone_lsn, action } => {
            frame.put_u64_le(*undone_lsn);
            encode_action(&mut frame, action);
        }
        LogBody::Checkpoint(checkpoint) => {
            frame.extend_from_slice(&bincode::serialize(checkpoint)?);
        }
    }
    let len = u32::try_from(frame.len())
        .map_err(|_| QuillStoreError::Wal(format!("record of {} bytes", frame.len())))?;
    frame[0..4].copy_from_slice(&len.to_le_bytes());
    let mut hasher = Hasher::new();
    hasher.update(&frame[8..]);
    frame[4..8].copy_from_slice(&hasher.finalize().to_le_bytes());
    Ok(frame)
}

/// Frame length from the first four bytes of a frame.
pub fn frame_len(prefix: &[u8; 4]) -> usize {
    u32::from_le_bytes(*prefix) as usize
}

pub fn decode_frame(lsn: Lsn, frame: &[u8]) -> QuillStoreResult<LogRecord> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(QuillStoreError::Wal(format!("record {} truncated", lsn)));
    }
    let mut reader = FieldReader::new(frame, lsn);
    let len = reader.u32()? as usize;
    if len != frame.len() {
        return Err(QuillStoreError::Wal(format!(
            "record {} length {} does not match frame of {}",
            lsn,
            len,
            frame.len()
        )));
    }
    let crc = reader.u32()?;
    let mut hasher = Hasher::new();
    hasher.update(&frame[8..]);
    if hasher.finalize() != crc {
        return Err(QuillStoreError::Wal(format!("record {} failed crc", lsn)));
    }
    let prev_lsn = reader.u64()?;
    let undo_next_lsn = reader.u64()?;
    let txn_id = reader.u64()?;
    let kind = RecordKind::from_u8(reader.u8()?)?;
    let body = match kind {
        RecordKind::Begin => LogBody::Begin,
        RecordKind::Commit => LogBody::Commit,
        RecordKind::Abort => LogBody::Abort,
        RecordKind::End => LogBody::End,
        RecordKind::Page => LogBody::Page(decode_action(&mut reader)?),
        RecordKind::Clr => {
            let undone_lsn = reader.u64()?;
            LogBody::Clr {
                undone_lsn,
                action: decode_action(&mut reader)?,
            }
        }
        RecordKind::Checkpoint => LogBody::Checkpoint(bincode::deserialize(reader.rest())?),
    };
    Ok(LogRecord {
        lsn,
        prev_lsn,
        undo_next_lsn,
        txn_id,
        body,
    })
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn encode_action(buf: &mut Vec<u8>, action: &PageAction) {
    buf.put_u8(action.tag());
    match action {
        PageAction::LeafInsert {
            index,
            page,
            slot,
            key,
            value,
        }
        | PageAction::LeafDelete {
            index,
            page,
            slot,
            key,
            value,
        } => {
            buf.extend_from_slice(&index.encode());
            buf.extend_from_slice(&page.encode());
            buf.put_u16_le(*slot);
            put_bytes(buf, key);
            put_bytes(buf, value);
        }
        PageAction::LeafUpdate {
            index,
            page,
            slot,
            key,
            old_value,
            new_value,
        } => {
            buf.extend_from_slice(&index.encode());
            buf.extend_from_slice(&page.encode());
            buf.put_u16_le(*slot);
            put_bytes(buf, key);
            put_bytes(buf, old_value);
            put_bytes(buf, new_value);
        }
        PageAction::PageImage {
            page,
            before,
            after,
        } => {
            buf.extend_from_slice(&page.encode());
            put_bytes(buf, before);
            put_bytes(buf, after);
        }
    }
}

fn decode_action(reader: &mut FieldReader<'_>) -> QuillStoreResult<PageAction> {
    let tag = reader.u8()?;
    Ok(match tag {
        1 | 2 => {
            let index = reader.page_id()?;
            let page = reader.page_id()?;
            let slot = reader.u16()?;
            let key = reader.bytes()?;
            let value = reader.bytes()?;
            if tag == 1 {
                PageAction::LeafInsert {
                    index,
                    page,
                    slot,
                    key,
                    value,
                }
            } else {
                PageAction::LeafDelete {
                    index,
                    page,
                    slot,
                    key,
                    value,
                }
            }
        }
        3 => PageAction::LeafUpdate {
            index: reader.page_id()?,
            page: reader.page_id()?,
            slot: reader.u16()?,
            key: reader.bytes()?,
            old_value: reader.bytes()?,
            new_value: reader.bytes()?,
        },
        4 => PageAction::PageImage {
            page: reader.page_id()?,
            before: reader.bytes()?,
            after: reader.bytes()?,
        },
        other => {
            return Err(QuillStoreError::Wal(format!(
                "record {} has unknown page action {}",
                reader.lsn, other
            )))
        }
    })
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    lsn: Lsn,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8], lsn: Lsn) -> Self {
        Self { buf, pos: 0, lsn }
    }

    fn take(&mut self, n: usize) -> QuillStoreResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(QuillStoreError::Wal(format!(
                "record {} ends before its body",
                self.lsn
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> QuillStoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> QuillStoreResult<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> QuillStoreResult<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> QuillStoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn page_id(&mut self) -> QuillStoreResult<PageId> {
        let mut raw = [0u8; PageId::ENCODED_LEN];
        raw.copy_from_slice(self.take(PageId::ENCODED_LEN)?);
        PageId::decode(&raw)
            .ok_or_else(|| QuillStoreError::Wal(format!("record {} names no page", self.lsn)))
    }

    fn bytes(&mut self) -> QuillStoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
