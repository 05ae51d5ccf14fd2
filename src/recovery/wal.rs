//! Append-only write-ahead log. A record's LSN is its byte offset in the log
//! file; offsets below `WAL_FILE_HEADER_LEN` are never assigned, so LSN 0
//! means "none".

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::background::{spawn_periodic_worker, WorkerHandle, WorkerKind};
use crate::config::WalConfig;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::recovery::wal_record::{decode_frame, encode_frame, frame_len, LogBody, LogRecord};
use crate::recovery::Lsn;
use crate::transaction::TransactionId;

const WAL_MAGIC: &[u8; 8] = b"QSWAL001";
pub const WAL_FILE_HEADER_LEN: u64 = 16;
pub const FIRST_LSN: Lsn = WAL_FILE_HEADER_LEN;

#[derive(Debug)]
struct WalTail {
    next_lsn: Lsn,
    /// LSN of the first byte in `pending`.
    pending_start: Lsn,
    pending: Vec<u8>,
}

#[derive(Debug)]
pub struct WalManager {
    path: PathBuf,
    config: WalConfig,
    // Ordering lock: held only to assign an LSN and queue the frame.
    tail: Mutex<WalTail>,
    // Serializes writers of the log file.
    writer: Mutex<File>,
    reader: Mutex<File>,
    next_lsn: AtomicU64,
    durable_lsn: AtomicU64,
}

impl WalManager {
    /// Opens or creates the log in `directory`. A torn or corrupt tail left by
    /// a crash is cut off.
    pub fn open(directory: &Path, config: WalConfig) -> QuillStoreResult<Self> {
        std::fs::create_dir_all(directory)?;
        let path = directory.join(&config.file_name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let end = if len == 0 {
            let mut header = [0u8; WAL_FILE_HEADER_LEN as usize];
            header[..8].copy_from_slice(WAL_MAGIC);
            file.write_all(&header)?;
            file.sync_all()?;
            FIRST_LSN
        } else {
            let mut header = [0u8; WAL_FILE_HEADER_LEN as usize];
            file.read_exact(&mut header)?;
            if &header[..8] != WAL_MAGIC {
                return Err(QuillStoreError::Wal(format!(
                    "{} is not a log file",
                    path.display()
                )));
            }
            let end = scan_valid_end(&path)?;
            if end < len {
                warn!(
                    "truncating {} bytes of torn log tail at {}",
                    len - end,
                    end
                );
                file.set_len(end)?;
                file.sync_all()?;
            }
            end
        };
        file.seek(SeekFrom::Start(end))?;
        let reader = File::open(&path)?;
        info!("opened log {} at lsn {}", path.display(), end);
        Ok(Self {
            path,
            config,
            tail: Mutex::new(WalTail {
                next_lsn: end,
                pending_start: end,
                pending: Vec::new(),
            }),
            writer: Mutex::new(file),
            reader: Mutex::new(reader),
            next_lsn: AtomicU64::new(end),
            durable_lsn: AtomicU64::new(end),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// LSN the next appended record will receive.
    #[inline]
    pub fn max_assigned_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::Acquire)
    }

    /// Every record starting below this LSN is on stable storage.
    #[inline]
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn append(
        &self,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        body: &LogBody,
    ) -> QuillStoreResult<Lsn> {
        let frame = encode_frame(prev_lsn, undo_next_lsn, txn_id, body)?;
        let (lsn, should_flush) = {
            let mut tail = self.tail.lock();
            let lsn = tail.next_lsn;
            tail.next_lsn += frame.len() as u64;
            tail.pending.extend_from_slice(&frame);
            self.next_lsn.store(tail.next_lsn, Ordering::Release);
            (lsn, tail.pending.len() >= self.config.buffer_bytes)
        };
        if should_flush {
            self.flush_until(lsn)?;
        }
        Ok(lsn)
    }

    /// Makes the record at `lsn`, and everything before it, durable.
    pub fn flush_until(&self, lsn: Lsn) -> QuillStoreResult<Lsn> {
        if self.durable_lsn() > lsn {
            return Ok(self.durable_lsn());
        }
        self.flush()
    }

    /// Writes out everything appended so far.
    pub fn flush(&self) -> QuillStoreResult<Lsn> {
        let mut file = self.writer.lock();
        let (start, bytes) = {
            let mut tail = self.tail.lock();
            let start = tail.pending_start;
            let bytes = std::mem::take(&mut tail.pending);
            tail.pending_start = tail.next_lsn;
            (start, bytes)
        };
        if bytes.is_empty() {
            return Ok(self.durable_lsn());
        }
        file.seek(SeekFrom::Start(start))?;
        file.write_all(&bytes)?;
        if self.config.sync_on_flush {
            file.sync_data()?;
        }
        let durable = start + bytes.len() as u64;
        self.durable_lsn.store(durable, Ordering::Release);
        debug!("log durable through {}", durable);
        Ok(durable)
    }

    /// Random access by LSN, used when walking a transaction's chain backward.
    pub fn read_record(&self, lsn: Lsn) -> QuillStoreResult<LogRecord> {
        if lsn < FIRST_LSN || lsn >= self.max_assigned_lsn() {
            return Err(QuillStoreError::Wal(format!("no record at lsn {}", lsn)));
        }
        self.flush_until(lsn)?;
        let mut file = self.reader.lock();
        read_frame_at(&mut file, lsn)?
            .ok_or_else(|| QuillStoreError::Wal(format!("record {} is missing", lsn)))
    }

    /// Forward reader starting at `from` (clamped to the first record).
    pub fn reader(&self, from: Lsn) -> QuillStoreResult<WalReader> {
        self.flush()?;
        WalReader::open(&self.path, from.max(FIRST_LSN))
    }

    pub fn start_background_flush(self: &Arc<Self>, interval: Duration) -> Option<WorkerHandle> {
        if interval.is_zero() {
            return None;
        }
        let wal = Arc::downgrade(self);
        spawn_periodic_worker("walwriter", WorkerKind::WalWriter, interval, move || {
            if let Some(wal) = wal.upgrade() {
                if let Err(err) = wal.flush() {
                    warn!("background log flush failed: {}", err);
                }
            }
        })
    }
}

/// Sequential reader over log records. Stops at the first missing, torn or
/// corrupt frame.
#[derive(Debug)]
pub struct WalReader {
    file: File,
    next: Lsn,
}

impl WalReader {
    fn open(path: &Path, from: Lsn) -> QuillStoreResult<Self> {
        Ok(Self {
            file: File::open(path)?,
            next: from,
        })
    }

    pub fn next_record(&mut self) -> QuillStoreResult<Option<LogRecord>> {
        match read_frame_at(&mut self.file, self.next) {
            Ok(Some(record)) => {
                // the cursor now sits right after the frame
                self.next = self.file.stream_position()?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(QuillStoreError::Wal(msg)) => {
                debug!("log scan stopped at {}: {}", self.next, msg);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Offset just past the last record returned.
    pub fn position(&self) -> Lsn {
        self.next
    }
}

impl Iterator for WalReader {
    type Item = QuillStoreResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn read_frame_at(file: &mut File, lsn: Lsn) -> QuillStoreResult<Option<LogRecord>> {
    file.seek(SeekFrom::Start(lsn))?;
    let mut prefix = [0u8; 4];
    match file.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = frame_len(&prefix);
    if len < crate::recovery::wal_record::FRAME_HEADER_LEN {
        return Err(QuillStoreError::Wal(format!(
            "record {} has impossible length {}",
            lsn, len
        )));
    }
    let mut frame = vec![0u8; len];
    frame[..4].copy_from_slice(&prefix);
    match file.read_exact(&mut frame[4..]) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(QuillStoreError::Wal(format!("record {} is torn", lsn)))
        }
        Err(err) => return Err(err.into()),
    }
    decode_frame(lsn, &frame).map(Some)
}

fn scan_valid_end(path: &Path) -> QuillStoreResult<Lsn> {
    let mut reader = WalReader::open(path, FIRST_LSN)?;
    while reader.next_record()?.is_some() {}
    Ok(reader.position())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageId;
    use crate::recovery::wal_record::PageAction;
    use std::thread;
    use tempfile::TempDir;

    fn config() -> WalConfig {
        WalConfig {
            writer_interval: None,
            ..WalConfig::default()
        }
    }

    fn insert(slot: u16) -> LogBody {
        LogBody::Page(PageAction::LeafInsert {
            index: PageId::new(1, 1),
            page: PageId::new(1, 2),
            slot,
            key: vec![slot as u8],
            value: b"value".to_vec(),
        })
    }

    #[test]
    fn lsns_are_offsets_and_strictly_increasing() {
        let dir = TempDir::new().unwrap();
        let wal = WalManager::open(dir.path(), config()).unwrap();
        let first = wal.append(1, 0, 0, &LogBody::Begin).unwrap();
        let second = wal.append(1, first, 0, &insert(0)).unwrap();
        assert_eq!(first, FIRST_LSN);
        assert!(second > first);
        assert!(wal.durable_lsn() <= second);
        wal.flush_until(second).unwrap();
        assert!(wal.durable_lsn() > second);

        let record = wal.read_record(second).unwrap();
        assert_eq!(record.prev_lsn, first);
        assert_eq!(record.body, insert(0));
    }

    #[test]
    fn read_record_flushes_pending_tail() {
        let dir = TempDir::new().unwrap();
        let wal = WalManager::open(dir.path(), config()).unwrap();
        let lsn = wal.append(4, 0, 0, &LogBody::Commit).unwrap();
        assert_eq!(wal.read_record(lsn).unwrap().txn_id, 4);
        assert!(wal.read_record(lsn + 1).is_err());
    }

    #[test]
    fn reopen_cuts_torn_tail() {
        let dir = TempDir::new().unwrap();
        let kept = {
            let wal = WalManager::open(dir.path(), config()).unwrap();
            let a = wal.append(1, 0, 0, &LogBody::Begin).unwrap();
            let b = wal.append(1, a, 0, &insert(1)).unwrap();
            wal.flush().unwrap();
            b
        };
        // simulate a half-written frame
        {
            let path = dir.path().join(config().file_name);
            let mut file = OpenOptions::new().append(true).open(path).unwrap();
            file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }
        let wal = WalManager::open(dir.path(), config()).unwrap();
        let records: Vec<_> = wal
            .reader(FIRST_LSN)
            .unwrap()
            .collect::<QuillStoreResult<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].lsn, kept);
        let next = wal.append(2, 0, 0, &LogBody::Begin).unwrap();
        assert_eq!(next, wal.read_record(next).unwrap().lsn);
        assert!(next > kept);
    }

    #[test]
    fn concurrent_appends_get_distinct_ordered_lsns() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(WalManager::open(dir.path(), config()).unwrap());
        let handles: Vec<_> = (0..4u64)
            .map(|txn| {
                let wal = wal.clone();
                thread::spawn(move || {
                    let mut prev = 0;
                    let mut lsns = Vec::new();
                    for slot in 0..50 {
                        prev = wal.append(txn + 1, prev, 0, &insert(slot)).unwrap();
                        lsns.push(prev);
                    }
                    lsns
                })
            })
            .collect();
        let mut all = Vec::new();
        for handle in handles {
            let lsns = handle.join().unwrap();
            assert!(lsns.windows(2).all(|w| w[0] < w[1]));
            all.extend(lsns);
        }
        let scanned: Vec<Lsn> = wal
            .reader(FIRST_LSN)
            .unwrap()
            .map(|r| r.unwrap().lsn)
            .collect();
        all.sort_unstable();
        assert_eq!(scanned, all);
    }
}
