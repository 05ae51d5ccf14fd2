use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::random;
use serde::{Deserialize, Serialize};

use crate::error::{io_fault, QuillStoreError, QuillStoreResult};
use crate::recovery::{Lsn, INVALID_LSN};

const CONTROL_FILE: &str = "quill.control";
const FORMAT_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 4;

/// What restart needs before it can read the log: where the last checkpoint
/// record is and whether the previous run closed cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFileSnapshot {
    pub system_id: u128,
    pub page_size: u32,
    pub last_checkpoint_lsn: Lsn,
    pub clean_shutdown: bool,
}

#[derive(Serialize, Deserialize)]
struct OnDisk {
    version: u32,
    state: ControlFileSnapshot,
}

/// The control file lives next to the log. Every update rewrites it through
/// a temporary file and a rename, and a trailing CRC rejects torn copies.
#[derive(Debug)]
pub struct ControlFileManager {
    path: PathBuf,
    state: Mutex<ControlFileSnapshot>,
}

impl ControlFileManager {
    /// Loads the control file of `directory`, creating it for a new database.
    /// An existing database must be opened with the page size it was
    /// created with.
    pub fn load_or_init(directory: &Path, page_size: usize) -> QuillStoreResult<Self> {
        fs::create_dir_all(directory).map_err(io_fault(directory.display().to_string()))?;
        let path = directory.join(CONTROL_FILE);
        if !path.exists() {
            let manager = Self {
                path,
                state: Mutex::new(ControlFileSnapshot {
                    system_id: random::<u128>(),
                    page_size: page_size as u32,
                    last_checkpoint_lsn: INVALID_LSN,
                    clean_shutdown: true,
                }),
            };
            manager.persist()?;
            return Ok(manager);
        }

        let state = decode(&fs::read(&path).map_err(io_fault(path.display().to_string()))?)?;
        if state.page_size as usize != page_size {
            return Err(QuillStoreError::Internal(format!(
                "database uses {} byte pages, not {}",
                state.page_size, page_size
            )));
        }
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn snapshot(&self) -> ControlFileSnapshot {
        *self.state.lock()
    }

    pub fn record_checkpoint(&self, lsn: Lsn) -> QuillStoreResult<()> {
        self.update(|state| state.last_checkpoint_lsn = lsn)
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> QuillStoreResult<()> {
        self.update(|state| state.clean_shutdown = clean)
    }

    fn update(&self, change: impl FnOnce(&mut ControlFileSnapshot)) -> QuillStoreResult<()> {
        change(&mut self.state.lock());
        self.persist()
    }

    fn persist(&self) -> QuillStoreResult<()> {
        let bytes = encode(self.snapshot())?;
        let tmp = self.path.with_extension("tmp");
        let fault = io_fault(tmp.display().to_string());
        let mut file = File::create(&tmp).map_err(io_fault(tmp.display().to_string()))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(fault)?;
        fs::rename(&tmp, &self.path).map_err(io_fault(self.path.display().to_string()))
    }
}

fn encode(state: ControlFileSnapshot) -> QuillStoreResult<Vec<u8>> {
    let mut bytes = bincode::serialize(&OnDisk {
        version: FORMAT_VERSION,
        state,
    })?;
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> QuillStoreResult<ControlFileSnapshot> {
    let corrupt = |what: &str| QuillStoreError::Internal(format!("control file {}", what));
    if bytes.len() < CHECKSUM_LEN {
        return Err(corrupt("is truncated"));
    }
    let (body, tail) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let mut crc = [0u8; CHECKSUM_LEN];
    crc.copy_from_slice(tail);
    if crc32fast::hash(body) != u32::from_le_bytes(crc) {
        return Err(corrupt("fails its checksum"));
    }
    let on_disk: OnDisk = bincode::deserialize(body)?;
    if on_disk.version != FORMAT_VERSION {
        return Err(corrupt(&format!("has unknown version {}", on_disk.version)));
    }
    Ok(on_disk.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn state_survives_reload() {
        let dir = TempDir::new().unwrap();
        let first = ControlFileManager::load_or_init(dir.path(), 4096).unwrap();
        let id = first.snapshot().system_id;
        assert!(first.snapshot().clean_shutdown);
        first.record_checkpoint(1234).unwrap();
        first.set_clean_shutdown(false).unwrap();
        drop(first);

        let again = ControlFileManager::load_or_init(dir.path(), 4096).unwrap();
        assert_eq!(
            again.snapshot(),
            ControlFileSnapshot {
                system_id: id,
                page_size: 4096,
                last_checkpoint_lsn: 1234,
                clean_shutdown: false,
            }
        );
        assert!(ControlFileManager::load_or_init(dir.path(), 8192).is_err());
    }

    #[test]
    fn damaged_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        ControlFileManager::load_or_init(dir.path(), 4096).unwrap();
        let path = dir.path().join(CONTROL_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[6] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(ControlFileManager::load_or_init(dir.path(), 4096).is_err());
        fs::write(&path, b"ab").unwrap();
        assert!(ControlFileManager::load_or_init(dir.path(), 4096).is_err());
    }
}
