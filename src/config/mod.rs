use std::path::PathBuf;
use std::time::Duration;

use derive_with::With;

use crate::transaction::IsolationLevel;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, With)]
pub struct BufferPoolConfig {
    /// Frames per container buffer.
    pub frames: usize,
    pub page_size: usize,
    pub lru_k: usize,
    /// Pages reserved when a container file is created.
    pub initial_extent: u32,
    /// Pages appended whenever allocation runs past the end of the file.
    pub grow_extent: u32,
    /// How long a fix waits for an evictable frame before failing.
    pub fix_timeout: Duration,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            frames: 1024,
            page_size: DEFAULT_PAGE_SIZE,
            lru_k: 2,
            initial_extent: 64,
            grow_extent: 64,
            fix_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, With)]
pub struct WalConfig {
    pub file_name: String,
    /// Buffered bytes that trigger a flush from the appending thread.
    pub buffer_bytes: usize,
    /// Period of the background writer; `None` keeps flushing on demand only.
    pub writer_interval: Option<Duration>,
    pub sync_on_flush: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            file_name: "quill.wal".to_string(),
            buffer_bytes: 64 * 1024,
            writer_interval: Some(Duration::from_millis(20)),
            sync_on_flush: true,
        }
    }
}

#[derive(Debug, Clone, Copy, With)]
pub struct LockConfig {
    /// Upper bound on a single lock wait; `None` waits until granted or aborted.
    pub lock_timeout: Option<Duration>,
    /// Granularity at which blocked requests re-check their abort flag.
    pub wait_slice: Duration,
    /// Period of the background deadlock detector; `None` disables it.
    pub deadlock_interval: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            lock_timeout: Some(Duration::from_secs(30)),
            wait_slice: Duration::from_millis(10),
            deadlock_interval: Some(Duration::from_millis(50)),
        }
    }
}

#[derive(Debug, Clone, Copy, With)]
pub struct BTreeConfig {
    /// Entry cap for leaves; `None` fills leaves by bytes only.
    pub leaf_capacity: Option<u16>,
    /// Separator cap for internal pages; `None` fills by bytes only.
    pub internal_capacity: Option<u16>,
    /// Fraction of a leaf that bulk loading fills before opening the next one.
    pub bulk_fill_factor: f32,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        BTreeConfig {
            leaf_capacity: None,
            internal_capacity: None,
            bulk_fill_factor: 0.9,
        }
    }
}

#[derive(Debug, Clone, With)]
pub struct DatabaseOptions {
    pub path: PathBuf,
    pub buffer: BufferPoolConfig,
    pub wal: WalConfig,
    pub lock: LockConfig,
    pub btree: BTreeConfig,
    pub checkpoint_interval: Option<Duration>,
    pub default_isolation: IsolationLevel,
    /// 0 locks whole indexes, anything higher locks individual keys.
    pub default_lock_depth: u8,
}

impl DatabaseOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DatabaseOptions {
            path: path.into(),
            buffer: BufferPoolConfig::default(),
            wal: WalConfig::default(),
            lock: LockConfig::default(),
            btree: BTreeConfig::default(),
            checkpoint_interval: Some(Duration::from_secs(30)),
            default_isolation: IsolationLevel::RepeatableRead,
            default_lock_depth: 1,
        }
    }
}

#[derive(Debug, Clone, With)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "127.0.0.1:7070".to_string(),
            max_payload: 1 << 20,
        }
    }
}
