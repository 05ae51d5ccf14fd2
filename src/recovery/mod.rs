pub mod control_file;
pub mod recovery_manager;
pub mod resource_manager;
pub mod wal;
pub mod wal_record;

pub type Lsn = u64;

/// No record; valid LSNs start at `wal::FIRST_LSN`.
pub const INVALID_LSN: Lsn = 0;

pub use control_file::{ControlFileManager, ControlFileSnapshot};
pub use recovery_manager::{RecoveryManager, RecoverySummary};
pub use resource_manager::{ImageGroup, IndexResourceManager, ResourceManager};
pub use wal::{WalManager, WalReader, FIRST_LSN};
pub use wal_record::{CheckpointBody, LogBody, LogRecord, PageAction};
