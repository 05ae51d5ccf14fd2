pub mod buffer_manager;
pub mod buffer_pool;
pub mod latch;
pub mod page;
pub mod page_id;

pub use buffer_manager::BufferManager;
pub use buffer_pool::{Buffer, FrameId, FrameMeta, PAGE_LSN_LEN};
pub use latch::{Latch, LatchMode};
pub use page::PageHandle;
pub use page_id::{ContainerId, PageId, PageNo};
