use thiserror::Error;

use crate::buffer::{ContainerId, PageId};
use crate::transaction::TransactionId;

pub type QuillStoreResult<T, E = QuillStoreError> = Result<T, E>;

/// Failures raised by the buffer layer. Every variant names the container or
/// page it concerns.
#[derive(Debug, Error)]
pub enum BufferFault {
    #[error("container {0} is not running")]
    ContainerNotFound(ContainerId),

    #[error("container {0} already exists")]
    AlreadyExists(ContainerId),

    #[error("page {0} does not exist")]
    PageNotFound(PageId),

    #[error("no evictable frame in container {container} after {waited_ms} ms")]
    Capacity { container: ContainerId, waited_ms: u64 },

    #[error("container {container} still has {count} dirty pages")]
    DirtyPages { container: ContainerId, count: usize },

    #[error("I/O failure on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum QuillStoreError {
    #[error("Buffer fault: {0}")]
    Buffer(#[from] BufferFault),

    #[error("Index operation error: {0}")]
    IndexOperation(String),

    #[error("Index access error: {0}")]
    IndexAccess(String),

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Transaction {0} was aborted to break a deadlock")]
    Deadlock(TransactionId),

    #[error("Transaction {0} timed out waiting for a lock")]
    LockTimeout(TransactionId),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuillStoreError {
    /// I/O failures leave the transaction alone; every other error rolls back
    /// an implicit transaction.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            QuillStoreError::Io(_) | QuillStoreError::Buffer(BufferFault::Io { .. })
        )
    }

    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            QuillStoreError::Deadlock(_) | QuillStoreError::LockTimeout(_)
        )
    }
}

pub(crate) fn io_fault(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> QuillStoreError {
    let context = context.into();
    move |source| BufferFault::Io { context, source }.into()
}
