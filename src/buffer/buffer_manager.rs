//! BufferManager owns one `Buffer` per running container.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::buffer::buffer_pool::Buffer;
use crate::buffer::latch::LatchMode;
use crate::buffer::page::PageHandle;
use crate::buffer::{ContainerId, PageId};
use crate::config::BufferPoolConfig;
use crate::error::{io_fault, BufferFault, QuillStoreError, QuillStoreResult};
use crate::recovery::{Lsn, WalManager};
use crate::storage::container::Container;

const CONTAINER_FILE_PREFIX: &str = "container_";
const CONTAINER_FILE_SUFFIX: &str = ".qsc";

#[derive(Debug)]
pub struct BufferManager {
    directory: PathBuf,
    config: BufferPoolConfig,
    wal: Option<Arc<WalManager>>,
    buffers: DashMap<ContainerId, Arc<Buffer>>,
    running: AtomicBool,
}

impl BufferManager {
    pub fn new(
        directory: impl Into<PathBuf>,
        config: BufferPoolConfig,
        wal: Option<Arc<WalManager>>,
    ) -> Self {
        Self {
            directory: directory.into(),
            config,
            wal,
            buffers: DashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> BufferPoolConfig {
        self.config
    }

    pub fn wal(&self) -> Option<&Arc<WalManager>> {
        self.wal.as_ref()
    }

    pub fn start(&self) -> QuillStoreResult<()> {
        fs::create_dir_all(&self.directory)
            .map_err(io_fault(format!("buffer directory {}", self.directory.display())))?;
        self.running.store(true, Ordering::Release);
        info!("buffer manager started in {}", self.directory.display());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn container_path(&self, container: ContainerId) -> PathBuf {
        self.directory.join(format!(
            "{}{:08}{}",
            CONTAINER_FILE_PREFIX, container, CONTAINER_FILE_SUFFIX
        ))
    }

    /// Container ids with a file in the buffer directory.
    pub fn existing_containers(&self) -> QuillStoreResult<Vec<ContainerId>> {
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(err) => return Err(io_fault(self.directory.display().to_string())(err)),
        };
        for entry in entries {
            let entry = entry.map_err(io_fault(self.directory.display().to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let parsed = name
                .strip_prefix(CONTAINER_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(CONTAINER_FILE_SUFFIX))
                .and_then(|digits| digits.parse::<ContainerId>().ok());
            if let Some(id) = parsed {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Creates a new container file and starts its buffer.
    pub fn create_buffer(
        &self,
        container: ContainerId,
        path: Option<PathBuf>,
        config: BufferPoolConfig,
    ) -> QuillStoreResult<Arc<Buffer>> {
        self.check_startable(container)?;
        let path = path.unwrap_or_else(|| self.container_path(container));
        let file = Container::create(
            &path,
            container,
            config.page_size,
            config.initial_extent,
            config.grow_extent,
        )?;
        self.register(file, config)
    }

    /// Starts the buffer of an existing container, creating the file if it
    /// does not exist yet.
    pub fn start_buffer(
        &self,
        container: ContainerId,
        path: Option<PathBuf>,
        config: BufferPoolConfig,
    ) -> QuillStoreResult<Arc<Buffer>> {
        self.check_startable(container)?;
        let path = path.unwrap_or_else(|| self.container_path(container));
        let file = if Path::new(&path).exists() {
            Container::open(&path, container, config.page_size)?
        } else {
            Container::create(
                &path,
                container,
                config.page_size,
                config.initial_extent,
                config.grow_extent,
            )?
        };
        self.register(file, config)
    }

    pub fn create_container(&self, container: ContainerId) -> QuillStoreResult<Arc<Buffer>> {
        self.create_buffer(container, None, self.config)
    }

    pub fn start_container(&self, container: ContainerId) -> QuillStoreResult<Arc<Buffer>> {
        self.start_buffer(container, None, self.config)
    }

    /// Running buffer of `container`, starting it first if needed.
    pub fn get_or_start_container(&self, container: ContainerId) -> QuillStoreResult<Arc<Buffer>> {
        match self.get_buffer(container) {
            Err(QuillStoreError::Buffer(BufferFault::ContainerNotFound(_))) => {
                match self.start_container(container) {
                    // another thread started it first
                    Err(QuillStoreError::Buffer(BufferFault::AlreadyExists(_))) => {
                        self.get_buffer(container)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn check_startable(&self, container: ContainerId) -> QuillStoreResult<()> {
        if container == 0 {
            return Err(QuillStoreError::Internal(
                "container 0 is reserved".to_string(),
            ));
        }
        if !self.is_running() {
            return Err(QuillStoreError::Internal(
                "buffer manager is not running".to_string(),
            ));
        }
        if self.buffers.contains_key(&container) {
            return Err(BufferFault::AlreadyExists(container).into());
        }
        Ok(())
    }

    fn register(&self, file: Container, config: BufferPoolConfig) -> QuillStoreResult<Arc<Buffer>> {
        let container = file.id();
        let buffer = Arc::new(Buffer::new(Arc::new(file), config, self.wal.clone()));
        match self.buffers.entry(container) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BufferFault::AlreadyExists(container).into()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(buffer.clone());
                debug!(
                    "started buffer for container {} with {} frames",
                    container,
                    buffer.capacity()
                );
                Ok(buffer)
            }
        }
    }

    pub fn get_buffer(&self, container: ContainerId) -> QuillStoreResult<Arc<Buffer>> {
        self.buffers
            .get(&container)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BufferFault::ContainerNotFound(container).into())
    }

    pub fn get_buffer_for(&self, page_id: PageId) -> QuillStoreResult<Arc<Buffer>> {
        self.get_buffer(page_id.container())
    }

    pub fn get_buffers(&self) -> Vec<Arc<Buffer>> {
        let mut buffers: Vec<_> = self
            .buffers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        buffers.sort_by_key(|buffer| buffer.container_id());
        buffers
    }

    pub fn fix_page(&self, page_id: PageId, mode: LatchMode) -> QuillStoreResult<PageHandle> {
        self.get_buffer_for(page_id)?.fix_page(page_id, mode)
    }

    pub fn allocate_page(&self, container: ContainerId, mode: LatchMode) -> QuillStoreResult<PageHandle> {
        self.get_buffer(container)?.allocate_page(mode)
    }

    /// Stops a container's buffer. Without `force` it refuses while dirty
    /// pages remain; with `force` everything is written back first.
    pub fn stop_buffer(&self, container: ContainerId, force: bool) -> QuillStoreResult<()> {
        let buffer = self.get_buffer(container)?;
        if force {
            buffer.flush_all()?;
        } else {
            let count = buffer.dirty_count();
            if count > 0 {
                return Err(BufferFault::DirtyPages { container, count }.into());
            }
        }
        buffer.sync()?;
        let pinned = buffer.pinned_frames();
        if pinned > 0 {
            warn!(
                "stopping container {} with {} pinned frames",
                container, pinned
            );
        }
        self.buffers.remove(&container);
        debug!("stopped buffer for container {}", container);
        Ok(())
    }

    /// Stops every container, force-flushing each.
    pub fn shutdown(&self) -> QuillStoreResult<()> {
        let ids: Vec<ContainerId> = self.buffers.iter().map(|entry| *entry.key()).collect();
        let mut first_err = None;
        for id in ids {
            if let Err(err) = self.stop_buffer(id, true) {
                warn!("failed to stop container {}: {}", id, err);
                first_err.get_or_insert(err);
            }
        }
        self.running.store(false, Ordering::Release);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Writes back every dirty frame of every buffer and syncs the files.
    pub fn sync_all(&self) -> QuillStoreResult<()> {
        for buffer in self.get_buffers() {
            buffer.flush_all()?;
            buffer.sync()?;
        }
        Ok(())
    }

    /// Minimum recLSN over all dirty frames of all buffers, recomputed on every
    /// call. `None` means no frame is dirty.
    pub fn check_min_redo_lsn(&self) -> Option<Lsn> {
        self.get_buffers()
            .iter()
            .filter_map(|buffer| buffer.min_rec_lsn())
            .min()
    }

    /// Drops every buffer without writing anything back, as a crash would.
    pub fn discard_all(&self) {
        self.buffers.clear();
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> BufferManager {
        let config = BufferPoolConfig::default()
            .with_frames(8usize)
            .with_page_size(512usize)
            .with_fix_timeout(Duration::from_millis(50));
        let manager = BufferManager::new(dir.path(), config, None);
        manager.start().unwrap();
        manager
    }

    #[test]
    fn unknown_and_duplicate_containers() {
        let dir = TempDir::new().unwrap();
        let bm = manager(&dir);
        assert!(matches!(
            bm.get_buffer(3).unwrap_err(),
            QuillStoreError::Buffer(BufferFault::ContainerNotFound(3))
        ));
        bm.create_container(3).unwrap();
        assert!(matches!(
            bm.create_container(3).unwrap_err(),
            QuillStoreError::Buffer(BufferFault::AlreadyExists(3))
        ));
        assert!(matches!(
            bm.start_container(3).unwrap_err(),
            QuillStoreError::Buffer(BufferFault::AlreadyExists(3))
        ));
        assert_eq!(bm.get_buffer(3).unwrap().container_id(), 3);
        assert_eq!(bm.existing_containers().unwrap(), vec![3]);
    }

    #[test]
    fn stop_refuses_dirty_pages_unless_forced() {
        let dir = TempDir::new().unwrap();
        let bm = manager(&dir);
        bm.create_container(1).unwrap();
        let page_id = {
            let mut handle = bm.allocate_page(1, LatchMode::Exclusive).unwrap();
            handle.data_mut()[64] = 9;
            handle.set_lsn(77);
            handle.page_id()
        };
        assert!(matches!(
            bm.stop_buffer(1, false).unwrap_err(),
            QuillStoreError::Buffer(BufferFault::DirtyPages { container: 1, count: 1 })
        ));
        bm.stop_buffer(1, true).unwrap();
        assert!(bm.get_buffer(1).is_err());

        bm.start_container(1).unwrap();
        let handle = bm.fix_page(page_id, LatchMode::Shared).unwrap();
        assert_eq!(handle.data()[64], 9);
        assert_eq!(handle.lsn(), 77);
    }

    #[test]
    fn min_redo_lsn_spans_buffers() {
        let dir = TempDir::new().unwrap();
        let bm = manager(&dir);
        bm.create_container(1).unwrap();
        bm.create_container(2).unwrap();
        assert_eq!(bm.check_min_redo_lsn(), None);

        let first = {
            let mut handle = bm.allocate_page(1, LatchMode::Exclusive).unwrap();
            handle.set_lsn(40);
            handle.page_id()
        };
        {
            let mut handle = bm.allocate_page(2, LatchMode::Exclusive).unwrap();
            handle.set_lsn(90);
        }
        assert_eq!(bm.check_min_redo_lsn(), Some(40));

        bm.get_buffer_for(first).unwrap().flush_page(first).unwrap();
        assert_eq!(bm.check_min_redo_lsn(), Some(90));

        bm.sync_all().unwrap();
        assert_eq!(bm.check_min_redo_lsn(), None);
        bm.shutdown().unwrap();
        assert!(bm.get_buffers().is_empty());
    }
}
