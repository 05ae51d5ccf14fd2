//! File-backed page container. One file per container; page 0 of the file is
//! the container header, data pages are numbered from 1.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;

use crate::buffer::{ContainerId, PageId, PageNo};
use crate::error::{io_fault, BufferFault, QuillStoreError, QuillStoreResult};

const CONTAINER_MAGIC: u32 = 0x5153_434e; // "QSCN"
const CONTAINER_VERSION: u16 = 1;
// magic(4) version(2) page_size(4) id(4) next_page(4) capacity(4) grow(4)
const HEADER_LEN: usize = 26;
pub const FIRST_DATA_PAGE: PageNo = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContainerHeader {
    page_size: u32,
    id: ContainerId,
    /// Next page number to hand out; pages below it are allocated.
    next_page: PageNo,
    /// Pages the file currently has room for, header page included.
    capacity: PageNo,
    grow_extent: u32,
}

impl ContainerHeader {
    fn encode(&self, page_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        buf[0..4].copy_from_slice(&CONTAINER_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&CONTAINER_VERSION.to_le_bytes());
        buf[6..10].copy_from_slice(&self.page_size.to_le_bytes());
        buf[10..14].copy_from_slice(&self.id.to_le_bytes());
        buf[14..18].copy_from_slice(&self.next_page.to_le_bytes());
        buf[18..22].copy_from_slice(&self.capacity.to_le_bytes());
        buf[22..26].copy_from_slice(&self.grow_extent.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> QuillStoreResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(QuillStoreError::Internal(
                "container header truncated".to_string(),
            ));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        if u32_at(0) != CONTAINER_MAGIC {
            return Err(QuillStoreError::Internal(
                "container header has a bad magic number".to_string(),
            ));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != CONTAINER_VERSION {
            return Err(QuillStoreError::Internal(format!(
                "unsupported container version {}",
                version
            )));
        }
        Ok(Self {
            page_size: u32_at(6),
            id: u32_at(10),
            next_page: u32_at(14),
            capacity: u32_at(18),
            grow_extent: u32_at(22),
        })
    }
}

#[derive(Debug)]
struct ContainerFile {
    file: File,
    header: ContainerHeader,
}

#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    path: PathBuf,
    page_size: usize,
    inner: Mutex<ContainerFile>,
}

impl Container {
    /// Creates a fresh container file with room for `initial_extent` data
    /// pages. Fails if the file already exists.
    pub fn create(
        path: &Path,
        id: ContainerId,
        page_size: usize,
        initial_extent: u32,
        grow_extent: u32,
    ) -> QuillStoreResult<Self> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BufferFault::AlreadyExists(id).into())
            }
            Err(err) => return Err(io_fault(format!("container {} ({})", id, path.display()))(err)),
        };
        let header = ContainerHeader {
            page_size: page_size as u32,
            id,
            next_page: FIRST_DATA_PAGE,
            capacity: initial_extent.max(1) + 1,
            grow_extent: grow_extent.max(1),
        };
        let container = Self {
            id,
            path: path.to_path_buf(),
            page_size,
            inner: Mutex::new(ContainerFile { file, header }),
        };
        {
            let mut inner = container.inner.lock();
            let len = header.capacity as u64 * page_size as u64;
            inner
                .file
                .set_len(len)
                .map_err(io_fault(format!("container {} extent", id)))?;
            container.write_header(&mut inner)?;
            inner
                .file
                .sync_all()
                .map_err(io_fault(format!("container {} sync", id)))?;
        }
        debug!(
            "created container {} at {} ({} pages)",
            id,
            path.display(),
            header.capacity
        );
        Ok(container)
    }

    pub fn open(path: &Path, id: ContainerId, page_size: usize) -> QuillStoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_fault(format!("container {} ({})", id, path.display())))?;
        let mut buf = vec![0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(io_fault(format!("container {} header", id)))?;
        let header = ContainerHeader::decode(&buf)?;
        if header.id != id {
            return Err(QuillStoreError::Internal(format!(
                "file {} holds container {}, expected {}",
                path.display(),
                header.id,
                id
            )));
        }
        if header.page_size as usize != page_size {
            return Err(QuillStoreError::Internal(format!(
                "container {} uses page size {}, expected {}",
                id, header.page_size, page_size
            )));
        }
        debug!(
            "opened container {} with {} allocated pages",
            id,
            header.next_page - FIRST_DATA_PAGE
        );
        Ok(Self {
            id,
            path: path.to_path_buf(),
            page_size,
            inner: Mutex::new(ContainerFile { file, header }),
        })
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn allocated_pages(&self) -> u32 {
        self.inner.lock().header.next_page - FIRST_DATA_PAGE
    }

    pub fn is_allocated(&self, page_id: PageId) -> bool {
        page_id.container() == self.id
            && page_id.page() >= FIRST_DATA_PAGE
            && page_id.page() < self.inner.lock().header.next_page
    }

    /// Hands out the next page number, growing the file by the grow extent
    /// when it runs out of room.
    pub fn allocate_page(&self) -> QuillStoreResult<PageId> {
        let mut inner = self.inner.lock();
        let page = inner.header.next_page;
        if page >= inner.header.capacity {
            let capacity = inner.header.capacity + inner.header.grow_extent;
            inner
                .file
                .set_len(capacity as u64 * self.page_size as u64)
                .map_err(io_fault(format!("container {} grow", self.id)))?;
            inner.header.capacity = capacity;
        }
        inner.header.next_page = page + 1;
        self.write_header(&mut inner)?;
        Ok(PageId::new(self.id, page))
    }

    /// Raises the allocation mark so `page_id` counts as allocated. Used by
    /// redo for pages whose allocation never reached the header.
    pub fn note_page(&self, page_id: PageId) -> QuillStoreResult<()> {
        let mut inner = self.inner.lock();
        if page_id.page() < inner.header.next_page {
            return Ok(());
        }
        inner.header.next_page = page_id.page() + 1;
        if inner.header.capacity < inner.header.next_page {
            inner.header.capacity = inner.header.next_page;
        }
        self.write_header(&mut inner)
    }

    /// Reads a page; bytes past the end of the file read as zeros.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> QuillStoreResult<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut inner = self.inner.lock();
        let offset = self.offset(page_id);
        inner
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(io_fault(format!("page {}", page_id)))?;
        let mut filled = 0;
        while filled < buf.len() {
            match inner.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(io_fault(format!("page {}", page_id))(err)),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> QuillStoreResult<()> {
        debug_assert_eq!(data.len(), self.page_size);
        let mut inner = self.inner.lock();
        let offset = self.offset(page_id);
        inner
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(io_fault(format!("page {}", page_id)))?;
        inner
            .file
            .write_all(data)
            .map_err(io_fault(format!("page {}", page_id)))
    }

    pub fn sync(&self) -> QuillStoreResult<()> {
        self.inner
            .lock()
            .file
            .sync_data()
            .map_err(io_fault(format!("container {} sync", self.id)))
    }

    fn offset(&self, page_id: PageId) -> u64 {
        page_id.page() as u64 * self.page_size as u64
    }

    fn write_header(&self, inner: &mut ContainerFile) -> QuillStoreResult<()> {
        let bytes = inner.header.encode(self.page_size);
        inner
            .file
            .seek(SeekFrom::Start(0))
            .map_err(io_fault(format!("container {} header", self.id)))?;
        inner
            .file
            .write_all(&bytes)
            .map_err(io_fault(format!("container {} header", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_allocate_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c7.dat");
        {
            let container = Container::create(&path, 7, 512, 2, 3).unwrap();
            let ids: Vec<_> = (0..5).map(|_| container.allocate_page().unwrap()).collect();
            assert_eq!(ids[0], PageId::new(7, 1));
            assert_eq!(ids[4], PageId::new(7, 5));
            let mut page = vec![0xabu8; 512];
            page[0] = 1;
            container.write_page(ids[4], &page).unwrap();
            container.sync().unwrap();
        }
        let container = Container::open(&path, 7, 512).unwrap();
        assert_eq!(container.allocated_pages(), 5);
        assert!(container.is_allocated(PageId::new(7, 5)));
        assert!(!container.is_allocated(PageId::new(7, 6)));
        let mut buf = vec![0u8; 512];
        container.read_page(PageId::new(7, 5), &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[1], 0xab);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c1.dat");
        Container::create(&path, 1, 512, 1, 1).unwrap();
        let err = Container::create(&path, 1, 512, 1, 1).unwrap_err();
        assert!(matches!(
            err,
            QuillStoreError::Buffer(BufferFault::AlreadyExists(1))
        ));
    }

    #[test]
    fn reads_past_end_are_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c2.dat");
        let container = Container::create(&path, 2, 256, 1, 1).unwrap();
        container.note_page(PageId::new(2, 40)).unwrap();
        let mut buf = vec![7u8; 256];
        container.read_page(PageId::new(2, 40), &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        assert!(container.is_allocated(PageId::new(2, 40)));
    }
}
