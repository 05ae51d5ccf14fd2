use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::registry::{IndexLease, IndexRegistry};
use crate::buffer::{BufferManager, ContainerId, PageId};
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::index::{BPlusTreeIndex, ComparatorRegistry, IndexOptions, LogMode};
use crate::transaction::{IsolationLevel, TransactionManager, TxnContext};

/// Container holding the catalog tree. User indexes get containers above it.
pub const CATALOG_CONTAINER: ContainerId = 1;
/// The catalog tree is the first thing allocated in its container.
pub const CATALOG_META_PAGE: PageId = PageId::new(CATALOG_CONTAINER, 1);

const MAX_INDEX_NAME_LEN: usize = 128;

/// Catalog row, stored bincode-encoded under the index name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub meta_page_id: PageId,
    pub comparator: String,
    pub unique: bool,
}

/// Name to meta page mapping, kept in a B+Tree of its own so that index
/// creation commits and rolls back with the transaction that did it.
#[derive(Debug)]
pub struct Catalog {
    buffers: Arc<BufferManager>,
    comparators: ComparatorRegistry,
    tree: BPlusTreeIndex,
    open_indexes: IndexRegistry,
    container_alloc: Mutex<()>,
}

impl Catalog {
    /// Opens the catalog tree, bootstrapping it in a fresh database.
    pub fn open(
        buffers: Arc<BufferManager>,
        txns: &Arc<TransactionManager>,
        comparators: ComparatorRegistry,
    ) -> QuillStoreResult<Self> {
        let tree = if buffers.existing_containers()?.contains(&CATALOG_CONTAINER) {
            let buffer = buffers.get_or_start_container(CATALOG_CONTAINER)?;
            BPlusTreeIndex::open(buffer, CATALOG_META_PAGE, &comparators)?
        } else {
            Self::bootstrap(&buffers, txns, &comparators)?
        };
        Ok(Self {
            buffers,
            comparators,
            tree,
            open_indexes: IndexRegistry::new(),
            container_alloc: Mutex::new(()),
        })
    }

    fn bootstrap(
        buffers: &Arc<BufferManager>,
        txns: &Arc<TransactionManager>,
        comparators: &ComparatorRegistry,
    ) -> QuillStoreResult<BPlusTreeIndex> {
        let buffer = buffers.create_container(CATALOG_CONTAINER)?;
        let ctx = TxnContext::new(txns.clone(), txns.begin(IsolationLevel::Serializable, 0)?);
        let created = BPlusTreeIndex::create(&ctx, buffer, comparators, &IndexOptions::default());
        let tree = match created {
            Ok(tree) => tree,
            Err(err) => {
                txns.rollback(ctx.transaction())?;
                return Err(err);
            }
        };
        txns.commit(ctx.transaction())?;
        if tree.meta_page_id() != CATALOG_META_PAGE {
            return Err(QuillStoreError::Internal(format!(
                "catalog landed on {} instead of {}",
                tree.meta_page_id(),
                CATALOG_META_PAGE
            )));
        }
        info!("created catalog at {}", CATALOG_META_PAGE);
        Ok(tree)
    }

    pub fn tree(&self) -> &BPlusTreeIndex {
        &self.tree
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.open_indexes
    }

    /// Creates an index in a container of its own and records it under
    /// `name`. The lease is also parked on the transaction.
    pub fn create_index(
        &self,
        ctx: &TxnContext,
        name: &str,
        options: &IndexOptions,
    ) -> QuillStoreResult<IndexLease> {
        check_name(name)?;
        ctx.lock_key_write(self.tree.meta_page_id(), name.as_bytes())?;
        if self.tree.get(ctx, name.as_bytes())?.is_some() {
            return Err(QuillStoreError::IndexOperation(format!(
                "index '{}' already exists",
                name
            )));
        }
        let buffer = {
            let _alloc = self.container_alloc.lock();
            let container = self.next_container()?;
            self.buffers.create_container(container)?
        };
        let index = BPlusTreeIndex::create(ctx, buffer, &self.comparators, options)?;
        let descriptor = IndexDescriptor {
            name: name.to_string(),
            meta_page_id: index.meta_page_id(),
            comparator: index.comparator().name().to_string(),
            unique: index.is_unique(),
        };
        self.tree.insert(
            ctx,
            name.as_bytes(),
            &bincode::serialize(&descriptor)?,
            LogMode::Logged,
        )?;
        debug!("catalogued index '{}' at {}", name, descriptor.meta_page_id);
        let lease = self
            .open_indexes
            .lease(descriptor.meta_page_id, move || Ok(index))?;
        ctx.transaction().add_cleanup(Box::new(lease.clone()));
        Ok(lease)
    }

    pub fn open_index(&self, ctx: &TxnContext, name: &str) -> QuillStoreResult<IndexLease> {
        let descriptor = self.describe(ctx, name)?.ok_or_else(|| {
            QuillStoreError::IndexAccess(format!("no index named '{}'", name))
        })?;
        let lease = self.open_indexes.lease(descriptor.meta_page_id, || {
            let buffer = self
                .buffers
                .get_or_start_container(descriptor.meta_page_id.container())?;
            BPlusTreeIndex::open(buffer, descriptor.meta_page_id, &self.comparators)
        })?;
        ctx.transaction().add_cleanup(Box::new(lease.clone()));
        Ok(lease)
    }

    pub fn describe(&self, ctx: &TxnContext, name: &str) -> QuillStoreResult<Option<IndexDescriptor>> {
        self.tree
            .get(ctx, name.as_bytes())?
            .map(|raw| bincode::deserialize(&raw).map_err(QuillStoreError::from))
            .transpose()
    }

    /// Every catalogued index, by name.
    pub fn list(&self, ctx: &TxnContext) -> QuillStoreResult<Vec<IndexDescriptor>> {
        let mut out = Vec::new();
        for entry in self.tree.scan(ctx, ..)? {
            let (_, raw) = entry?;
            out.push(bincode::deserialize(&raw)?);
        }
        Ok(out)
    }

    pub fn evict_idle(&self) -> usize {
        self.open_indexes.evict_idle()
    }

    /// Containers of rolled-back creations stay on disk, so the next id is
    /// taken past every file as well as every running buffer.
    fn next_container(&self) -> QuillStoreResult<ContainerId> {
        let on_disk = self.buffers.existing_containers()?.into_iter().max();
        let running = self
            .buffers
            .get_buffers()
            .iter()
            .map(|buffer| buffer.container_id())
            .max();
        let highest = on_disk.max(running).unwrap_or(CATALOG_CONTAINER);
        highest
            .max(CATALOG_CONTAINER)
            .checked_add(1)
            .ok_or_else(|| QuillStoreError::Internal("container ids exhausted".to_string()))
    }
}

fn check_name(name: &str) -> QuillStoreResult<()> {
    if name.is_empty() || name.len() > MAX_INDEX_NAME_LEN {
        return Err(QuillStoreError::IndexOperation(format!(
            "index names must be 1 to {} bytes",
            MAX_INDEX_NAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(QuillStoreError::IndexOperation(format!(
            "invalid index name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferPoolConfig, LockConfig, WalConfig};
    use crate::recovery::{IndexResourceManager, ResourceManager, WalManager};
    use crate::transaction::LockManager;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> (Arc<BufferManager>, Arc<TransactionManager>) {
        let wal = Arc::new(
            WalManager::open(
                dir.path(),
                WalConfig {
                    writer_interval: None,
                    ..WalConfig::default()
                },
            )
            .unwrap(),
        );
        let config = BufferPoolConfig::default()
            .with_frames(32usize)
            .with_page_size(512usize);
        let buffers = Arc::new(BufferManager::new(dir.path(), config, Some(wal.clone())));
        buffers.start().unwrap();
        let resources: Arc<dyn ResourceManager> = Arc::new(IndexResourceManager::new(
            buffers.clone(),
            ComparatorRegistry::default(),
        ));
        let txns = Arc::new(TransactionManager::new(
            wal,
            buffers.clone(),
            Arc::new(LockManager::new(LockConfig::default())),
            resources,
            1,
        ));
        (buffers, txns)
    }

    fn ctx(txns: &Arc<TransactionManager>) -> TxnContext {
        TxnContext::new(
            txns.clone(),
            txns.begin(IsolationLevel::RepeatableRead, 1).unwrap(),
        )
    }

    #[test]
    fn create_open_and_list() {
        let dir = TempDir::new().unwrap();
        let (buffers, txns) = engine(&dir);
        let catalog = Catalog::open(buffers, &txns, ComparatorRegistry::default()).unwrap();
        assert_eq!(catalog.tree().meta_page_id(), CATALOG_META_PAGE);

        let setup = ctx(&txns);
        let users = catalog
            .create_index(&setup, "users", &IndexOptions::default())
            .unwrap();
        users
            .insert(&setup, b"alice", b"1", LogMode::Logged)
            .unwrap();
        let tags = catalog
            .create_index(&setup, "tags", &IndexOptions::default().with_unique(false))
            .unwrap();
        assert_ne!(users.meta_page_id().container(), tags.meta_page_id().container());
        assert!(matches!(
            catalog.create_index(&setup, "users", &IndexOptions::default()),
            Err(QuillStoreError::IndexOperation(_))
        ));
        drop((users, tags));
        txns.commit(setup.transaction()).unwrap();

        let reader = ctx(&txns);
        let names: Vec<_> = catalog
            .list(&reader)
            .unwrap()
            .into_iter()
            .map(|d| (d.name, d.unique))
            .collect();
        assert_eq!(
            names,
            vec![("tags".to_string(), false), ("users".to_string(), true)]
        );
        let users = catalog.open_index(&reader, "users").unwrap();
        assert_eq!(users.get(&reader, b"alice").unwrap(), Some(b"1".to_vec()));
        assert!(matches!(
            catalog.open_index(&reader, "missing"),
            Err(QuillStoreError::IndexAccess(_))
        ));
        drop(users);
        txns.commit(reader.transaction()).unwrap();
    }

    #[test]
    fn leases_follow_the_transaction() {
        let dir = TempDir::new().unwrap();
        let (buffers, txns) = engine(&dir);
        let catalog = Catalog::open(buffers, &txns, ComparatorRegistry::default()).unwrap();
        let setup = ctx(&txns);
        let meta = catalog
            .create_index(&setup, "events", &IndexOptions::default())
            .unwrap()
            .meta_page_id();
        // the transaction still holds its parked lease
        assert_eq!(catalog.registry().lease_count(meta), Some(1));
        assert_eq!(catalog.evict_idle(), 0);
        txns.commit(setup.transaction()).unwrap();
        assert_eq!(catalog.registry().lease_count(meta), Some(0));
        assert_eq!(catalog.evict_idle(), 1);
        assert!(catalog.registry().is_empty());

        let reader = ctx(&txns);
        let lease = catalog.open_index(&reader, "events").unwrap();
        assert_eq!(catalog.registry().lease_count(meta), Some(2));
        drop(lease);
        txns.rollback(reader.transaction()).unwrap();
        assert_eq!(catalog.registry().lease_count(meta), Some(0));
    }

    #[test]
    fn rolled_back_creation_is_forgotten() {
        let dir = TempDir::new().unwrap();
        let (buffers, txns) = engine(&dir);
        let catalog = Catalog::open(buffers, &txns, ComparatorRegistry::default()).unwrap();
        let first = ctx(&txns);
        let dropped = catalog
            .create_index(&first, "temp", &IndexOptions::default())
            .unwrap()
            .meta_page_id();
        txns.rollback(first.transaction()).unwrap();

        let second = ctx(&txns);
        assert!(catalog.describe(&second, "temp").unwrap().is_none());
        let again = catalog
            .create_index(&second, "temp", &IndexOptions::default())
            .unwrap();
        assert!(again.meta_page_id().container() > dropped.container());
        drop(again);
        txns.commit(second.transaction()).unwrap();
    }

    #[test]
    fn names_are_checked() {
        assert!(check_name("orders_by_date").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("two words").is_err());
        assert!(check_name(&"x".repeat(MAX_INDEX_NAME_LEN + 1)).is_err());
    }
}
