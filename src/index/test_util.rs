use std::sync::Arc;

use tempfile::TempDir;

use crate::buffer::BufferManager;
use crate::config::{BufferPoolConfig, LockConfig, WalConfig};
use crate::index::{BPlusTreeIndex, ComparatorRegistry, IndexOptions};
use crate::recovery::{IndexResourceManager, ResourceManager, WalManager};
use crate::transaction::{IsolationLevel, LockManager, TransactionManager, TxnContext};

pub(crate) struct TestEngine {
    pub dir: TempDir,
    pub buffers: Arc<BufferManager>,
    pub txns: Arc<TransactionManager>,
}

impl TestEngine {
    pub fn new(page_size: usize) -> Self {
        let dir = TempDir::new().unwrap();
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
            .with_frames(128usize)
            .with_page_size(page_size);
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
        Self { dir, buffers, txns }
    }

    pub fn ctx(&self) -> TxnContext {
        self.ctx_with(IsolationLevel::RepeatableRead)
    }

    pub fn ctx_with(&self, isolation: IsolationLevel) -> TxnContext {
        TxnContext::new(self.txns.clone(), self.txns.begin(isolation, 1).unwrap())
    }

    pub fn commit(&self, ctx: &TxnContext) {
        self.txns.commit(ctx.transaction()).unwrap();
    }

    /// Creates an index in a fresh container and commits it.
    pub fn create_index(&self, options: &IndexOptions) -> BPlusTreeIndex {
        let container = self
            .buffers
            .get_buffers()
            .iter()
            .map(|b| b.container_id())
            .max()
            .unwrap_or(1)
            + 1;
        let buffer = self.buffers.create_container(container).unwrap();
        let ctx = self.ctx();
        let index =
            BPlusTreeIndex::create(&ctx, buffer, &ComparatorRegistry::default(), options).unwrap();
        self.commit(&ctx);
        index
    }
}

pub(crate) fn key(i: u32) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

pub(crate) fn value(i: u32) -> Vec<u8> {
    format!("value{}", i).into_bytes()
}

/// Deterministic permutation of `0..n`.
pub(crate) fn shuffled(n: u32) -> Vec<u32> {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    let mut order: Vec<u32> = (0..n).collect();
    order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
    order
}

pub(crate) fn scan_all(index: &BPlusTreeIndex, ctx: &TxnContext) -> Vec<(Vec<u8>, Vec<u8>)> {
    index
        .scan(ctx, ..)
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect()
}
