use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::PageId;
use crate::config::LockConfig;
use crate::error::{QuillStoreError, QuillStoreResult};
use crate::transaction::{Transaction, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

/// Logical lock targets. Indexes are named by their meta page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockObject {
    Index(PageId),
    Key(PageId, Vec<u8>),
}

/// `requestor` waits for `blocker` to release `object`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingEdge {
    pub object: LockObject,
    pub mode: LockMode,
    pub requestor: TransactionId,
    pub blocker: TransactionId,
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockQueue {
    requests: VecDeque<LockRequest>,
    // set once the queue is unlinked from the lock table
    retired: bool,
}

#[derive(Debug, Default)]
struct ResourceLock {
    state: Mutex<LockQueue>,
    condvar: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pending {
    New,
    Upgrade,
}

/// Queue-based two-phase lock manager. Requests are granted in FIFO order,
/// upgrades of an already granted request jump the queue.
#[derive(Debug)]
pub struct LockManager {
    resources: DashMap<LockObject, Arc<ResourceLock>>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(config: LockConfig) -> Self {
        Self {
            resources: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> LockConfig {
        self.config
    }

    /// Blocks until `txn` holds `object` in at least `mode`. Fails with
    /// `Deadlock` when the transaction was chosen as a victim (or killed) and
    /// with `LockTimeout` once the configured timeout passes.
    pub fn lock(&self, txn: &Transaction, object: LockObject, mode: LockMode) -> QuillStoreResult<()> {
        if txn.holds(&object, mode) {
            return Ok(());
        }
        if txn.is_abort_requested() {
            return Err(QuillStoreError::Deadlock(txn.id()));
        }
        loop {
            let resource = self.resource(&object);
            let queue = resource.state.lock();
            if queue.retired {
                continue;
            }
            return self.acquire(txn, &object, mode, &resource, queue);
        }
    }

    fn acquire(
        &self,
        txn: &Transaction,
        object: &LockObject,
        mode: LockMode,
        resource: &ResourceLock,
        mut queue: MutexGuard<'_, LockQueue>,
    ) -> QuillStoreResult<()> {
        let txn_id = txn.id();
        let existing = queue
            .requests
            .iter()
            .find(|req| req.txn_id == txn_id)
            .map(|req| req.mode);
        let (pending, target) = match existing {
            Some(held) if dominates(held, mode) => {
                txn.note_lock(object.clone(), held);
                return Ok(());
            }
            Some(held) => (Pending::Upgrade, supremum(held, mode)),
            None => {
                queue.requests.push_back(LockRequest {
                    txn_id,
                    mode,
                    granted: false,
                });
                (Pending::New, mode)
            }
        };
        let deadline = self.config.lock_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let blockers = blockers(&queue.requests, txn_id, pending, target);
            if blockers.is_empty() {
                if let Some(req) = queue.requests.iter_mut().find(|req| req.txn_id == txn_id) {
                    req.mode = target;
                    req.granted = true;
                }
                txn.clear_blocking();
                txn.note_lock(object.clone(), target);
                trace!("txn {} locked {:?} in {:?}", txn_id, object, target);
                return Ok(());
            }

            txn.set_blocking(
                blockers
                    .into_iter()
                    .map(|blocker| BlockingEdge {
                        object: object.clone(),
                        mode: target,
                        requestor: txn_id,
                        blocker,
                    })
                    .collect(),
            );

            let failure = if txn.is_abort_requested() {
                Some(QuillStoreError::Deadlock(txn_id))
            } else if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                Some(QuillStoreError::LockTimeout(txn_id))
            } else {
                None
            };
            if let Some(err) = failure {
                if pending == Pending::New {
                    queue
                        .requests
                        .retain(|req| !(req.txn_id == txn_id && !req.granted));
                    resource.condvar.notify_all();
                }
                txn.clear_blocking();
                debug!("txn {} gave up waiting for {:?}: {}", txn_id, object, err);
                drop(queue);
                self.retire_if_empty(object);
                return Err(err);
            }

            let mut slice = self.config.wait_slice;
            if let Some(deadline) = deadline {
                slice = slice.min(deadline.saturating_duration_since(Instant::now()));
            }
            resource.condvar.wait_for(&mut queue, slice);
        }
    }

    /// Releases the lock `txn` holds on `object`.
    pub fn unlock(&self, txn: &Transaction, object: &LockObject) -> bool {
        txn.forget_lock(object);
        let Some(resource) = self.resources.get(object).map(|entry| entry.value().clone()) else {
            return false;
        };
        let removed = {
            let mut queue = resource.state.lock();
            let before = queue.requests.len();
            queue.requests.retain(|req| req.txn_id != txn.id());
            let removed = queue.requests.len() != before;
            if removed {
                resource.condvar.notify_all();
            }
            removed
        };
        self.retire_if_empty(object);
        removed
    }

    /// Releases every lock held by `txn`.
    pub fn unlock_all(&self, txn: &Transaction) {
        let held = txn.held_locks();
        let count = held.len();
        for (object, _) in held {
            self.unlock(txn, &object);
        }
        txn.clear_blocking();
        if count > 0 {
            trace!("txn {} released {} locks", txn.id(), count);
        }
    }

    /// Wakes waiters on `object` so they re-check their abort flag.
    pub fn wake(&self, object: &LockObject) {
        if let Some(entry) = self.resources.get(object) {
            entry.value().condvar.notify_all();
        }
    }

    /// Transactions currently granted a lock on `object`, with their modes.
    pub fn holders(&self, object: &LockObject) -> Vec<(TransactionId, LockMode)> {
        let Some(resource) = self.resources.get(object).map(|entry| entry.value().clone()) else {
            return Vec::new();
        };
        let queue = resource.state.lock();
        queue
            .requests
            .iter()
            .filter(|req| req.granted)
            .map(|req| (req.txn_id, req.mode))
            .collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    fn resource(&self, object: &LockObject) -> Arc<ResourceLock> {
        if let Some(entry) = self.resources.get(object) {
            return entry.value().clone();
        }
        self.resources
            .entry(object.clone())
            .or_insert_with(|| Arc::new(ResourceLock::default()))
            .value()
            .clone()
    }

    fn retire_if_empty(&self, object: &LockObject) {
        self.resources.remove_if(object, |_, resource| {
            let mut queue = resource.state.lock();
            if queue.requests.is_empty() {
                queue.retired = true;
                true
            } else {
                false
            }
        });
    }
}

/// Transactions `txn_id` has to wait for before `target` can be granted:
/// incompatible holders, and for new requests every earlier waiter.
fn blockers(
    queue: &VecDeque<LockRequest>,
    txn_id: TransactionId,
    pending: Pending,
    target: LockMode,
) -> Vec<TransactionId> {
    let mut blockers = Vec::new();
    let mut ahead = true;
    for req in queue.iter() {
        if req.txn_id == txn_id {
            ahead = false;
            continue;
        }
        let blocks = if req.granted {
            !compatible(target, req.mode)
        } else {
            pending == Pending::New && ahead
        };
        if blocks && !blockers.contains(&req.txn_id) {
            blockers.push(req.txn_id);
        }
    }
    blockers
}

pub fn compatible(requested: LockMode, held: LockMode) -> bool {
    match requested {
        LockMode::Shared => matches!(held, LockMode::Shared | LockMode::IntentionShared),
        LockMode::Exclusive => false,
        LockMode::IntentionShared => !matches!(held, LockMode::Exclusive),
        LockMode::IntentionExclusive => matches!(
            held,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ),
        LockMode::SharedIntentionExclusive => matches!(held, LockMode::IntentionShared),
    }
}

/// True when holding `held` already grants everything `requested` would.
pub fn dominates(held: LockMode, requested: LockMode) -> bool {
    match held {
        LockMode::Exclusive => true,
        LockMode::SharedIntentionExclusive => !matches!(requested, LockMode::Exclusive),
        LockMode::Shared => matches!(requested, LockMode::Shared | LockMode::IntentionShared),
        LockMode::IntentionExclusive => matches!(
            requested,
            LockMode::IntentionExclusive | LockMode::IntentionShared
        ),
        LockMode::IntentionShared => matches!(requested, LockMode::IntentionShared),
    }
}

/// Weakest mode covering both `a` and `b`.
pub fn supremum(a: LockMode, b: LockMode) -> LockMode {
    if dominates(a, b) {
        a
    } else if dominates(b, a) {
        b
    } else if matches!(
        (a, b),
        (LockMode::Shared, LockMode::IntentionExclusive)
            | (LockMode::IntentionExclusive, LockMode::Shared)
    ) {
        LockMode::SharedIntentionExclusive
    } else {
        LockMode::Exclusive
    }
}
