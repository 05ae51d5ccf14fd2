//! Per-frame latch with shared, update and exclusive modes.
//!
//! Built on `parking_lot`'s raw upgradable rwlock: update maps to an
//! upgradable read, so U coexists with S, and `up_x`/`down_s` transition
//! without ever releasing the lock. parking_lot queues waiters fairly, so a
//! pending U or X request is not starved by a stream of readers.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::lock_api::{
    RawRwLock as RawRwLockApi, RawRwLockDowngrade, RawRwLockUpgrade, RawRwLockUpgradeDowngrade,
};
use parking_lot::RawRwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatchMode {
    Shared,
    Update,
    Exclusive,
}

const HOLDER_NONE: u8 = 0;
const HOLDER_UPDATE: u8 = 1;
const HOLDER_EXCLUSIVE: u8 = 2;

pub struct Latch {
    raw: RawRwLock,
    shared: AtomicU32,
    /// The single U or X hold. The latch cannot tell which caller owns it;
    /// `PageHandle` keeps the mode of each hold and checks transitions
    /// against it before they reach the latch.
    holder: AtomicU8,
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (shared, holder) = self.snapshot();
        f.debug_struct("Latch")
            .field("shared", &shared)
            .field("holder", &holder)
            .finish()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            raw: <RawRwLock as RawRwLockApi>::INIT,
            shared: AtomicU32::new(0),
            holder: AtomicU8::new(HOLDER_NONE),
        }
    }

    pub fn latch_s(&self) {
        self.raw.lock_shared();
        self.shared.fetch_add(1, Ordering::AcqRel);
    }

    pub fn latch_u(&self) {
        self.raw.lock_upgradable();
        self.holder.store(HOLDER_UPDATE, Ordering::Release);
    }

    pub fn latch_x(&self) {
        self.raw.lock_exclusive();
        self.holder.store(HOLDER_EXCLUSIVE, Ordering::Release);
    }

    pub fn latch_sc(&self) -> bool {
        if self.raw.try_lock_shared() {
            self.shared.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    pub fn latch_uc(&self) -> bool {
        if self.raw.try_lock_upgradable() {
            self.holder.store(HOLDER_UPDATE, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn latch_xc(&self) -> bool {
        if self.raw.try_lock_exclusive() {
            self.holder.store(HOLDER_EXCLUSIVE, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn latch(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.latch_s(),
            LatchMode::Update => self.latch_u(),
            LatchMode::Exclusive => self.latch_x(),
        }
    }

    pub fn try_latch(&self, mode: LatchMode) -> bool {
        match mode {
            LatchMode::Shared => self.latch_sc(),
            LatchMode::Update => self.latch_uc(),
            LatchMode::Exclusive => self.latch_xc(),
        }
    }

    /// U -> X. Blocks until the remaining readers drain; no other U or X
    /// holder can slip in meanwhile.
    pub fn up_x(&self) {
        self.expect_holder(HOLDER_UPDATE, "up_x");
        // SAFETY: the caller holds the upgradable lock, checked above.
        unsafe { self.raw.upgrade() };
        self.holder.store(HOLDER_EXCLUSIVE, Ordering::Release);
    }

    /// U -> S, or X -> S.
    pub fn down_s(&self) {
        match self.holder.load(Ordering::Acquire) {
            HOLDER_UPDATE => {
                self.shared.fetch_add(1, Ordering::AcqRel);
                self.holder.store(HOLDER_NONE, Ordering::Release);
                // SAFETY: upgradable lock held, checked above.
                unsafe { self.raw.downgrade_upgradable() };
            }
            HOLDER_EXCLUSIVE => {
                self.shared.fetch_add(1, Ordering::AcqRel);
                self.holder.store(HOLDER_NONE, Ordering::Release);
                // SAFETY: exclusive lock held, checked above.
                unsafe { self.raw.downgrade() };
            }
            _ => panic!("latch misuse: down_s without holding U or X"),
        }
    }

    /// X -> U.
    pub fn down_u(&self) {
        self.expect_holder(HOLDER_EXCLUSIVE, "down_u");
        self.holder.store(HOLDER_UPDATE, Ordering::Release);
        // SAFETY: exclusive lock held, checked above.
        unsafe { self.raw.downgrade_to_upgradable() };
    }

    /// Releases one hold in `mode`. Panics if no such hold exists.
    pub fn unlatch(&self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => {
                let released = self
                    .shared
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                if released.is_err() {
                    panic!("latch misuse: shared release without a shared holder");
                }
                // SAFETY: a shared hold was accounted for above.
                unsafe { self.raw.unlock_shared() };
            }
            LatchMode::Update => {
                self.expect_holder(HOLDER_UPDATE, "unlatch(U)");
                self.holder.store(HOLDER_NONE, Ordering::Release);
                // SAFETY: upgradable lock held, checked above.
                unsafe { self.raw.unlock_upgradable() };
            }
            LatchMode::Exclusive => {
                self.expect_holder(HOLDER_EXCLUSIVE, "unlatch(X)");
                self.holder.store(HOLDER_NONE, Ordering::Release);
                // SAFETY: exclusive lock held, checked above.
                unsafe { self.raw.unlock_exclusive() };
            }
        }
    }

    /// Shared holder count and the U/X holder, if any. Diagnostic only: the
    /// values can be stale by the time the caller looks at them.
    pub fn snapshot(&self) -> (u32, Option<LatchMode>) {
        let holder = match self.holder.load(Ordering::Acquire) {
            HOLDER_UPDATE => Some(LatchMode::Update),
            HOLDER_EXCLUSIVE => Some(LatchMode::Exclusive),
            _ => None,
        };
        (self.shared.load(Ordering::Acquire), holder)
    }

    pub fn is_free(&self) -> bool {
        !self.raw.is_locked()
    }

    fn expect_holder(&self, expected: u8, op: &str) {
        let actual = self.holder.load(Ordering::Acquire);
        if actual != expected {
            panic!(
                "latch misuse: {} requires {} but holder is {}",
                op,
                holder_name(expected),
                holder_name(actual)
            );
        }
    }
}

fn holder_name(holder: u8) -> &'static str {
    match holder {
        HOLDER_UPDATE => "U",
        HOLDER_EXCLUSIVE => "X",
        _ => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI32};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist_with_update() {
        let latch = Latch::new();
        latch.latch_s();
        assert!(latch.latch_sc());
        assert!(latch.latch_uc());
        assert!(!latch.latch_uc());
        assert!(!latch.latch_xc());
        assert_eq!(latch.snapshot(), (2, Some(LatchMode::Update)));
        latch.unlatch(LatchMode::Shared);
        latch.unlatch(LatchMode::Shared);
        latch.unlatch(LatchMode::Update);
        assert!(latch.is_free());
    }

    #[test]
    fn exclusive_excludes_everything() {
        let latch = Latch::new();
        latch.latch_x();
        assert!(!latch.latch_sc());
        assert!(!latch.latch_uc());
        assert!(!latch.latch_xc());
        latch.unlatch(LatchMode::Exclusive);
        assert!(latch.latch_xc());
        latch.unlatch(LatchMode::Exclusive);
    }

    #[test]
    fn upgrade_and_downgrade_keep_exclusion() {
        let latch = Latch::new();
        latch.latch_u();
        latch.up_x();
        assert!(!latch.latch_sc());
        latch.down_u();
        assert!(latch.latch_sc());
        assert!(!latch.latch_uc());
        latch.unlatch(LatchMode::Shared);
        latch.down_s();
        assert!(latch.latch_uc());
        assert_eq!(latch.snapshot(), (1, Some(LatchMode::Update)));
        latch.unlatch(LatchMode::Update);
        latch.unlatch(LatchMode::Shared);
        assert!(latch.is_free());
    }

    #[test]
    fn up_x_waits_for_readers_and_blocks_new_writers() {
        let latch = Arc::new(Latch::new());
        latch.latch_s();
        latch.latch_u();

        let upgraded = Arc::new(AtomicBool::new(false));
        let handle = {
            let latch = latch.clone();
            let upgraded = upgraded.clone();
            thread::spawn(move || {
                // second thread owns nothing; it competes for X
                latch.latch_x();
                assert!(upgraded.load(Ordering::SeqCst));
                latch.unlatch(LatchMode::Exclusive);
            })
        };

        let upgrader = {
            let latch = latch.clone();
            let upgraded = upgraded.clone();
            thread::spawn(move || {
                latch.up_x();
                upgraded.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                latch.unlatch(LatchMode::Exclusive);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!upgraded.load(Ordering::SeqCst));
        latch.unlatch(LatchMode::Shared);
        upgrader.join().unwrap();
        handle.join().unwrap();
        assert!(latch.is_free());
    }

    #[test]
    #[should_panic(expected = "latch misuse")]
    fn release_without_acquire_panics() {
        let latch = Latch::new();
        latch.unlatch(LatchMode::Shared);
    }

    #[test]
    #[should_panic(expected = "latch misuse")]
    fn upgrade_from_shared_panics() {
        let latch = Latch::new();
        latch.latch_s();
        latch.up_x();
    }

    #[test]
    fn mode_set_stays_valid_under_contention() {
        let latch = Arc::new(Latch::new());
        let readers = Arc::new(AtomicI32::new(0));
        let updaters = Arc::new(AtomicI32::new(0));
        let writers = Arc::new(AtomicI32::new(0));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|t| {
                let latch = latch.clone();
                let readers = readers.clone();
                let updaters = updaters.clone();
                let writers = writers.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..300 {
                        match (t + i) % 3 {
                            0 => {
                                latch.latch_s();
                                readers.fetch_add(1, Ordering::SeqCst);
                                assert_eq!(writers.load(Ordering::SeqCst), 0);
                                readers.fetch_sub(1, Ordering::SeqCst);
                                latch.unlatch(LatchMode::Shared);
                            }
                            1 => {
                                latch.latch_u();
                                assert_eq!(updaters.fetch_add(1, Ordering::SeqCst), 0);
                                assert_eq!(writers.load(Ordering::SeqCst), 0);
                                latch.up_x();
                                writers.fetch_add(1, Ordering::SeqCst);
                                assert_eq!(readers.load(Ordering::SeqCst), 0);
                                writers.fetch_sub(1, Ordering::SeqCst);
                                updaters.fetch_sub(1, Ordering::SeqCst);
                                latch.unlatch(LatchMode::Exclusive);
                            }
                            _ => {
                                latch.latch_x();
                                assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                                assert_eq!(readers.load(Ordering::SeqCst), 0);
                                assert_eq!(updaters.load(Ordering::SeqCst), 0);
                                writers.fetch_sub(1, Ordering::SeqCst);
                                latch.unlatch(LatchMode::Exclusive);
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(latch.is_free());
    }
}
