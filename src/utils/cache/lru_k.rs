use std::collections::{HashMap, HashSet, VecDeque};

use log::warn;

use crate::buffer::FrameId;
use crate::utils::cache::Replacer;

pub const DEFAULT_LRU_K: usize = 2;

/// LRU-K over a logical access clock. Frames with fewer than `k` recorded
/// accesses have infinite backward distance and go first, oldest first access
/// winning among them.
#[derive(Debug)]
pub struct LruKReplacer {
    k: usize,
    // last k access ticks per tracked frame, oldest at the front
    access_history: HashMap<FrameId, VecDeque<u64>>,
    evictable_frames: HashSet<FrameId>,
    clock: u64,
}

impl LruKReplacer {
    pub fn with_k(k: usize) -> Self {
        assert!(k > 0, "k must be greater than 0");
        LruKReplacer {
            k,
            access_history: HashMap::new(),
            evictable_frames: HashSet::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl Replacer for LruKReplacer {
    fn new(_capacity: usize) -> Self {
        Self::with_k(DEFAULT_LRU_K)
    }

    fn record_access(&mut self, frame_id: FrameId) {
        let now = self.tick();
        let history = self.access_history.entry(frame_id).or_default();
        history.push_back(now);
        if history.len() > self.k {
            history.pop_front();
        }
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if !evictable {
            self.evictable_frames.remove(&frame_id);
            return;
        }
        if self.access_history.contains_key(&frame_id) {
            self.evictable_frames.insert(frame_id);
        } else {
            warn!(
                "set_evictable(true) for frame {} without access history",
                frame_id
            );
        }
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.evictable_frames.remove(&frame_id);
        self.access_history.remove(&frame_id);
    }

    fn evict(&mut self) -> Option<FrameId> {
        // (infinite distance?, oldest relevant tick) ordering: infinite first,
        // then the smallest k-th most recent tick.
        let mut best: Option<(bool, u64, FrameId)> = None;
        for frame_id in self.evictable_frames.iter() {
            let Some(history) = self.access_history.get(frame_id) else {
                continue;
            };
            let Some(&front) = history.front() else {
                continue;
            };
            let infinite = history.len() < self.k;
            let better = match best {
                None => true,
                Some((best_inf, best_tick, _)) => {
                    (infinite && !best_inf) || (infinite == best_inf && front < best_tick)
                }
            };
            if better {
                best = Some((infinite, front, *frame_id));
            }
        }
        let victim = best.map(|(_, _, frame_id)| frame_id);
        if let Some(frame_id) = victim {
            self.remove(frame_id);
        }
        victim
    }

    fn size(&self) -> usize {
        self.evictable_frames.len()
    }
}
