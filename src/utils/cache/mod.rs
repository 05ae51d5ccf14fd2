use crate::buffer::FrameId;

pub mod lru_k;

/// Victim selection policy for buffer frames. Only frames marked evictable
/// may be returned by `evict`.
pub trait Replacer {
    fn new(capacity: usize) -> Self
    where
        Self: Sized;

    fn record_access(&mut self, frame_id: FrameId);

    fn evict(&mut self) -> Option<FrameId>;

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool);

    fn remove(&mut self, frame_id: FrameId);

    fn size(&self) -> usize;
}
