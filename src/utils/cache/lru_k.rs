use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{VellumError, VellumResult};
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct LruKNode {
    // timestamps of the last <= k accesses, oldest first
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new(k: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(k),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64, k: usize) {
        self.history.push_back(timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }
}

/// Picks the evictable frame with the greatest backward k-distance.
///
/// A frame with fewer than k recorded accesses has infinite distance and is
/// preferred over any frame with a full history; ties are broken by the
/// oldest front-of-window timestamp.
#[derive(Debug)]
pub struct LruKReplacer {
    // number of frames currently evictable
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LruKNode>,
    // logical clock, bumped on every access
    current_timestamp: u64,
}

impl LruKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }

    fn check_frame_id(&self, frame_id: FrameId) -> VellumResult<()> {
        if frame_id >= self.replacer_size {
            return Err(VellumError::Internal(format!(
                "frame id {} out of range (replacer size {})",
                frame_id, self.replacer_size
            )));
        }
        Ok(())
    }

    fn backward_k_distance(&self, node: &LruKNode) -> Option<u64> {
        if node.history.len() < self.k {
            None
        } else {
            node.history
                .front()
                .map(|front| self.current_timestamp - front)
        }
    }
}

impl Replacer for LruKReplacer {
    fn new(capacity: usize) -> Self {
        const DEFAULT_K: usize = 2;
        Self::with_k(capacity, DEFAULT_K)
    }

    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()> {
        self.check_frame_id(frame_id)?;
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;
        let k = self.k;
        self.node_store
            .entry(frame_id)
            .or_insert_with(|| LruKNode::new(k))
            .record_access(timestamp, k);
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        // (frame, distance, front-of-window timestamp) of the best victim so far;
        // None distance means infinity
        let mut victim: Option<(FrameId, Option<u64>, u64)> = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            let Some(front) = node.history.front().copied() else {
                continue;
            };
            let distance = self.backward_k_distance(node);
            let better = match victim {
                None => true,
                Some((_, best_distance, best_front)) => match (distance, best_distance) {
                    (None, None) => front < best_front,
                    (None, Some(_)) => true,
                    (Some(_), None) => false,
                    (Some(d), Some(best)) => d > best || (d == best && front < best_front),
                },
            };
            if better {
                victim = Some((*frame_id, distance, front));
            }
        }
        let (frame_id, _, _) = victim?;
        self.node_store.remove(&frame_id);
        self.current_size -= 1;
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> VellumResult<()> {
        self.check_frame_id(frame_id)?;
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            if set_evictable && !node.is_evictable {
                self.current_size += 1;
            } else if !set_evictable && node.is_evictable {
                self.current_size -= 1;
            }
            node.is_evictable = set_evictable;
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            if !node.is_evictable {
                return;
            }
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cache::Replacer;

    #[test]
    fn set_evictable_tracks_size() {
        let mut replacer = LruKReplacer::with_k(3, 2);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        // repeated calls must not over-count
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn record_access_rejects_out_of_range_frame() {
        let mut replacer = LruKReplacer::with_k(2, 2);
        assert!(replacer.record_access(2).is_err());
        assert!(replacer.set_evictable(5, true).is_err());
    }

    #[test]
    fn evict_prefers_largest_k_distance() {
        let mut replacer = LruKReplacer::with_k(4, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(2).unwrap(); // ts=2
        replacer.record_access(2).unwrap(); // ts=3, history=[1,2,3]
        replacer.record_access(1).unwrap(); // ts=4
        replacer.record_access(1).unwrap(); // ts=5, history=[0,4,5]
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        // frame 1: distance = 6 - 0 = 6; frame 2: distance = 6 - 1 = 5
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn infinite_distance_wins_and_ties_break_by_oldest_access() {
        let mut replacer = LruKReplacer::with_k(4, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1, history < k
        replacer.record_access(3).unwrap(); // ts=2, history < k
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(1).unwrap(); // ts=4, history=[0,3,4], full
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.set_evictable(3, true).unwrap();
        // frames 2 and 3 both have infinite distance; 2 was touched first
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn round_robin_accesses_evict_stalest_window() {
        let mut replacer = LruKReplacer::with_k(4, 2);
        for frame in [1, 2, 3, 1, 2, 3, 1, 2] {
            replacer.record_access(frame).unwrap();
        }
        for frame in 1..=3 {
            replacer.set_evictable(frame, true).unwrap();
        }
        // windows: 1 -> [3,6], 2 -> [4,7], 3 -> [2,5]; frame 3 has the
        // largest backward k-distance
        assert_eq!(replacer.evict(), Some(3));
    }

    #[test]
    fn remove_ignores_pinned_frames() {
        let mut replacer = LruKReplacer::with_k(2, 2);
        replacer.record_access(0).unwrap();
        replacer.remove(0);
        assert_eq!(replacer.size(), 0);
        replacer.set_evictable(0, true).unwrap();
        replacer.remove(0);
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn full_scenario_k2() {
        let mut replacer = LruKReplacer::with_k(7, 2);

        for frame in 1..=6 {
            replacer.record_access(frame).unwrap(); // ts = frame - 1
        }
        for frame in 1..=5 {
            replacer.set_evictable(frame, true).unwrap();
        }
        replacer.set_evictable(6, false).unwrap();
        assert_eq!(replacer.size(), 5);

        replacer.record_access(1).unwrap(); // ts=6, history=[0,6]

        // frames 2..5 all have infinite distance; evicted oldest-first
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 2);

        replacer.record_access(3).unwrap(); // ts=7
        replacer.record_access(4).unwrap(); // ts=8
        replacer.record_access(5).unwrap(); // ts=9, history=[4,9]
        replacer.record_access(4).unwrap(); // ts=10, history=[8,10]
        replacer.set_evictable(3, true).unwrap();
        replacer.set_evictable(4, true).unwrap();
        assert_eq!(replacer.size(), 4);

        // frame 3 is the only infinite-distance candidate
        assert_eq!(replacer.evict(), Some(3));

        replacer.set_evictable(6, true).unwrap();
        assert_eq!(replacer.size(), 4);
        // frame 6 history=[5], infinite distance
        assert_eq!(replacer.evict(), Some(6));

        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 2);
        // frame 5 distance 11-4=7 beats frame 4 distance 11-8=3
        assert_eq!(replacer.evict(), Some(5));

        replacer.record_access(1).unwrap(); // ts=11
        replacer.record_access(1).unwrap(); // ts=12, history=[11,12]
        replacer.set_evictable(1, true).unwrap();
        // frame 4 distance 13-8=5 beats frame 1 distance 13-11=2
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.size(), 0);
    }
}
