use crate::address;

/// Tag positions tracked per set.
const TAG_SLOTS_PER_SET: usize = 8;

/// Warp ids per observation window.
const WINDOW_SIZE: usize = 4;

/// Observed warp ids at one tag position, split by warp parity.
#[derive(Debug, Default, Clone)]
struct TagSlot {
    tag: address,
    /// Rolling windows of recent warp ids, indexed by warp parity.
    windows: [Vec<usize>; 2],
    /// Every warp observed at this tag, in order.
    warp_record: Vec<usize>,
}

#[derive(Debug, Default, Clone)]
struct Set {
    slots: Vec<TagSlot>,
}

/// Tracks which warps touch which tags, per set.
///
/// Pure instrumentation for hit/miss locality statistics: an access whose
/// warp already appears in the current observation window of its tag
/// position counts as near, otherwise as far. Not load-bearing for cache
/// correctness.
#[derive(Debug, Default)]
pub struct Evaluator {
    sets: Vec<Set>,

    pub num_hits: u64,
    pub num_misses: u64,
    pub near_hits: u64,
    pub near_misses: u64,
    pub far_hits: u64,
    pub far_misses: u64,
}

impl Evaluator {
    #[must_use]
    pub fn new(num_sets: usize) -> Self {
        Self {
            sets: vec![Set::default(); num_sets],
            ..Self::default()
        }
    }

    /// Record one probe of `tag` in `set_index` by `warp_id`.
    pub fn observe(&mut self, set_index: usize, tag: address, warp_id: usize, is_hit: bool) {
        if is_hit {
            self.num_hits += 1;
        } else {
            self.num_misses += 1;
        }

        let set = &mut self.sets[set_index];
        let slot = match set.slots.iter_mut().find(|slot| slot.tag == tag) {
            Some(slot) => slot,
            None => {
                if set.slots.len() >= TAG_SLOTS_PER_SET {
                    return;
                }
                set.slots.push(TagSlot {
                    tag,
                    ..TagSlot::default()
                });
                set.slots.last_mut().unwrap()
            }
        };

        let window = &mut slot.windows[warp_id % 2];
        // only a full window gives a meaningful locality verdict
        if window.len() == WINDOW_SIZE {
            let near = window.contains(&warp_id);
            match (near, is_hit) {
                (true, true) => self.near_hits += 1,
                (true, false) => self.near_misses += 1,
                (false, true) => self.far_hits += 1,
                (false, false) => self.far_misses += 1,
            }
            window.remove(0);
        }
        window.push(warp_id);
        slot.warp_record.push(warp_id);
    }
}

#[cfg(test)]
mod tests {
    use super::{Evaluator, WINDOW_SIZE};

    #[test]
    fn counts_hits_and_misses() {
        let mut wle = Evaluator::new(4);
        wle.observe(0, 0x1000, 0, true);
        wle.observe(0, 0x1000, 1, false);
        assert_eq!(wle.num_hits, 1);
        assert_eq!(wle.num_misses, 1);
    }

    #[test]
    fn evaluates_only_full_windows() {
        let mut wle = Evaluator::new(1);
        // fill the even-parity window of tag 0x1000
        for warp in [0, 2, 4, 6] {
            wle.observe(0, 0x1000, warp, true);
        }
        assert_eq!(wle.near_hits + wle.far_hits, 0);

        // warp 0 is still in the window: near
        wle.observe(0, 0x1000, 0, true);
        assert_eq!(wle.near_hits, 1);

        // a warp never seen before: far
        wle.observe(0, 0x1000, 8, false);
        assert_eq!(wle.far_misses, 1);
    }

    #[test]
    fn windows_are_split_by_parity() {
        let mut wle = Evaluator::new(1);
        for warp in [0, 2, 4, 6] {
            wle.observe(0, 0x1000, warp, true);
        }
        // odd warps have their own, still-empty window
        for _ in 0..WINDOW_SIZE {
            wle.observe(0, 0x1000, 1, true);
        }
        // the first WINDOW_SIZE odd observations could not be evaluated
        assert_eq!(wle.near_hits, 0);
        wle.observe(0, 0x1000, 1, true);
        assert_eq!(wle.near_hits, 1);
    }
}
