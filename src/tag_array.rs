use crate::cache::block::{Line, Status};
use crate::cache::controller::{CacheController, Unit};
use crate::cache::RequestStatus;
use crate::{address, cache, config, locality, mem_fetch, prefetch};

/// What the tag array evicted to make room for an allocation.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq)]
pub struct EvictedBlockInfo {
    pub block_addr: address,
    pub modified_size: u32,
}

/// Result of a tag array access.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct AccessStatus {
    pub index: Option<usize>,
    pub writeback: bool,
    pub evicted: Option<EvictedBlockInfo>,
    pub status: RequestStatus,
}

/// Demand hits observed on lines a prefetch installed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchUseStats {
    /// Demand hit on a prefetched, not-yet-used line.
    pub hits: u64,
    /// Demand pending-hit on a prefetched, not-yet-used line.
    pub pending_hits: u64,
    /// Prefetched line evicted before any demand use.
    pub useless: u64,
}

/// Set-associative tag array.
///
/// Owns the per-line state machines, the replacement decision, and the
/// instrumentation that rides on the locality probe: the warp locality
/// evaluator and the stride prefetcher's learning path.
#[derive(Debug)]
pub struct TagArray {
    pub lines: Vec<Line>,
    controller: Unit,
    cache_config: cache::Config,

    num_access: usize,
    num_miss: usize,
    num_pending_hit: usize,
    num_res_fail: usize,

    // snapshot counters for the windowed miss rate
    prev_snapshot_access: usize,
    prev_snapshot_miss: usize,
    prev_snapshot_pending_hit: usize,

    pub prefetch_use: PrefetchUseStats,
    pub locality: locality::Evaluator,
    pub prefetcher: prefetch::Prefetcher,
}

impl TagArray {
    #[must_use]
    pub fn new(config: &config::Cache) -> Self {
        let cache_config = cache::Config::from(config);
        let lines = (0..cache_config.total_lines)
            .map(|_| Line::default())
            .collect();
        Self {
            lines,
            controller: Unit::new(cache_config.clone(), config.address_translation.clone()),
            locality: locality::Evaluator::new(cache_config.num_sets),
            cache_config,
            num_access: 0,
            num_miss: 0,
            num_pending_hit: 0,
            num_res_fail: 0,
            prev_snapshot_access: 0,
            prev_snapshot_miss: 0,
            prev_snapshot_pending_hit: 0,
            prefetch_use: PrefetchUseStats::default(),
            prefetcher: prefetch::Prefetcher::new(),
        }
    }

    /// Probe the tag array without mutating any state.
    ///
    /// Scans all ways of the target set. On a miss the returned index is the
    /// allocation victim: the first invalid way if any, otherwise the best
    /// replacement candidate under the configured policy. Returns
    /// `RESERVATION_FAIL` with no index when every way is reserved.
    #[must_use]
    pub fn probe(&self, block_addr: address) -> (Option<usize>, RequestStatus) {
        let set_index = self.controller.set_index(block_addr) as usize;
        let tag = self.controller.tag(block_addr);

        let mut invalid_line = None;
        let mut valid_line = None;
        let mut valid_time = u64::MAX;

        let mut all_reserved = true;

        for way in 0..self.cache_config.associativity {
            let index = set_index * self.cache_config.associativity + way;
            let line = &self.lines[index];
            if line.tag == tag {
                match line.status {
                    Status::RESERVED => return (Some(index), RequestStatus::HIT_RESERVED),
                    Status::VALID | Status::MODIFIED => {
                        return (Some(index), RequestStatus::HIT);
                    }
                    Status::INVALID => {}
                }
            }
            if !line.is_reserved() {
                all_reserved = false;
                if line.is_invalid() {
                    invalid_line = Some(index);
                } else {
                    // valid line: track the most appropriate replacement
                    // candidate
                    let candidate_time = match self.cache_config.replacement_policy {
                        cache::config::ReplacementPolicy::LRU => line.last_access_time(),
                        cache::config::ReplacementPolicy::FIFO => line.alloc_time(),
                    };
                    if candidate_time < valid_time {
                        valid_time = candidate_time;
                        valid_line = Some(index);
                    }
                }
            }
        }

        if all_reserved {
            // miss, and no way can be allocated on miss
            debug_assert_eq!(
                self.cache_config.allocate_policy,
                cache::config::AllocatePolicy::ON_MISS
            );
            return (None, RequestStatus::RESERVATION_FAIL);
        }

        let index = match (invalid_line, valid_line) {
            (Some(invalid), _) => invalid,
            (None, Some(valid)) => valid,
            (None, None) => {
                // an unreserved way is either invalid or replaceable
                panic!("tag_array::probe: found neither an invalid nor a replaceable line");
            }
        };
        (Some(index), RequestStatus::MISS)
    }

    /// Probe variant for L1 global/local reads.
    ///
    /// Same scan result as [`probe`](TagArray::probe), but additionally
    /// feeds the warp locality evaluator and the stride prefetcher's
    /// learning path, and triggers periodic stride selection.
    pub fn probe_locality(
        &mut self,
        block_addr: address,
        fetch: &mem_fetch::MemFetch,
        time: u64,
    ) -> (Option<usize>, RequestStatus) {
        let set_index = self.controller.set_index(block_addr) as usize;
        let tag = self.controller.tag(block_addr);

        let stride_index = self.prefetcher.probe_entry(fetch.pc);
        match stride_index {
            None if !self.prefetcher.full() && fetch.thread0_active => {
                self.prefetcher.fill_entry(fetch.pc);
            }
            Some(index) if fetch.thread0_active => {
                self.prefetcher
                    .calculate_inter_warp_stride(fetch.cta_id, fetch.warp_id, tag, index);
                self.prefetcher
                    .calculate_intra_warp_stride(fetch.warp_id, tag, index);
                self.prefetcher.trace_warp_addr(fetch.warp_id, tag, index);
            }
            _ => {}
        }
        if time % prefetch::STRIDE_SELECT_PERIOD == prefetch::STRIDE_SELECT_PHASE
            && time != prefetch::STRIDE_SELECT_PHASE
            && stride_index.is_some()
        {
            self.prefetcher.select_strides();
        }

        let (index, status) = self.probe(block_addr);
        let is_hit = matches!(status, RequestStatus::HIT | RequestStatus::HIT_RESERVED);
        self.locality.observe(set_index, tag, fetch.warp_id, is_hit);
        (index, status)
    }

    /// Access the tag array for a demand request.
    ///
    /// Hits update recency and the `used` flag; misses allocate the chosen
    /// way under on-miss allocation, surfacing a writeback when the victim
    /// is modified.
    pub fn access(&mut self, addr: address, time: u64) -> AccessStatus {
        self.num_access += 1;
        log::trace!("tag_array::access({addr}, time={time})");

        let mut writeback = false;
        let mut evicted = None;

        let (index, status) = self.probe(addr);
        match status {
            RequestStatus::HIT_RESERVED => {
                self.num_pending_hit += 1;
                let line = &mut self.lines[index.expect("hit has index")];
                debug_assert!(line.is_reserved());
                if line.is_prefetched() && !line.is_used() {
                    self.prefetch_use.pending_hits += 1;
                }
                line.mark_used();
            }
            RequestStatus::HIT => {
                let line = &mut self.lines[index.expect("hit has index")];
                debug_assert!(line.is_valid() || line.is_modified());
                line.set_last_access_time(time);
                if line.is_prefetched() && !line.is_used() {
                    self.prefetch_use.hits += 1;
                    log::trace!(
                        "tag_array: first demand use of prefetched line {} after {} cycles",
                        line.block_addr,
                        time.saturating_sub(line.fill_time()),
                    );
                }
                line.mark_used();
            }
            RequestStatus::MISS => {
                self.num_miss += 1;
                let index = index.expect("miss has victim index");
                if self.lines[index].is_prefetched() && !self.lines[index].is_used() {
                    self.prefetch_use.useless += 1;
                }
                if self.cache_config.allocate_policy == cache::config::AllocatePolicy::ON_MISS {
                    let line = &mut self.lines[index];
                    debug_assert!(!line.is_reserved());
                    if line.is_modified() {
                        writeback = true;
                        evicted = Some(EvictedBlockInfo {
                            block_addr: line.block_addr,
                            modified_size: self.cache_config.line_size,
                        });
                    }
                    line.allocate(
                        self.controller.tag(addr),
                        self.controller.block_addr(addr),
                        time,
                    );
                }
            }
            RequestStatus::RESERVATION_FAIL => {
                self.num_res_fail += 1;
            }
        }
        AccessStatus {
            index,
            writeback,
            evicted,
            status,
        }
    }

    /// Access the tag array for a prefetch allocation.
    ///
    /// Leaves recency, usage flags and the demand counters untouched. When
    /// `read_only` is set, a modified victim refuses the allocation instead
    /// of producing a writeback.
    pub fn pref_access(&mut self, addr: address, time: u64, read_only: bool) -> AccessStatus {
        let mut writeback = false;
        let mut evicted = None;

        let (index, status) = self.probe(addr);
        if status == RequestStatus::MISS
            && self.cache_config.allocate_policy == cache::config::AllocatePolicy::ON_MISS
        {
            let index = index.expect("miss has victim index");
            let line = &mut self.lines[index];
            if line.is_modified() {
                if read_only {
                    return AccessStatus {
                        index: Some(index),
                        writeback: false,
                        evicted: None,
                        status: RequestStatus::RESERVATION_FAIL,
                    };
                }
                writeback = true;
                evicted = Some(EvictedBlockInfo {
                    block_addr: line.block_addr,
                    modified_size: self.cache_config.line_size,
                });
            }
            line.allocate(
                self.controller.tag(addr),
                self.controller.block_addr(addr),
                time,
            );
        }
        AccessStatus {
            index,
            writeback,
            evicted,
            status,
        }
    }

    /// On-fill allocation: allocate and fill in one step.
    ///
    /// The probe must miss; the MSHR prevents redundant memory requests.
    pub fn fill_on_fill(&mut self, addr: address, time: u64) {
        debug_assert_eq!(
            self.cache_config.allocate_policy,
            cache::config::AllocatePolicy::ON_FILL
        );
        let (index, status) = self.probe(addr);
        assert_eq!(
            status,
            RequestStatus::MISS,
            "fill on fill: probe must miss for {addr:#x}"
        );
        let line = &mut self.lines[index.expect("miss has index")];
        line.allocate(
            self.controller.tag(addr),
            self.controller.block_addr(addr),
            time,
        );
        line.fill(time);
    }

    /// On-miss fill of a previously reserved way.
    pub fn fill_on_miss(&mut self, index: usize, time: u64) {
        self.pref_fill(index, time, false);
    }

    /// On-miss fill, remembering whether a prefetch brought the line in.
    pub fn pref_fill(&mut self, index: usize, time: u64, is_prefetch: bool) {
        debug_assert_eq!(
            self.cache_config.allocate_policy,
            cache::config::AllocatePolicy::ON_MISS
        );
        self.lines[index].fill_prefetch(time, is_prefetch);
    }

    #[must_use]
    pub fn get_block(&self, index: usize) -> &Line {
        &self.lines[index]
    }

    #[must_use]
    pub fn get_block_mut(&mut self, index: usize) -> &mut Line {
        &mut self.lines[index]
    }

    /// Invalidate every line.
    pub fn flush(&mut self) {
        for line in &mut self.lines {
            line.set_status(Status::INVALID);
        }
    }

    /// Miss rate over the interval since the last [`new_window`].
    ///
    /// [`new_window`]: TagArray::new_window
    #[must_use]
    pub fn windowed_miss_rate(&self) -> f32 {
        let n_access = self.num_access - self.prev_snapshot_access;
        let n_miss = self.num_miss - self.prev_snapshot_miss;
        if n_access == 0 {
            return 0.0;
        }
        n_miss as f32 / n_access as f32
    }

    pub fn new_window(&mut self) {
        self.prev_snapshot_access = self.num_access;
        self.prev_snapshot_miss = self.num_miss;
        self.prev_snapshot_pending_hit = self.num_pending_hit;
    }

    #[must_use]
    pub fn num_accesses(&self) -> usize {
        self.num_access
    }

    #[must_use]
    pub fn num_misses(&self) -> usize {
        self.num_miss
    }

    #[must_use]
    pub fn num_pending_hits(&self) -> usize {
        self.num_pending_hit
    }

    #[must_use]
    pub fn num_reservation_fails(&self) -> usize {
        self.num_res_fail
    }

    #[must_use]
    pub fn controller(&self) -> &Unit {
        &self.controller
    }
}

impl std::fmt::Display for TagArray {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let miss_rate = if self.num_access == 0 {
            0.0
        } else {
            self.num_miss as f32 / self.num_access as f32
        };
        write!(
            f,
            "Access = {}, Miss = {} ({:.3}), PendingHit = {}",
            self.num_access, self.num_miss, miss_rate, self.num_pending_hit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::TagArray;
    use crate::cache::config::ReplacementPolicy;
    use crate::cache::RequestStatus;
    use crate::{cache, config};

    fn test_config() -> config::Cache {
        config::Cache {
            num_sets: 4,
            line_size: 128,
            associativity: 2,
            replacement_policy: ReplacementPolicy::LRU,
            write_policy: cache::config::WritePolicy::WRITE_BACK,
            allocate_policy: cache::config::AllocatePolicy::ON_MISS,
            write_allocate_policy: cache::config::WriteAllocatePolicy::WRITE_ALLOCATE,
            set_index_function: config::SetIndexFunction::LINEAR,
            mshr_entries: 4,
            mshr_max_merge: 4,
            miss_queue_size: 8,
            data_port_width: None,
            scheduler_policy: config::SchedulerPolicy::GreedyThenOldest,
            address_translation: None,
        }
    }

    fn filled(tag_array: &mut TagArray, addr: crate::address, time: u64) -> usize {
        let result = tag_array.access(addr, time);
        assert_eq!(result.status, RequestStatus::MISS);
        let index = result.index.unwrap();
        tag_array.fill_on_miss(index, time + 1);
        index
    }

    #[test]
    fn probe_is_pure() {
        let tag_array = TagArray::new(&test_config());
        let first = tag_array.probe(0x1000);
        let second = tag_array.probe(0x1000);
        assert_eq!(first, second);
        assert_eq!(first.1, RequestStatus::MISS);
    }

    #[test]
    fn cold_miss_then_fill_then_hit() {
        let mut tag_array = TagArray::new(&test_config());
        let index = filled(&mut tag_array, 0x1000, 1);
        let (probe_index, status) = tag_array.probe(0x1000);
        assert_eq!(status, RequestStatus::HIT);
        assert_eq!(probe_index, Some(index));

        let result = tag_array.access(0x1000, 7);
        assert_eq!(result.status, RequestStatus::HIT);
        assert_eq!(tag_array.num_misses(), 1);
        assert_eq!(tag_array.num_accesses(), 2);
    }

    #[test]
    fn reserved_line_reports_pending_hit() {
        let mut tag_array = TagArray::new(&test_config());
        let result = tag_array.access(0x1000, 1);
        assert_eq!(result.status, RequestStatus::MISS);
        // not filled yet: the line is reserved
        let result = tag_array.access(0x1000, 2);
        assert_eq!(result.status, RequestStatus::HIT_RESERVED);
        assert_eq!(tag_array.num_pending_hits(), 1);
    }

    #[test]
    fn all_reserved_set_fails_reservation() {
        let mut tag_array = TagArray::new(&test_config());
        // 0x0000, 0x2000, 0x4000 all map to set 0
        assert_eq!(tag_array.access(0x0000, 1).status, RequestStatus::MISS);
        assert_eq!(tag_array.access(0x2000, 2).status, RequestStatus::MISS);
        let result = tag_array.access(0x4000, 3);
        assert_eq!(result.status, RequestStatus::RESERVATION_FAIL);
        assert_eq!(result.index, None);
        assert_eq!(tag_array.num_reservation_fails(), 1);
    }

    #[test]
    fn lru_evicts_least_recently_used_way() {
        let mut tag_array = TagArray::new(&test_config());
        let first = filled(&mut tag_array, 0x0000, 1);
        let second = filled(&mut tag_array, 0x2000, 3);
        // touch the first line so the second becomes LRU
        assert_eq!(tag_array.access(0x0000, 5).status, RequestStatus::HIT);

        let result = tag_array.access(0x4000, 7);
        assert_eq!(result.status, RequestStatus::MISS);
        assert_eq!(result.index, Some(second));
        assert!(!result.writeback);
        let _ = first;
    }

    #[test]
    fn fifo_evicts_oldest_allocation() {
        let mut config = test_config();
        config.replacement_policy = ReplacementPolicy::FIFO;
        let mut tag_array = TagArray::new(&config);
        let first = filled(&mut tag_array, 0x0000, 1);
        let _second = filled(&mut tag_array, 0x2000, 3);
        // a recency update must not protect the oldest allocation
        assert_eq!(tag_array.access(0x0000, 5).status, RequestStatus::HIT);

        let result = tag_array.access(0x4000, 7);
        assert_eq!(result.status, RequestStatus::MISS);
        assert_eq!(result.index, Some(first));
    }

    #[test]
    fn modified_victim_requests_writeback() {
        let mut tag_array = TagArray::new(&test_config());
        let first = filled(&mut tag_array, 0x0000, 1);
        let _second = filled(&mut tag_array, 0x2000, 3);
        tag_array
            .get_block_mut(first)
            .set_status(crate::cache::block::Status::MODIFIED);
        // make the modified line LRU
        assert_eq!(tag_array.access(0x2000, 5).status, RequestStatus::HIT);

        let result = tag_array.access(0x4000, 7);
        assert_eq!(result.status, RequestStatus::MISS);
        assert!(result.writeback);
        let evicted = result.evicted.unwrap();
        assert_eq!(evicted.block_addr, 0x0000);
        assert_eq!(evicted.modified_size, 128);
    }

    #[test]
    fn prefetch_access_refuses_modified_victim_when_read_only() {
        let mut tag_array = TagArray::new(&test_config());
        let first = filled(&mut tag_array, 0x0000, 1);
        let second = filled(&mut tag_array, 0x2000, 3);
        tag_array
            .get_block_mut(first)
            .set_status(crate::cache::block::Status::MODIFIED);
        tag_array
            .get_block_mut(second)
            .set_status(crate::cache::block::Status::MODIFIED);

        let result = tag_array.pref_access(0x4000, 5, true);
        assert_eq!(result.status, RequestStatus::RESERVATION_FAIL);
        // both lines keep their data
        assert!(tag_array.get_block(first).is_modified());
        assert!(tag_array.get_block(second).is_modified());

        let result = tag_array.pref_access(0x4000, 7, false);
        assert_eq!(result.status, RequestStatus::MISS);
        assert!(result.writeback);
    }

    #[test]
    fn flush_invalidates_every_line() {
        let mut tag_array = TagArray::new(&test_config());
        filled(&mut tag_array, 0x0000, 1);
        filled(&mut tag_array, 0x2000, 3);
        tag_array.flush();
        assert!(tag_array.lines.iter().all(super::Line::is_invalid));
        assert_eq!(tag_array.probe(0x0000).1, RequestStatus::MISS);
    }

    #[test]
    fn windowed_miss_rate_resets_with_new_window() {
        let mut tag_array = TagArray::new(&test_config());
        assert_eq!(tag_array.windowed_miss_rate(), 0.0);
        filled(&mut tag_array, 0x0000, 1);
        assert_eq!(tag_array.access(0x0000, 3).status, RequestStatus::HIT);
        assert_eq!(tag_array.windowed_miss_rate(), 0.5);
        tag_array.new_window();
        assert_eq!(tag_array.windowed_miss_rate(), 0.0);
        assert_eq!(tag_array.access(0x8000, 5).status, RequestStatus::MISS);
        assert_eq!(tag_array.windowed_miss_rate(), 1.0);
    }

    #[test]
    fn demand_use_of_prefetched_line_is_counted() {
        let mut tag_array = TagArray::new(&test_config());
        let result = tag_array.pref_access(0x1000, 1, false);
        let index = result.index.unwrap();
        tag_array.pref_fill(index, 2, true);

        assert_eq!(tag_array.access(0x1000, 3).status, RequestStatus::HIT);
        assert_eq!(tag_array.prefetch_use.hits, 1);
        // second demand hit is no longer a first use
        assert_eq!(tag_array.access(0x1000, 4).status, RequestStatus::HIT);
        assert_eq!(tag_array.prefetch_use.hits, 1);
    }

    #[test]
    fn unused_prefetched_victim_is_useless() {
        let mut tag_array = TagArray::new(&test_config());
        let result = tag_array.pref_access(0x0000, 1, false);
        tag_array.pref_fill(result.index.unwrap(), 2, true);
        filled(&mut tag_array, 0x2000, 3);
        // evicting the untouched prefetched line at 0x0000
        let result = tag_array.access(0x4000, 9);
        assert_eq!(result.status, RequestStatus::MISS);
        assert_eq!(tag_array.prefetch_use.useless, 1);
    }
}
