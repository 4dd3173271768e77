use super::bandwidth;
use crate::cache::controller::{CacheController, Unit};
use crate::{address, cache, config, interconn as ic, mem_fetch, mshr, stats, tag_array};
use console::style;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Number of demand misses that may be in flight before prefetch admission
/// stops, protecting demand bandwidth.
pub const PREF_MAX_DEMAND_IN_FLIGHT: usize = 2;

/// Side-table entry for a miss sent downstream, keyed by the request uid.
///
/// Restores the request's original (sub-line) shape when the fill returns
/// and remembers which way was reserved for it.
#[derive(Debug)]
struct PendingRequest {
    block_addr: address,
    addr: address,
    cache_index: Option<usize>,
    data_size: u32,
    is_prefetch: bool,
}

/// Baseline cache shell.
///
/// Implements the machinery shared by the read-only and data caches: miss
/// queue scheduling, the per-tick `cycle`, fill ingress, and MSHR
/// enlistment. Each concrete cache implements its own `access`.
pub struct Base<I> {
    pub name: String,
    pub core_id: usize,
    pub level: cache::Level,

    pub stats: stats::Cache,
    pub config: Arc<config::Cache>,
    pub cache_config: cache::Config,
    pub controller: Unit,

    pub miss_queue: VecDeque<mem_fetch::MemFetch>,
    pub pref_miss_queue: VecDeque<mem_fetch::MemFetch>,
    pub miss_queue_status: mem_fetch::Status,
    pub mshrs: mshr::Table,
    pub tag_array: tag_array::TagArray,

    pending: HashMap<u64, PendingRequest>,
    pub mem_port: Arc<I>,

    pub bandwidth: bandwidth::Manager,
}

impl<I> std::fmt::Debug for Base<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Base")
            .field("name", &self.name)
            .field("core_id", &self.core_id)
            .field("miss_queue", &self.miss_queue)
            .field("pref_miss_queue", &self.pref_miss_queue)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Builder<I> {
    pub name: String,
    pub core_id: usize,
    pub level: cache::Level,
    pub config: Arc<config::Cache>,
    pub mem_port: Arc<I>,
    pub miss_queue_status: mem_fetch::Status,
}

impl<I> Builder<I> {
    #[must_use]
    pub fn build(self) -> Base<I> {
        let cache_config = cache::Config::from(&*self.config);
        let controller = Unit::new(cache_config.clone(), self.config.address_translation.clone());
        let tag_array = tag_array::TagArray::new(&self.config);
        let mshrs = mshr::Table::new(self.config.mshr_entries, self.config.mshr_max_merge);
        let bandwidth = bandwidth::Manager::new(cache_config.clone());
        Base {
            name: self.name,
            core_id: self.core_id,
            level: self.level,
            stats: stats::Cache::default(),
            config: self.config,
            cache_config,
            controller,
            miss_queue: VecDeque::new(),
            pref_miss_queue: VecDeque::new(),
            miss_queue_status: self.miss_queue_status,
            mshrs,
            tag_array,
            pending: HashMap::new(),
            mem_port: self.mem_port,
            bandwidth,
        }
    }
}

impl<I> Base<I> {
    /// The miss queue can take `n` more requests this cycle on top of the
    /// one being handled.
    #[must_use]
    pub fn miss_queue_can_fit(&self, n: usize) -> bool {
        self.miss_queue.len() + n < self.cache_config.miss_queue_size
    }

    #[must_use]
    pub fn miss_queue_full(&self) -> bool {
        self.miss_queue.len() >= self.cache_config.miss_queue_size
    }

    #[must_use]
    pub fn pref_miss_queue_full(&self) -> bool {
        self.pref_miss_queue.len() >= self.cache_config.miss_queue_size
    }

    /// The fetch was accepted and is waiting on the lower memory level.
    #[must_use]
    pub fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.pending.contains_key(&fetch.uid)
    }

    /// Accepted accesses that had to wait for memory are now ready.
    ///
    /// Does not include accesses that hit.
    #[must_use]
    pub fn has_ready_accesses(&self) -> bool {
        self.mshrs.access_ready()
    }

    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        self.mshrs.ready_accesses()
    }

    /// Pop the next ready access.
    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.mshrs.next_access()
    }

    /// Invalidate all entries.
    pub fn flush(&mut self) {
        self.tag_array.flush();
    }

    /// Read miss handler: check for an MSHR hit or an available MSHR slot.
    ///
    /// On an MSHR hit with merge room, the access merges into the existing
    /// entry and no new downstream request is made. On an MSHR miss with
    /// room in both the table and the miss queue, the request is enlarged to
    /// a full line, recorded in the side table and queued downstream. Any
    /// other combination does nothing; the caller reports the reservation
    /// failure.
    pub fn send_read_request(
        &mut self,
        addr: address,
        block_addr: address,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        read_only: bool,
        write_allocate: bool,
    ) -> (bool, bool, Option<tag_array::EvictedBlockInfo>) {
        let mut should_miss = false;
        let mut writeback = false;
        let mut evicted = None;

        let mshr_addr = self.controller.mshr_addr(fetch.addr());
        let mshr_hit = self.mshrs.probe(mshr_addr);
        let mshr_full = self.mshrs.full(mshr_addr);

        log::debug!(
            "{}::send_read_request({fetch}) addr={addr} block={block_addr} mshr_addr={mshr_addr} mshr_hit={mshr_hit} mshr_full={mshr_full} miss_queue_full={}",
            self.name,
            self.miss_queue_full(),
        );

        if mshr_hit && !mshr_full {
            let result = self.tag_array.access(block_addr, time);
            if !read_only {
                writeback = result.writeback;
                evicted = result.evicted;
            }
            self.mshrs.add(mshr_addr, fetch);
            should_miss = true;
        } else if !mshr_hit && !mshr_full && !self.miss_queue_full() {
            let result = self.tag_array.access(block_addr, time);
            if !read_only {
                writeback = result.writeback;
                evicted = result.evicted;
            }

            self.pending.insert(
                fetch.uid,
                PendingRequest {
                    block_addr: mshr_addr,
                    addr: fetch.addr(),
                    cache_index: result.index,
                    data_size: fetch.data_size(),
                    is_prefetch: false,
                },
            );
            self.mshrs.add(mshr_addr, fetch.clone());

            // the downstream trip reads the whole line at its block address
            let mut outgoing = fetch;
            outgoing.set_data_size(self.cache_config.line_size);
            outgoing.set_addr(mshr_addr);
            outgoing.set_status(self.miss_queue_status, time);
            self.miss_queue.push_back(outgoing);
            if !write_allocate {
                events.push(cache::Event::new(cache::event::Kind::READ_REQUEST_SENT));
            }
            should_miss = true;
        }
        (should_miss, writeback, evicted)
    }

    /// Prefetch miss handler, independent of the demand path.
    ///
    /// The carrier is released when the MSHR already covers the address,
    /// when resources are exhausted, or when the demand miss queue has more
    /// than [`PREF_MAX_DEMAND_IN_FLIGHT`] requests in flight.
    pub fn send_read_request_pref(
        &mut self,
        mut fetch: mem_fetch::MemFetch,
        time: u64,
        read_only: bool,
    ) -> (bool, bool, Option<tag_array::EvictedBlockInfo>) {
        let block_addr = self.controller.block_addr(fetch.addr());
        let mshr_hit = self.mshrs.probe(block_addr);
        let mshr_full = self.mshrs.full(block_addr);

        if mshr_hit {
            // demand traffic already covers this block
            log::trace!("{}::prefetch to {block_addr:#x} coalesced, dropped", self.name);
            return (false, false, None);
        }
        if mshr_full
            || self.pref_miss_queue_full()
            || self.miss_queue.len() > PREF_MAX_DEMAND_IN_FLIGHT
        {
            return (false, false, None);
        }

        let result = self.tag_array.pref_access(block_addr, time, read_only);
        if result.status != cache::RequestStatus::MISS {
            return (false, false, None);
        }

        fetch.is_prefetch = true;
        self.pending.insert(
            fetch.uid,
            PendingRequest {
                block_addr,
                addr: fetch.addr(),
                cache_index: result.index,
                data_size: fetch.data_size(),
                is_prefetch: true,
            },
        );
        self.mshrs.add(block_addr, fetch.clone());

        let mut outgoing = fetch;
        outgoing.set_data_size(self.cache_config.line_size);
        outgoing.set_addr(block_addr);
        outgoing.set_status(self.miss_queue_status, time);
        log::trace!(
            "{}::prefetch to {block_addr:#x} admitted (warp {})",
            self.name,
            outgoing.warp_id
        );
        self.pref_miss_queue.push_back(outgoing);

        (true, result.writeback, result.evicted)
    }
}

impl<I> cache::Component for Base<I>
where
    I: ic::MemFetchInterface,
{
    /// Send the next request to the lower level of memory.
    ///
    /// The prefetch miss queue drains first; admission gating keeps it from
    /// starving demand.
    fn cycle(&mut self, cycle: u64) {
        log::debug!(
            "{}::cycle miss queue={:?} pref miss queue={:?}",
            self.name,
            style(
                self.miss_queue
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            )
            .blue(),
            style(
                self.pref_miss_queue
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            )
            .magenta(),
        );
        if let Some(fetch) = self.pref_miss_queue.front() {
            if !self.mem_port.full(fetch.size(), fetch.is_write()) {
                let fetch = self.pref_miss_queue.pop_front().unwrap();
                self.mem_port.push(fetch, cycle);
            }
        } else if let Some(fetch) = self.miss_queue.front() {
            if !self.mem_port.full(fetch.size(), fetch.is_write()) {
                let fetch = self.miss_queue.pop_front().unwrap();
                self.mem_port.push(fetch, cycle);
            }
        }

        let data_port_busy = !self.bandwidth.data_port_free();
        let fill_port_busy = !self.bandwidth.fill_port_free();
        self.stats
            .sample_cache_port_utility(data_port_busy, fill_port_busy);
        self.bandwidth.replenish_port_bandwidth();
    }
}

impl<I> Base<I> {
    /// Accept a response from the lower memory level.
    ///
    /// Bandwidth restrictions are modeled in the caller.
    pub fn fill(&mut self, mut fetch: mem_fetch::MemFetch, time: u64) {
        let Some(pending) = self.pending.remove(&fetch.uid) else {
            panic!("{}::fill({fetch}): request not in side table", self.name);
        };
        self.bandwidth.use_fill_port();

        // restore the original (sub-line) request shape
        fetch.set_data_size(pending.data_size);
        fetch.set_addr(pending.addr);

        match self.cache_config.allocate_policy {
            cache::config::AllocatePolicy::ON_MISS => {
                let index = pending.cache_index.expect("on-miss fill has a cache index");
                self.tag_array.pref_fill(index, time, pending.is_prefetch);
            }
            cache::config::AllocatePolicy::ON_FILL => {
                self.tag_array.fill_on_fill(pending.block_addr, time);
            }
        }

        let has_atomic = self.mshrs.mark_ready(pending.block_addr);
        if has_atomic {
            debug_assert_eq!(
                self.cache_config.allocate_policy,
                cache::config::AllocatePolicy::ON_MISS
            );
            // an atomic among the merged waiters leaves the line dirty
            let block = self
                .tag_array
                .get_block_mut(pending.cache_index.expect("on-miss fill has a cache index"));
            block.set_status(cache::block::Status::MODIFIED);
        }
    }
}

impl<I> std::fmt::Display for Base<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Cache {}: {}", self.name, self.tag_array)?;
        write!(f, "{}", self.mshrs)
    }
}

impl<I> cache::Bandwidth for Base<I> {
    fn has_free_data_port(&self) -> bool {
        self.bandwidth.data_port_free()
    }

    fn has_free_fill_port(&self) -> bool {
        self.bandwidth.fill_port_free()
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{self, Component};
    use crate::mem_fetch::{self, access, AccessKind, ByteMask, WarpMask};
    use crate::{config, interconn as ic};
    use std::sync::Arc;

    fn test_config() -> config::Cache {
        config::Cache {
            num_sets: 4,
            line_size: 128,
            associativity: 2,
            replacement_policy: cache::config::ReplacementPolicy::LRU,
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

    fn base() -> super::Base<ic::BufferedPort> {
        super::Builder {
            name: "base".to_string(),
            core_id: 0,
            level: cache::Level::L1,
            config: Arc::new(test_config()),
            mem_port: Arc::new(ic::BufferedPort::new(None)),
            miss_queue_status: mem_fetch::Status::IN_L1D_MISS_QUEUE,
        }
        .build()
    }

    fn read(addr: crate::address) -> mem_fetch::MemFetch {
        mem_fetch::Builder {
            access: access::Builder {
                kind: AccessKind::GLOBAL_ACC_R,
                addr,
                req_size_bytes: 32,
                is_write: false,
                warp_active_mask: WarpMask::ZERO,
                byte_mask: ByteMask::ZERO,
            }
            .build(),
            warp_id: 0,
            cta_id: 0,
            core_id: 0,
            pc: 0x40,
            thread0_active: true,
            is_atomic: false,
        }
        .build()
    }

    #[test]
    fn read_request_reshapes_for_downstream_and_restores_on_fill() {
        let mut base = base();
        let fetch = read(0x1010);
        let uid = fetch.uid;
        let block_addr = 0x1000;
        let mut events = Vec::new();

        let (should_miss, writeback, evicted) =
            base.send_read_request(0x1010, block_addr, fetch, 1, &mut events, false, false);
        assert!(should_miss);
        assert!(!writeback);
        assert!(evicted.is_none());
        assert!(cache::event::was_read_sent(&events));

        // the queued request covers the full line at the block address
        let outgoing = base.miss_queue.front().unwrap();
        assert_eq!(outgoing.uid, uid);
        assert_eq!(outgoing.addr(), block_addr);
        assert_eq!(outgoing.data_size(), 128);
        assert!(base.waiting_for_fill(outgoing));

        base.cycle(2);
        assert!(base.miss_queue.is_empty());
        let returned = base.mem_port.pop().unwrap();

        base.fill(returned, 5);
        assert!(base.has_ready_accesses());
        let ready = base.next_access().unwrap();
        assert_eq!(ready.uid, uid);
        // the waiter kept its original shape
        assert_eq!(ready.addr(), 0x1010);
        assert_eq!(ready.data_size(), 32);
    }

    #[test]
    fn merged_read_does_not_requeue() {
        let mut base = base();
        let mut events = Vec::new();
        let (should_miss, ..) =
            base.send_read_request(0x1000, 0x1000, read(0x1000), 1, &mut events, false, false);
        assert!(should_miss);
        assert_eq!(base.miss_queue.len(), 1);

        let (should_miss, ..) =
            base.send_read_request(0x1020, 0x1000, read(0x1020), 2, &mut events, false, false);
        assert!(should_miss);
        // merged into the existing MSHR entry
        assert_eq!(base.miss_queue.len(), 1);
        assert_eq!(base.mshrs.get(0x1000).unwrap().len(), 2);
    }

    #[test]
    fn prefetch_covered_by_mshr_is_dropped() {
        let mut base = base();
        let mut events = Vec::new();
        let (should_miss, ..) =
            base.send_read_request(0x1000, 0x1000, read(0x1000), 1, &mut events, false, false);
        assert!(should_miss);
        let queued = base.miss_queue.len();

        let (pref_miss, ..) = base.send_read_request_pref(read(0x1000), 2, false);
        assert!(!pref_miss);
        assert_eq!(base.miss_queue.len(), queued);
        assert!(base.pref_miss_queue.is_empty());
        assert_eq!(base.mshrs.get(0x1000).unwrap().len(), 1);
    }

    #[test]
    fn prefetch_respects_demand_in_flight_cap() {
        let mut base = base();
        let mut events = Vec::new();
        for (i, addr) in [0x1000u64, 0x2080, 0x3100].iter().enumerate() {
            let (should_miss, ..) = base.send_read_request(
                *addr,
                *addr,
                read(*addr),
                i as u64,
                &mut events,
                false,
                false,
            );
            assert!(should_miss);
        }
        assert_eq!(base.miss_queue.len(), 3);

        let (pref_miss, ..) = base.send_read_request_pref(read(0x4180), 5, false);
        assert!(!pref_miss);
        assert!(base.pref_miss_queue.is_empty());
    }

    #[test]
    fn admitted_prefetch_goes_to_prefetch_queue() {
        let mut base = base();
        let (pref_miss, writeback, _) = base.send_read_request_pref(read(0x1000), 1, false);
        assert!(pref_miss);
        assert!(!writeback);
        assert_eq!(base.pref_miss_queue.len(), 1);
        assert!(base.miss_queue.is_empty());
        assert!(base.mshrs.probe(0x1000));

        // the prefetch queue drains before the demand queue
        let mut events = Vec::new();
        let (should_miss, ..) =
            base.send_read_request(0x2000, 0x2000, read(0x2000), 2, &mut events, false, false);
        assert!(should_miss);
        base.cycle(3);
        assert_eq!(base.mem_port.pop().unwrap().addr(), 0x1000);
        assert_eq!(base.miss_queue.len(), 1);

        base.cycle(4);
        assert_eq!(base.mem_port.pop().unwrap().addr(), 0x2000);
    }

    #[test]
    fn filled_prefetch_marks_line_prefetched() {
        let mut base = base();
        let (pref_miss, ..) = base.send_read_request_pref(read(0x1000), 1, false);
        assert!(pref_miss);
        base.cycle(2);
        let returned = base.mem_port.pop().unwrap();
        base.fill(returned, 5);

        let (index, status) = base.tag_array.probe(0x1000);
        assert_eq!(status, cache::RequestStatus::HIT);
        assert!(base.tag_array.get_block(index.unwrap()).is_prefetched());
    }

    #[test]
    fn atomic_waiter_dirties_filled_line() {
        let mut base = base();
        let mut atomic = read(0x1000);
        atomic.is_atomic = true;
        let mut events = Vec::new();
        let (should_miss, ..) =
            base.send_read_request(0x1000, 0x1000, atomic, 1, &mut events, false, false);
        assert!(should_miss);
        base.cycle(2);
        let returned = base.mem_port.pop().unwrap();
        base.fill(returned, 5);

        let (index, _) = base.tag_array.probe(0x1000);
        assert!(base.tag_array.get_block(index.unwrap()).is_modified());
    }

    #[test]
    #[should_panic(expected = "not in side table")]
    fn fill_for_unknown_request_is_fatal() {
        let mut base = base();
        base.fill(read(0x1000), 1);
    }
}
