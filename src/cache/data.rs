use crate::cache::controller::CacheController;
use crate::cache::event::Kind as EventKind;
use crate::cache::{self, base, RequestStatus};
use crate::mem_fetch::{self, AccessKind, ByteMask, WarpMask};
use crate::{address, config, interconn as ic, stats, tag_array};
use std::collections::VecDeque;
use std::sync::Arc;

/// Data cache.
///
/// Routes the result of the tag probe through the configured write-hit,
/// write-miss, read-hit and read-miss policies, and runs the stride
/// prefetcher alongside qualifying L1 demand reads.
pub struct Data<I> {
    pub inner: base::Base<I>,

    /// Access kind of synthesized write-allocate reads (L1 or L2).
    write_alloc_type: AccessKind,
    /// Access kind of synthesized writebacks (L1 or L2).
    write_back_type: AccessKind,
}

#[derive(Debug, Clone)]
pub struct Builder<I> {
    pub name: String,
    pub core_id: usize,
    pub level: cache::Level,
    pub config: Arc<config::Cache>,
    pub mem_port: Arc<I>,
    pub miss_queue_status: mem_fetch::Status,
    pub write_alloc_type: AccessKind,
    pub write_back_type: AccessKind,
}

impl<I> Builder<I> {
    #[must_use]
    pub fn build(self) -> Data<I> {
        let inner = base::Builder {
            name: self.name,
            core_id: self.core_id,
            level: self.level,
            config: self.config,
            mem_port: self.mem_port,
            miss_queue_status: self.miss_queue_status,
        }
        .build();
        Data {
            inner,
            write_alloc_type: self.write_alloc_type,
            write_back_type: self.write_back_type,
        }
    }
}

impl<I> Data<I> {
    /// Send a write or writeback to the lower memory level.
    fn send_write_request(
        &mut self,
        mut fetch: mem_fetch::MemFetch,
        event: cache::Event,
        time: u64,
        events: &mut Vec<cache::Event>,
    ) {
        log::debug!("{}::send_write_request({fetch})", self.inner.name);
        events.push(event);
        fetch.set_status(self.inner.miss_queue_status, time);
        self.inner.miss_queue.push_back(fetch);
    }

    /// Queue a writeback caused by a prefetch allocation.
    ///
    /// Goes out on the prefetch miss queue and produces no event.
    fn send_write_request_pref(&mut self, mut fetch: mem_fetch::MemFetch, time: u64) {
        fetch.set_status(self.inner.miss_queue_status, time);
        self.inner.pref_miss_queue.push_back(fetch);
    }

    fn writeback_fetch(&self, evicted: &tag_array::EvictedBlockInfo) -> mem_fetch::MemFetch {
        mem_fetch::Builder {
            access: mem_fetch::access::Builder {
                kind: self.write_back_type,
                addr: evicted.block_addr,
                req_size_bytes: evicted.modified_size,
                is_write: true,
                warp_active_mask: WarpMask::ZERO,
                byte_mask: ByteMask::ZERO,
            }
            .build(),
            warp_id: 0,
            cta_id: 0,
            core_id: self.inner.core_id,
            pc: 0,
            thread0_active: false,
            is_atomic: false,
        }
        .build()
    }

    /// Write-back hit: mark the block modified.
    fn write_hit_write_back(
        &mut self,
        addr: address,
        cache_index: usize,
        _fetch: &mem_fetch::MemFetch,
        time: u64,
        _events: &mut Vec<cache::Event>,
        _probe_status: RequestStatus,
    ) -> RequestStatus {
        let block_addr = self.inner.controller.block_addr(addr);
        // update LRU state
        let result = self.inner.tag_array.access(block_addr, time);
        debug_assert_eq!(result.index, Some(cache_index));
        let block = self.inner.tag_array.get_block_mut(cache_index);
        block.set_status(cache::block::Status::MODIFIED);
        RequestStatus::HIT
    }

    /// Write-through hit: mark modified and send the write downstream.
    fn write_hit_write_through(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: RequestStatus,
    ) -> RequestStatus {
        if self.inner.miss_queue_full() {
            // cannot handle the request this cycle
            return RequestStatus::RESERVATION_FAIL;
        }
        let block_addr = self.inner.controller.block_addr(addr);
        // update LRU state
        let result = self.inner.tag_array.access(block_addr, time);
        debug_assert_eq!(result.index, Some(cache_index));
        let block = self.inner.tag_array.get_block_mut(cache_index);
        block.set_status(cache::block::Status::MODIFIED);

        let event = cache::Event::new(EventKind::WRITE_REQUEST_SENT);
        self.send_write_request(fetch, event, time, events);
        RequestStatus::HIT
    }

    /// Write-evict hit: send the write downstream and invalidate the block.
    fn write_hit_write_evict(
        &mut self,
        _addr: address,
        cache_index: usize,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: RequestStatus,
    ) -> RequestStatus {
        if self.inner.miss_queue_full() {
            // cannot handle the request this cycle
            return RequestStatus::RESERVATION_FAIL;
        }
        let block = self.inner.tag_array.get_block_mut(cache_index);
        block.set_status(cache::block::Status::INVALID);

        let event = cache::Event::new(EventKind::WRITE_REQUEST_SENT);
        self.send_write_request(fetch, event, time, events);
        RequestStatus::HIT
    }

    /// Global write-evict, local write-back: useful for private caches.
    fn write_hit_global_write_evict_local_write_back(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        probe_status: RequestStatus,
    ) -> RequestStatus {
        // evict a line that hits on a global memory write
        if fetch.access_kind() == AccessKind::GLOBAL_ACC_W {
            self.write_hit_write_evict(addr, cache_index, fetch, time, events, probe_status)
        } else {
            self.write_hit_write_back(addr, cache_index, &fetch, time, events, probe_status)
        }
    }

    fn write_hit(
        &mut self,
        addr: address,
        cache_index: usize,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        probe_status: RequestStatus,
    ) -> RequestStatus {
        use cache::config::WritePolicy;
        match self.inner.cache_config.write_policy {
            WritePolicy::READ_ONLY => {
                panic!("write hit dispatched on a read-only cache")
            }
            WritePolicy::WRITE_BACK => {
                self.write_hit_write_back(addr, cache_index, &fetch, time, events, probe_status)
            }
            WritePolicy::WRITE_THROUGH => {
                self.write_hit_write_through(addr, cache_index, fetch, time, events, probe_status)
            }
            WritePolicy::WRITE_EVICT => {
                self.write_hit_write_evict(addr, cache_index, fetch, time, events, probe_status)
            }
            WritePolicy::LOCAL_WB_GLOBAL_WE => self
                .write_hit_global_write_evict_local_write_back(
                    addr,
                    cache_index,
                    fetch,
                    time,
                    events,
                    probe_status,
                ),
        }
    }

    /// Write-allocate miss: send the write downstream and a read request
    /// for the same block.
    ///
    /// Worst case needs three miss queue slots (write miss, allocate read,
    /// writeback) plus MSHR room for the allocate read; anything less is a
    /// reservation failure.
    fn write_miss_write_allocate(
        &mut self,
        addr: address,
        _cache_index: Option<usize>,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: RequestStatus,
    ) -> RequestStatus {
        let block_addr = self.inner.controller.block_addr(addr);
        let mshr_addr = self.inner.controller.mshr_addr(fetch.addr());
        let mshr_hit = self.inner.mshrs.probe(mshr_addr);
        let mshr_avail = !self.inner.mshrs.full(mshr_addr);

        let mshr_ok =
            (mshr_hit && mshr_avail) || (!mshr_hit && mshr_avail && !self.inner.miss_queue_full());
        if !self.inner.miss_queue_can_fit(2) || !mshr_ok {
            return RequestStatus::RESERVATION_FAIL;
        }

        // the allocate read inherits the write's masks and warp identity
        let read_fetch = mem_fetch::Builder {
            access: mem_fetch::access::Builder {
                kind: self.write_alloc_type,
                addr: fetch.addr(),
                req_size_bytes: fetch.data_size(),
                is_write: false,
                warp_active_mask: fetch.access.warp_active_mask,
                byte_mask: fetch.access.byte_mask,
            }
            .build(),
            warp_id: fetch.warp_id,
            cta_id: fetch.cta_id,
            core_id: fetch.core_id,
            pc: fetch.pc,
            thread0_active: false,
            is_atomic: false,
        }
        .build();

        let event = cache::Event::new(EventKind::WRITE_REQUEST_SENT);
        self.send_write_request(fetch, event, time, events);

        let (should_miss, writeback, evicted) = self.inner.send_read_request(
            addr, block_addr, read_fetch, time, events, false, true,
        );

        if should_miss {
            events.push(cache::Event::new(EventKind::READ_REQUEST_SENT));
            // a modified victim is written back unless the lower level
            // already has the data (write-through)
            if writeback && !self.inner.cache_config.write_policy.is_write_through() {
                if let Some(evicted) = evicted {
                    let writeback_fetch = self.writeback_fetch(&evicted);
                    let event = cache::Event {
                        kind: EventKind::WRITE_BACK_REQUEST_SENT,
                        evicted_block: Some(evicted),
                    };
                    self.send_write_request(writeback_fetch, event, time, events);
                }
            }
            return RequestStatus::MISS;
        }
        RequestStatus::RESERVATION_FAIL
    }

    /// No-write-allocate miss: send the write downstream, nothing else.
    fn write_miss_no_write_allocate(
        &mut self,
        _addr: address,
        _cache_index: Option<usize>,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: RequestStatus,
    ) -> RequestStatus {
        if self.inner.miss_queue_full() {
            // cannot handle the request this cycle
            return RequestStatus::RESERVATION_FAIL;
        }
        // no write buffering: too many threads for that
        let event = cache::Event::new(EventKind::WRITE_REQUEST_SENT);
        self.send_write_request(fetch, event, time, events);
        RequestStatus::MISS
    }

    fn write_miss(
        &mut self,
        addr: address,
        cache_index: Option<usize>,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        probe_status: RequestStatus,
    ) -> RequestStatus {
        use cache::config::WriteAllocatePolicy;
        match self.inner.cache_config.write_allocate_policy {
            WriteAllocatePolicy::WRITE_ALLOCATE => {
                self.write_miss_write_allocate(addr, cache_index, fetch, time, events, probe_status)
            }
            WriteAllocatePolicy::NO_WRITE_ALLOCATE => self.write_miss_no_write_allocate(
                addr,
                cache_index,
                fetch,
                time,
                events,
                probe_status,
            ),
        }
    }

    /// Read hit: update LRU state; atomics additionally dirty the line.
    fn read_hit(
        &mut self,
        addr: address,
        fetch: &mem_fetch::MemFetch,
        time: u64,
    ) -> RequestStatus {
        let block_addr = self.inner.controller.block_addr(addr);
        let result = self.inner.tag_array.access(block_addr, time);
        let cache_index = result.index.expect("read hit has a cache index");

        // atomics are treated as global read/write requests: perform the
        // read, mark the line modified
        if fetch.is_atomic() {
            debug_assert_eq!(fetch.access_kind(), AccessKind::GLOBAL_ACC_R);
            let block = self.inner.tag_array.get_block_mut(cache_index);
            block.set_status(cache::block::Status::MODIFIED);
        }
        RequestStatus::HIT
    }

    /// Read miss: send a read request downstream and write back a modified
    /// victim as necessary.
    fn read_miss(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        time: u64,
        events: &mut Vec<cache::Event>,
        _probe_status: RequestStatus,
    ) -> RequestStatus {
        if !self.inner.miss_queue_can_fit(1) {
            // cannot handle the request this cycle: it may need to
            // generate two requests
            return RequestStatus::RESERVATION_FAIL;
        }

        let block_addr = self.inner.controller.block_addr(addr);
        let (should_miss, writeback, evicted) = self.inner.send_read_request(
            addr, block_addr, fetch, time, events, false, false,
        );

        if should_miss {
            // a modified victim is written back unless the lower level
            // already has the data (write-through)
            if writeback && !self.inner.cache_config.write_policy.is_write_through() {
                if let Some(evicted) = evicted {
                    let writeback_fetch = self.writeback_fetch(&evicted);
                    let event = cache::Event {
                        kind: EventKind::WRITE_BACK_REQUEST_SENT,
                        evicted_block: Some(evicted),
                    };
                    self.send_write_request(writeback_fetch, event, time, events);
                }
            }
            return RequestStatus::MISS;
        }
        RequestStatus::RESERVATION_FAIL
    }

    /// Route the result of a tag probe to the matching policy handler.
    ///
    /// A failed probe (all ways reserved) is propagated without invoking a
    /// handler. The data port is charged based on the final outcome.
    fn process_tag_probe(
        &mut self,
        is_write: bool,
        probe: (Option<usize>, RequestStatus),
        addr: address,
        fetch: mem_fetch::MemFetch,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> RequestStatus {
        let (cache_index, probe_status) = probe;
        let data_size = fetch.data_size();

        let access_status = if is_write {
            match (cache_index, probe_status) {
                (Some(index), RequestStatus::HIT) => {
                    self.write_hit(addr, index, fetch, time, events, probe_status)
                }
                (_, RequestStatus::RESERVATION_FAIL) => RequestStatus::RESERVATION_FAIL,
                _ => self.write_miss(addr, cache_index, fetch, time, events, probe_status),
            }
        } else {
            match (cache_index, probe_status) {
                (Some(_), RequestStatus::HIT) => self.read_hit(addr, &fetch, time),
                (_, RequestStatus::RESERVATION_FAIL) => RequestStatus::RESERVATION_FAIL,
                _ => self.read_miss(addr, fetch, time, events, probe_status),
            }
        };

        self.inner
            .bandwidth
            .use_data_port(data_size, access_status, events);
        access_status
    }

    /// Rewrite the prefetch carrier to the current candidate and submit it.
    ///
    /// A candidate is eligible while valid, or while a previous valid
    /// prediction is still fresh enough to retry. Otherwise the carrier is
    /// released.
    fn issue_prefetch(&mut self, mut carrier: mem_fetch::MemFetch, time: u64) {
        let candidate = self.inner.tag_array.prefetcher.candidate();
        if candidate.addr == 0 || !candidate.fresh() {
            return;
        }
        let block_addr = self.inner.controller.block_addr(candidate.addr);
        carrier.warp_id = candidate.warp_id;
        carrier.set_addr(block_addr);

        let (should_miss, writeback, evicted) =
            self.inner.send_read_request_pref(carrier, time, false);
        if should_miss && writeback && !self.inner.cache_config.write_policy.is_write_through() {
            if let Some(evicted) = evicted {
                let writeback_fetch = self.writeback_fetch(&evicted);
                self.send_write_request_pref(writeback_fetch, time);
            }
        }
    }
}

impl<I> std::fmt::Display for Data<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl<I> cache::Component for Data<I>
where
    I: ic::MemFetchInterface,
{
    fn cycle(&mut self, cycle: u64) {
        self.inner.cycle(cycle);
    }
}

impl<I> cache::Cache for Data<I>
where
    I: ic::MemFetchInterface,
{
    fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        pref_fetch: Option<mem_fetch::MemFetch>,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> RequestStatus {
        debug_assert!(fetch.data_size() <= self.inner.cache_config.line_size);

        let is_write = fetch.is_write();
        let access_kind = fetch.access_kind();
        let warp_id = fetch.warp_id;
        let cta_id = fetch.cta_id;
        let block_addr = self.inner.controller.block_addr(addr);
        let is_l1 = self.inner.level == cache::Level::L1;

        log::debug!(
            "{}::access({fetch}, write={is_write}, size={}, block={block_addr}, time={time})",
            self.inner.name,
            fetch.data_size(),
        );

        // global and local reads at L1 feed the locality instrumentation
        // and the prefetcher's learning path
        let track_locality = is_l1
            && matches!(
                access_kind,
                AccessKind::GLOBAL_ACC_R | AccessKind::LOCAL_ACC_R
            );
        let probe = if track_locality {
            self.inner.tag_array.probe_locality(block_addr, &fetch, time)
        } else {
            self.inner.tag_array.probe(block_addr)
        };
        let probe_status = probe.1;

        let access_status = self.process_tag_probe(is_write, probe, addr, fetch, events, time);

        if track_locality {
            let prefetcher = &mut self.inner.tag_array.prefetcher;
            match self.inner.cache_config.scheduler_policy {
                config::SchedulerPolicy::GreedyThenOldest => {
                    prefetcher.calculate_inter_pref_addr(warp_id, cta_id);
                }
                config::SchedulerPolicy::RoundRobin => {
                    prefetcher.calculate_intra_pref_addr(warp_id);
                }
            }
        }

        if let Some(carrier) = pref_fetch {
            if is_l1 {
                self.issue_prefetch(carrier, time);
            }
            // dropped otherwise: prefetching is an L1 concern
        }

        self.inner
            .stats
            .inc(access_kind, cache::select_status(probe_status, access_status), 1);
        access_status
    }

    fn fill(&mut self, fetch: mem_fetch::MemFetch, time: u64) {
        self.inner.fill(fetch, time);
    }

    fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool {
        self.inner.waiting_for_fill(fetch)
    }

    fn has_ready_accesses(&self) -> bool {
        self.inner.has_ready_accesses()
    }

    fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        self.inner.ready_accesses()
    }

    fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        self.inner.next_access()
    }

    fn flush(&mut self) {
        self.inner.flush();
    }

    fn stats(&self) -> &stats::Cache {
        &self.inner.stats
    }
}

impl<I> cache::Bandwidth for Data<I> {
    fn has_free_data_port(&self) -> bool {
        self.inner.bandwidth.data_port_free()
    }

    fn has_free_fill_port(&self) -> bool {
        self.inner.bandwidth.fill_port_free()
    }
}
