use crate::cache::{self, base, RequestStatus};
use crate::{address, config, interconn as ic, mem_fetch, stats};
use std::collections::VecDeque;
use std::sync::Arc;

/// Read-only cache for constant and instruction-like traffic.
#[derive(Debug)]
pub struct ReadOnly<I> {
    pub inner: base::Base<I>,
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
    pub fn build(self) -> ReadOnly<I> {
        let inner = base::Builder {
            name: self.name,
            core_id: self.core_id,
            level: self.level,
            config: self.config,
            mem_port: self.mem_port,
            miss_queue_status: self.miss_queue_status,
        }
        .build();
        ReadOnly { inner }
    }
}

impl<I> std::fmt::Display for ReadOnly<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl<I> cache::Component for ReadOnly<I>
where
    I: ic::MemFetchInterface,
{
    fn cycle(&mut self, cycle: u64) {
        self.inner.cycle(cycle);
    }
}

impl<I> cache::Bandwidth for ReadOnly<I> {
    fn has_free_data_port(&self) -> bool {
        self.inner.bandwidth.data_port_free()
    }

    fn has_free_fill_port(&self) -> bool {
        self.inner.bandwidth.fill_port_free()
    }
}

impl<I> cache::Cache for ReadOnly<I>
where
    I: ic::MemFetchInterface,
{
    /// Access the read-only cache.
    ///
    /// Returns `RESERVATION_FAIL` if the request could not be accepted for
    /// any reason. A supplied prefetch carrier is released; prefetching is
    /// a data cache concern.
    fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        _pref_fetch: Option<mem_fetch::MemFetch>,
        events: &mut Vec<cache::Event>,
        time: u64,
    ) -> RequestStatus {
        debug_assert!(fetch.data_size() <= self.inner.cache_config.line_size);
        debug_assert_eq!(
            self.inner.cache_config.write_policy,
            cache::config::WritePolicy::READ_ONLY
        );
        debug_assert!(!fetch.is_write());

        use crate::cache::controller::CacheController;
        let block_addr = self.inner.controller.block_addr(addr);
        let access_kind = fetch.access_kind();

        log::debug!(
            "{}::access({fetch}, block={block_addr}, time={time})",
            self.inner.name,
        );

        let (_, probe_status) = self.inner.tag_array.probe(block_addr);
        let mut status = RequestStatus::RESERVATION_FAIL;

        if probe_status == RequestStatus::HIT {
            // update LRU state
            status = self.inner.tag_array.access(block_addr, time).status;
        } else if probe_status != RequestStatus::RESERVATION_FAIL {
            if self.inner.miss_queue_full() {
                status = RequestStatus::RESERVATION_FAIL;
            } else {
                let (should_miss, ..) = self.inner.send_read_request(
                    addr, block_addr, fetch, time, events, true, false,
                );
                status = if should_miss {
                    RequestStatus::MISS
                } else {
                    RequestStatus::RESERVATION_FAIL
                };
            }
        }
        self.inner
            .stats
            .inc(access_kind, cache::select_status(probe_status, status), 1);
        status
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

#[cfg(test)]
mod tests {
    use crate::cache::{self, Cache as _, Component, RequestStatus};
    use crate::mem_fetch::{self, access, AccessKind, ByteMask, WarpMask};
    use crate::{config, interconn as ic};
    use std::sync::Arc;

    fn readonly() -> super::ReadOnly<ic::BufferedPort> {
        readonly_with_miss_queue(8)
    }

    fn readonly_with_miss_queue(miss_queue_size: usize) -> super::ReadOnly<ic::BufferedPort> {
        let config = config::Cache {
            num_sets: 4,
            line_size: 128,
            associativity: 2,
            replacement_policy: cache::config::ReplacementPolicy::LRU,
            write_policy: cache::config::WritePolicy::READ_ONLY,
            allocate_policy: cache::config::AllocatePolicy::ON_MISS,
            write_allocate_policy: cache::config::WriteAllocatePolicy::NO_WRITE_ALLOCATE,
            set_index_function: config::SetIndexFunction::LINEAR,
            mshr_entries: 4,
            mshr_max_merge: 4,
            miss_queue_size,
            data_port_width: None,
            scheduler_policy: config::SchedulerPolicy::GreedyThenOldest,
            address_translation: None,
        };
        super::Builder {
            name: "L1C".to_string(),
            core_id: 0,
            level: cache::Level::L1,
            config: Arc::new(config),
            mem_port: Arc::new(ic::BufferedPort::new(None)),
            miss_queue_status: mem_fetch::Status::IN_L1C_MISS_QUEUE,
        }
        .build()
    }

    fn read(addr: crate::address) -> mem_fetch::MemFetch {
        mem_fetch::Builder {
            access: access::Builder {
                kind: AccessKind::CONST_ACC_R,
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
    fn miss_fill_hit_roundtrip() {
        let mut cache = readonly();
        let mut events = Vec::new();
        let status = cache.access(0x1000, read(0x1000), None, &mut events, 1);
        assert_eq!(status, RequestStatus::MISS);
        assert!(cache::event::was_read_sent(&events));

        cache.cycle(2);
        let returned = cache.inner.mem_port.pop().unwrap();
        cache.fill(returned, 5);

        let status = cache.access(0x1000, read(0x1000), None, &mut events, 7);
        assert_eq!(status, RequestStatus::HIT);
        assert_eq!(
            cache.stats().count(AccessKind::CONST_ACC_R, RequestStatus::HIT),
            1
        );
    }

    #[test]
    fn full_miss_queue_applies_backpressure() {
        let mut cache = readonly_with_miss_queue(1);
        let mut events = Vec::new();
        assert_eq!(
            cache.access(0x1000, read(0x1000), None, &mut events, 1),
            RequestStatus::MISS
        );
        // different set, but the single-slot miss queue is full
        assert_eq!(
            cache.access(0x1080, read(0x1080), None, &mut events, 2),
            RequestStatus::RESERVATION_FAIL
        );
    }
}
