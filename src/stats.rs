use crate::cache::RequestStatus;
use crate::mem_fetch::AccessKind;
use std::collections::HashMap;

/// Per-cache counter matrix over (access kind, request status), plus port
/// utilization samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cache {
    accesses: HashMap<(AccessKind, RequestStatus), u64>,

    pub num_port_available_cycles: u64,
    pub num_data_port_busy_cycles: u64,
    pub num_fill_port_busy_cycles: u64,
}

/// Reduction of the counter matrix the host reports on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubStats {
    pub accesses: u64,
    pub misses: u64,
    pub pending_hits: u64,
    pub res_fails: u64,

    pub port_available_cycles: u64,
    pub data_port_busy_cycles: u64,
    pub fill_port_busy_cycles: u64,
}

impl Cache {
    pub fn inc(&mut self, kind: AccessKind, status: RequestStatus, count: u64) {
        *self.accesses.entry((kind, status)).or_insert(0) += count;
    }

    #[must_use]
    pub fn count(&self, kind: AccessKind, status: RequestStatus) -> u64 {
        self.accesses.get(&(kind, status)).copied().unwrap_or(0)
    }

    /// Sampled once per cycle by the cache shell.
    pub fn sample_cache_port_utility(&mut self, data_port_busy: bool, fill_port_busy: bool) {
        self.num_port_available_cycles += 1;
        if data_port_busy {
            self.num_data_port_busy_cycles += 1;
        }
        if fill_port_busy {
            self.num_fill_port_busy_cycles += 1;
        }
    }

    #[must_use]
    pub fn sub_stats(&self) -> SubStats {
        let mut sub = SubStats {
            port_available_cycles: self.num_port_available_cycles,
            data_port_busy_cycles: self.num_data_port_busy_cycles,
            fill_port_busy_cycles: self.num_fill_port_busy_cycles,
            ..SubStats::default()
        };
        for (&(_, status), &count) in &self.accesses {
            match status {
                RequestStatus::HIT | RequestStatus::MISS | RequestStatus::HIT_RESERVED => {
                    sub.accesses += count;
                }
                RequestStatus::RESERVATION_FAIL => {}
            }
            match status {
                RequestStatus::MISS => sub.misses += count,
                RequestStatus::HIT_RESERVED => sub.pending_hits += count,
                RequestStatus::RESERVATION_FAIL => sub.res_fails += count,
                RequestStatus::HIT => {}
            }
        }
        sub
    }

    pub fn clear(&mut self) {
        self.accesses.clear();
        self.num_port_available_cycles = 0;
        self.num_data_port_busy_cycles = 0;
        self.num_fill_port_busy_cycles = 0;
    }
}

impl std::ops::AddAssign<&Cache> for Cache {
    fn add_assign(&mut self, other: &Cache) {
        for (&key, &count) in &other.accesses {
            *self.accesses.entry(key).or_insert(0) += count;
        }
        self.num_port_available_cycles += other.num_port_available_cycles;
        self.num_data_port_busy_cycles += other.num_data_port_busy_cycles;
        self.num_fill_port_busy_cycles += other.num_fill_port_busy_cycles;
    }
}

impl std::fmt::Display for Cache {
    /// Prints each non-zero counter as `[<kind>][<status>] = <count>`.
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use strum::IntoEnumIterator;
        for kind in AccessKind::iter() {
            for status in RequestStatus::iter() {
                let count = self.count(kind, status);
                if count > 0 {
                    writeln!(f, "\t[{kind:?}][{status:?}] = {count}")?;
                }
            }
        }
        Ok(())
    }
}
