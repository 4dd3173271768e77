use crate::{address, cache};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which set index hash the cache uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetIndexFunction {
    /// `(addr >> line_sz_log2) & (nset - 1)`; requires power-of-two sets.
    LINEAR,
    /// Fermi L1 hash; only valid for 32 or 64 sets.
    FERMI_HASH,
    /// Placeholder recognized by configuration parsing; using it is a
    /// configuration error.
    CUSTOM,
}

/// Warp scheduling policy of the host core.
///
/// The prefetcher picks its candidate generator based on this: under
/// greedy-then-oldest scheduling warps of a CTA progress at similar rates and
/// the inter-warp generator applies; otherwise the intra-warp generator is
/// used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerPolicy {
    GreedyThenOldest,
    RoundRobin,
}

/// Strips memory-partition bits from an address.
///
/// Supplied by the host for L2 instances so the set index is computed on the
/// partition-stripped address, avoiding set camping across partitions.
pub trait AddressTranslation: std::fmt::Debug + Send + Sync + 'static {
    #[must_use]
    fn partition_address(&self, addr: address) -> address;
}

/// Configures a cache instance.
#[derive(Clone, Debug)]
pub struct Cache {
    pub num_sets: usize,
    pub line_size: u32,
    pub associativity: usize,

    pub replacement_policy: cache::config::ReplacementPolicy,
    pub write_policy: cache::config::WritePolicy,
    pub allocate_policy: cache::config::AllocatePolicy,
    pub write_allocate_policy: cache::config::WriteAllocatePolicy,
    pub set_index_function: SetIndexFunction,

    pub mshr_entries: usize,
    pub mshr_max_merge: usize,
    pub miss_queue_size: usize,

    /// Width of the port to the data array; defaults to the line size.
    pub data_port_width: Option<usize>,

    pub scheduler_policy: SchedulerPolicy,

    /// Partition-address translation for L2 instances.
    pub address_translation: Option<Arc<dyn AddressTranslation>>,
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} sets, {}-way, {} byte line",
            self.num_sets, self.associativity, self.line_size
        )
    }
}

impl Cache {
    /// The width of the port to the data array.
    #[must_use]
    pub fn data_port_width(&self) -> usize {
        let width = self.data_port_width.unwrap_or(self.line_size as usize);
        debug_assert!(self.line_size as usize % width == 0);
        width
    }

    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.num_sets * self.associativity
    }

    #[must_use]
    pub fn line_size_log2(&self) -> u32 {
        self.line_size.ilog2()
    }

    #[must_use]
    pub fn num_sets_log2(&self) -> u32 {
        self.num_sets.ilog2()
    }

    /// Panics on configurations the model cannot represent.
    pub fn validate(&self) {
        assert!(
            self.line_size.is_power_of_two(),
            "line size must be a power of two (got {})",
            self.line_size
        );
        assert!(
            self.num_sets.is_power_of_two(),
            "number of sets must be a power of two (got {})",
            self.num_sets
        );
        assert!(self.associativity > 0, "associativity must be nonzero");
        assert!(self.mshr_entries > 0, "mshr must have at least one entry");
        assert!(self.mshr_max_merge > 0, "mshr merge width must be nonzero");
        assert!(self.miss_queue_size > 0, "miss queue must be nonzero");
        if self.set_index_function == SetIndexFunction::FERMI_HASH {
            assert!(
                matches!(self.num_sets, 32 | 64),
                "fermi set index hash requires 32 or 64 sets (got {})",
                self.num_sets
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::config::{
        AllocatePolicy, ReplacementPolicy, WriteAllocatePolicy, WritePolicy,
    };

    fn base() -> Cache {
        Cache {
            num_sets: 4,
            line_size: 128,
            associativity: 2,
            replacement_policy: ReplacementPolicy::LRU,
            write_policy: WritePolicy::WRITE_BACK,
            allocate_policy: AllocatePolicy::ON_MISS,
            write_allocate_policy: WriteAllocatePolicy::WRITE_ALLOCATE,
            set_index_function: SetIndexFunction::LINEAR,
            mshr_entries: 4,
            mshr_max_merge: 4,
            miss_queue_size: 8,
            data_port_width: None,
            scheduler_policy: SchedulerPolicy::GreedyThenOldest,
            address_translation: None,
        }
    }

    #[test]
    fn data_port_width_defaults_to_line_size() {
        let config = base();
        assert_eq!(config.data_port_width(), 128);
        let config = Cache {
            data_port_width: Some(32),
            ..base()
        };
        assert_eq!(config.data_port_width(), 32);
    }

    #[test]
    #[should_panic(expected = "32 or 64 sets")]
    fn fermi_hash_requires_32_or_64_sets() {
        let config = Cache {
            set_index_function: SetIndexFunction::FERMI_HASH,
            ..base()
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_line_size() {
        let config = Cache {
            line_size: 96,
            ..base()
        };
        config.validate();
    }
}
