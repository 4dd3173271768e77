use crate::{address, cache, config, set_index};
use std::sync::Arc;

/// Decomposes request addresses for one cache instance.
///
/// The controller splits an address into the tag field, the set index field
/// and the in-line offset. For generality the tag keeps both index and tag
/// bits: hashed set index functions can map different indexes to the same
/// set, so the full tag + index is required to check for a hit. The tag is
/// therefore identical to the block address.
pub trait CacheController: Sync + Send + 'static {
    /// Compute the cache line tag for an address.
    #[must_use]
    fn tag(&self, addr: address) -> address;

    /// Compute the block address for an address.
    #[must_use]
    fn block_addr(&self, addr: address) -> address;

    /// Compute the set index for an address.
    #[must_use]
    fn set_index(&self, addr: address) -> u64;

    /// Compute the miss status holding register address.
    #[must_use]
    fn mshr_addr(&self, addr: address) -> address {
        self.block_addr(addr)
    }
}

#[derive(Debug, Clone)]
pub struct Unit {
    config: cache::Config,
    translation: Option<Arc<dyn config::AddressTranslation>>,
    linear: set_index::linear::SetIndex,
    fermi: set_index::fermi::SetIndex,
}

impl Unit {
    #[must_use]
    pub fn new(
        config: cache::Config,
        translation: Option<Arc<dyn config::AddressTranslation>>,
    ) -> Self {
        Self {
            config,
            translation,
            linear: set_index::linear::SetIndex::default(),
            fermi: set_index::fermi::SetIndex::default(),
        }
    }
}

impl CacheController for Unit {
    fn tag(&self, addr: address) -> address {
        addr & !u64::from(self.config.line_size - 1)
    }

    fn block_addr(&self, addr: address) -> address {
        addr & !u64::from(self.config.line_size - 1)
    }

    fn set_index(&self, addr: address) -> u64 {
        use set_index::SetIndexer;
        // L2 instances index on the partition-stripped address to avoid
        // camping sets across memory partitions.
        if let Some(translation) = &self.translation {
            let part_addr = translation.partition_address(addr);
            return self.linear.compute_set_index(
                part_addr,
                self.config.num_sets,
                self.config.line_size_log2,
                self.config.num_sets_log2,
            );
        }
        match self.config.set_index_function {
            config::SetIndexFunction::LINEAR => self.linear.compute_set_index(
                addr,
                self.config.num_sets,
                self.config.line_size_log2,
                self.config.num_sets_log2,
            ),
            config::SetIndexFunction::FERMI_HASH => self.fermi.compute_set_index(
                addr,
                self.config.num_sets,
                self.config.line_size_log2,
                self.config.num_sets_log2,
            ),
            config::SetIndexFunction::CUSTOM => {
                panic!("custom set index function is not implemented")
            }
        }
    }
}
