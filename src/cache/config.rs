use crate::config;
use serde::{Deserialize, Serialize};

/// A cache write policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum WritePolicy {
    READ_ONLY,          // R
    WRITE_BACK,         // B
    WRITE_THROUGH,      // T
    WRITE_EVICT,        // E
    LOCAL_WB_GLOBAL_WE, // L
}

impl WritePolicy {
    #[must_use]
    pub fn is_write_through(&self) -> bool {
        *self == WritePolicy::WRITE_THROUGH
    }
}

/// A cache write-allocate policy.
///
/// `WRITE_ALLOCATE` sends a write and a read for every write miss, the
/// classic GPGPU-Sim 3.x behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum WriteAllocatePolicy {
    NO_WRITE_ALLOCATE, // N
    WRITE_ALLOCATE,    // W
}

/// A cache allocate policy.
///
/// Under `ON_MISS` a line is reserved when the miss is issued; under
/// `ON_FILL` allocation and fill coincide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AllocatePolicy {
    ON_MISS, // M
    ON_FILL, // F
}

/// A cache replacement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplacementPolicy {
    LRU,  // L
    FIFO, // F
}

/// Flattened cache parameters, cheap to clone into the tag array and the
/// bandwidth manager.
#[derive(Clone, Debug)]
pub struct Config {
    pub allocate_policy: AllocatePolicy,
    pub replacement_policy: ReplacementPolicy,
    pub write_allocate_policy: WriteAllocatePolicy,
    pub write_policy: WritePolicy,
    pub line_size: u32,
    pub line_size_log2: u32,
    pub associativity: usize,
    pub num_sets: usize,
    pub num_sets_log2: u32,
    pub total_lines: usize,
    pub miss_queue_size: usize,
    pub data_port_width: usize,
    pub set_index_function: config::SetIndexFunction,
    pub scheduler_policy: config::SchedulerPolicy,
}

impl From<&config::Cache> for Config {
    fn from(config: &config::Cache) -> Self {
        config.validate();
        Self {
            allocate_policy: config.allocate_policy,
            replacement_policy: config.replacement_policy,
            write_allocate_policy: config.write_allocate_policy,
            write_policy: config.write_policy,
            line_size: config.line_size,
            line_size_log2: config.line_size.ilog2(),
            associativity: config.associativity,
            num_sets: config.num_sets,
            num_sets_log2: config.num_sets.ilog2(),
            total_lines: config.num_sets * config.associativity,
            miss_queue_size: config.miss_queue_size,
            data_port_width: config.data_port_width(),
            set_index_function: config.set_index_function,
            scheduler_policy: config.scheduler_policy,
        }
    }
}
