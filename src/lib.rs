//! Cycle-level model of a GPU memory-hierarchy cache.
//!
//! The crate models the core of a first/second level GPU data cache the way a
//! cycle-accurate performance simulator needs it: a set-associative tag array
//! with per-line state machines, a non-blocking miss-status holding register
//! (MSHR) table that merges outstanding misses, the read/write hit/miss
//! policy dispatcher, bounded miss queues with data/fill port bandwidth
//! accounting, and an inter-warp stride prefetcher that shares tag and MSHR
//! resources with demand traffic.
//!
//! The host simulator owns the clock: it calls [`cache::Cache::access`] for
//! demand requests, [`cache::Cache::fill`] when the downstream memory returns
//! data, and [`cache::Component::cycle`] once per tick to drain the miss
//! queues into its interconnect port. `RESERVATION_FAIL` is the universal
//! backpressure signal; the host retries on a later tick.

#![allow(non_camel_case_types)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod interconn;
pub mod locality;
pub mod mem_fetch;
pub mod mshr;
pub mod prefetch;
pub mod set_index;
pub mod stats;
pub mod tag_array;

pub use cache::{Cache, Component, RequestStatus};

/// A memory address in the modeled address space.
pub type address = u64;
