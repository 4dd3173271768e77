pub mod bandwidth;
pub mod base;
pub mod block;
pub mod config;
pub mod controller;
pub mod data;
pub mod event;
pub mod readonly;

pub use config::Config;
pub use controller::CacheController;
pub use data::Data;
pub use event::Event;
pub use readonly::ReadOnly;

use crate::{address, mem_fetch};
use std::collections::VecDeque;

/// Outcome of a cache access.
///
/// The ordinals are stable and shared with the host simulator.
#[derive(Debug, strum::EnumIter, strum::EnumCount, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RequestStatus {
    HIT = 0,
    HIT_RESERVED,
    MISS,
    RESERVATION_FAIL,
}

/// Which level of the hierarchy a cache instance models.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Level {
    L1,
    L2,
}

/// Selects how an access outcome is counted.
///
/// `HIT_RESERVED` is treated as a miss by the cores, but the cache counts it
/// as `HIT_RESERVED`.
#[must_use]
pub fn select_status(probe: RequestStatus, access: RequestStatus) -> RequestStatus {
    match probe {
        RequestStatus::HIT_RESERVED if access != RequestStatus::RESERVATION_FAIL => probe,
        _ => access,
    }
}

/// Advanced once per tick by the host clock.
pub trait Component {
    fn cycle(&mut self, cycle: u64);
}

pub trait Cache: Component + Bandwidth {
    /// Access the cache.
    ///
    /// Never blocks: returns `RESERVATION_FAIL` as backpressure when the
    /// request cannot be handled this cycle. `pref_fetch` is an optional
    /// prefetch carrier; the cache takes ownership and either forwards it to
    /// the prefetch miss queue or releases it.
    fn access(
        &mut self,
        addr: address,
        fetch: mem_fetch::MemFetch,
        pref_fetch: Option<mem_fetch::MemFetch>,
        events: &mut Vec<Event>,
        time: u64,
    ) -> RequestStatus;

    /// Accept a fill response from the lower memory level.
    ///
    /// Bandwidth restrictions are modeled in the caller.
    fn fill(&mut self, fetch: mem_fetch::MemFetch, time: u64);

    /// The fetch was accepted earlier and is waiting on the lower level.
    fn waiting_for_fill(&self, fetch: &mem_fetch::MemFetch) -> bool;

    /// Accepted accesses that had to wait for memory are now ready.
    ///
    /// Does not include accesses that hit.
    fn has_ready_accesses(&self) -> bool;

    fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>>;

    /// Pop the next ready access, in fill order across blocks and request
    /// order within a block.
    fn next_access(&mut self) -> Option<mem_fetch::MemFetch>;

    /// Invalidate every line.
    fn flush(&mut self);

    fn stats(&self) -> &crate::stats::Cache;
}

pub trait Bandwidth {
    fn has_free_data_port(&self) -> bool;

    fn has_free_fill_port(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::{select_status, RequestStatus};

    #[test]
    fn pending_hits_are_counted_as_pending_hits() {
        assert_eq!(
            select_status(RequestStatus::HIT_RESERVED, RequestStatus::MISS),
            RequestStatus::HIT_RESERVED
        );
        assert_eq!(
            select_status(RequestStatus::HIT_RESERVED, RequestStatus::RESERVATION_FAIL),
            RequestStatus::RESERVATION_FAIL
        );
        assert_eq!(
            select_status(RequestStatus::MISS, RequestStatus::MISS),
            RequestStatus::MISS
        );
        assert_eq!(
            select_status(RequestStatus::HIT, RequestStatus::HIT),
            RequestStatus::HIT
        );
    }
}
