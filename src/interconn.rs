use crate::mem_fetch;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Port into the downstream memory level (interconnect, L2, DRAM).
///
/// The cache never blocks on the port: `cycle()` checks [`full`] before
/// popping a miss queue and retries on a later tick otherwise.
///
/// [`full`]: MemFetchInterface::full
pub trait MemFetchInterface: Send + Sync + std::fmt::Debug + 'static {
    fn full(&self, size: u32, write: bool) -> bool;

    fn push(&self, fetch: mem_fetch::MemFetch, time: u64);
}

/// A bounded FIFO port.
///
/// Stands in for the interconnect in tests and small host setups.
#[derive(Debug, Default)]
pub struct BufferedPort {
    queue: Mutex<VecDeque<mem_fetch::MemFetch>>,
    capacity: Option<usize>,
}

impl BufferedPort {
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn pop(&self) -> Option<mem_fetch::MemFetch> {
        self.queue.lock().unwrap().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

impl MemFetchInterface for BufferedPort {
    fn full(&self, _size: u32, _write: bool) -> bool {
        match self.capacity {
            Some(capacity) => self.queue.lock().unwrap().len() >= capacity,
            None => false,
        }
    }

    fn push(&self, fetch: mem_fetch::MemFetch, time: u64) {
        log::trace!("buffered_port::push({fetch}, time={time})");
        self.queue.lock().unwrap().push_back(fetch);
    }
}
