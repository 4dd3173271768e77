use super::{address, mem_fetch};
use std::collections::{HashMap, VecDeque};

/// Requests waiting on one outstanding block miss.
#[derive(Debug, Default)]
pub struct Entry {
    requests: VecDeque<mem_fetch::MemFetch>,
    has_atomic: bool,
}

impl Entry {
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[must_use]
    pub fn has_atomic(&self) -> bool {
        self.has_atomic
    }
}

/// Miss status holding register table.
///
/// Merges coincident misses to the same block. Waiting requests are released
/// in the order they were added per block; ready blocks are exposed in the
/// order their fills arrived.
#[derive(Debug, Default)]
pub struct Table {
    num_entries: usize,
    max_merged: usize,
    entries: HashMap<address, Entry>,
    /// Blocks whose fill has arrived but whose waiters have not all been
    /// released; draining the merged requests may take several cycles.
    current_response: VecDeque<address>,
}

impl Table {
    #[must_use]
    pub fn new(num_entries: usize, max_merged: usize) -> Self {
        Self {
            num_entries,
            max_merged,
            entries: HashMap::with_capacity(num_entries),
            current_response: VecDeque::new(),
        }
    }

    /// There is a pending request to the lower memory level already.
    #[must_use]
    pub fn probe(&self, block_addr: address) -> bool {
        self.entries.contains_key(&block_addr)
    }

    /// There is no more space for tracking a new memory access.
    #[must_use]
    pub fn full(&self, block_addr: address) -> bool {
        match self.entries.get(&block_addr) {
            Some(entry) => entry.requests.len() >= self.max_merged,
            None => self.entries.len() >= self.num_entries,
        }
    }

    #[must_use]
    pub fn get(&self, block_addr: address) -> Option<&Entry> {
        self.entries.get(&block_addr)
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Add or merge this access.
    pub fn add(&mut self, block_addr: address, fetch: mem_fetch::MemFetch) {
        let entry = self.entries.entry(block_addr).or_default();
        entry.has_atomic |= fetch.is_atomic();
        entry.requests.push_back(fetch);
        assert!(entry.requests.len() <= self.max_merged);
        assert!(self.entries.len() <= self.num_entries);
    }

    /// The table is processing an earlier response.
    ///
    /// Always false under the single-threaded tick model; kept as the
    /// assertion point guarding [`mark_ready`](Table::mark_ready).
    #[must_use]
    pub fn busy(&self) -> bool {
        false
    }

    /// Accept a new cache fill response: mark the entry ready for processing.
    ///
    /// # Returns
    /// Whether the ready entry contains an atomic operation.
    pub fn mark_ready(&mut self, block_addr: address) -> bool {
        assert!(!self.busy());
        let Some(entry) = self.entries.get(&block_addr) else {
            panic!("mshr: mark ready for unknown block {block_addr:#x}");
        };
        self.current_response.push_back(block_addr);
        log::trace!(
            "mshr::mark_ready(block_addr={}, has_atomic={})",
            block_addr,
            entry.has_atomic
        );
        debug_assert!(self.current_response.len() <= self.entries.len());
        entry.has_atomic
    }

    /// Ready accesses exist.
    #[must_use]
    pub fn access_ready(&self) -> bool {
        !self.current_response.is_empty()
    }

    /// The waiters of the block at the head of the ready queue.
    #[must_use]
    pub fn ready_accesses(&self) -> Option<&VecDeque<mem_fetch::MemFetch>> {
        let block_addr = self.current_response.front()?;
        let entry = self.entries.get(block_addr)?;
        Some(&entry.requests)
    }

    /// Release the next ready access.
    ///
    /// Pops the head of the front ready entry's waiter list; once the list
    /// drains, the entry is removed and the ready queue advances.
    pub fn next_access(&mut self) -> Option<mem_fetch::MemFetch> {
        let block_addr = *self.current_response.front()?;
        let entry = self.entries.get_mut(&block_addr)?;
        debug_assert!(!entry.requests.is_empty());
        let fetch = entry.requests.pop_front();

        if entry.requests.is_empty() {
            self.entries.remove(&block_addr);
            self.current_response.pop_front();
        }
        fetch
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "MSHR contents")?;
        for (block_addr, entry) in &self.entries {
            writeln!(
                f,
                "MSHR: tag={:#08x}, atomic={} {} entries",
                block_addr,
                entry.has_atomic,
                entry.requests.len()
            )?;
        }
        Ok(())
    }
}
