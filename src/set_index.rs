use super::address;

pub trait SetIndexer: std::fmt::Debug + Send + Sync + 'static {
    /// Compute the set index for an address.
    #[must_use]
    fn compute_set_index(
        &self,
        addr: address,
        num_sets: usize,
        line_size_log2: u32,
        num_sets_log2: u32,
    ) -> u64;
}

pub mod linear {
    /// Linear (modulo) set indexing.
    ///
    /// Requires a power-of-two number of sets.
    #[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SetIndex {}

    impl super::SetIndexer for SetIndex {
        fn compute_set_index(
            &self,
            addr: super::address,
            num_sets: usize,
            line_size_log2: u32,
            _num_sets_log2: u32,
        ) -> u64 {
            debug_assert!(num_sets.is_power_of_two());
            let set_idx = (addr >> line_size_log2) & (num_sets as u64 - 1);
            debug_assert!(set_idx < num_sets as u64);
            set_idx
        }
    }
}

pub mod fermi {
    // Set indexing function from
    // "A Detailed GPU Cache Model Based on Reuse Distance Theory"
    // Cedric Nugteren et al. HPCA 2014
    #[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SetIndex {}

    impl super::SetIndexer for SetIndex {
        fn compute_set_index(
            &self,
            addr: super::address,
            num_sets: usize,
            line_size_log2: u32,
            _num_sets_log2: u32,
        ) -> u64 {
            assert!(
                matches!(num_sets, 32 | 64),
                "bad cache config: num sets should be 32 or 64 for the fermi set index function (got {num_sets})",
            );

            // lower xor value is bits 7-11
            let lower_xor = (addr >> line_size_log2) & 0x1F;

            // upper xor value is bits 13, 14, 15, 17, and 19
            let mut upper_xor = (addr & 0xE000) >> 13; // bits 13, 14, 15
            upper_xor |= (addr & 0x2_0000) >> 14; // bit 17
            upper_xor |= (addr & 0x8_0000) >> 15; // bit 19

            let mut set_idx = lower_xor ^ upper_xor;

            // 48KB cache prepends the set index with bit 12
            if num_sets == 64 {
                set_idx |= (addr & 0x1000) >> 7;
            }
            assert!(set_idx < num_sets as u64, "set index out of bounds");
            set_idx
        }
    }
}
