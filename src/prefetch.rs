use crate::address;
use itertools::Itertools;
use std::collections::HashMap;

/// Tracked load PCs; once full, no new PCs are accepted.
pub const STRIDE_BUFFER_SIZE: usize = 32;

/// A candidate warp must lag the lead warp by more than this many loads.
pub const PREF_LAG_MIN: u64 = 20;

/// ... and by at most this many loads.
pub const PREF_LAG_MAX: u64 = 25;

/// Predicted addresses are remembered for load ordinals below this bound.
pub const PREDICTED_ADDR_ORDINAL_LIMIT: u64 = 500;

/// Strides considered by the confidence rule.
pub const STRIDE_HISTORY_WINDOW: usize = 8;

/// A stride is committed when it occurs at least this often in the window.
pub const STRIDE_CONFIDENCE_THRESHOLD: usize = 4;

/// A stale candidate may still be issued while `put_time` is below this.
pub const CANDIDATE_RETRY_WINDOW: u64 = 10;

/// Committed strides are re-selected with this period...
pub const STRIDE_SELECT_PERIOD: u64 = 200;

/// ...at this tick offset (the very first qualifying tick is skipped).
pub const STRIDE_SELECT_PHASE: u64 = 10;

/// Prefetching the adjacent load of the same warp is useless; look this far
/// ahead instead.
const INTRA_WARP_OFFSET: usize = 10;

/// How the core candidate routine picks the lead warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeadWarp {
    /// The warp with the highest load count in the target CTA (with a
    /// fallback when every other member lags it by 25 loads or more).
    AutoPick,
    /// The warp that issued the current demand access.
    Current,
}

/// Per-warp tracking state within one stride entry.
#[derive(Debug, Clone, Default)]
pub struct WarpEntry {
    active: bool,
    /// Dynamic load count of this warp at the tracked PC.
    load_count: u64,
    inter_warp_last_addr: Option<address>,
    intra_warp_last_addr: Option<address>,
    intra_strides: Vec<i64>,
    intra_stride: i64,
    valid_intra_stride: bool,
    /// Every address this warp was observed at, in order.
    addr_trace: Vec<address>,
    /// Previously predicted address per load ordinal, for accuracy counting.
    predicted: HashMap<u64, address>,
}

/// Per-CTA tracking state within one stride entry.
#[derive(Debug, Clone, Default)]
pub struct CtaEntry {
    active: bool,
    /// Warps of this CTA seen at the tracked PC, sorted by id.
    warp_set: Vec<usize>,
    /// Rotating start position for the candidate warp scan.
    warp_offset: usize,
}

/// Tracking state for one load PC.
#[derive(Debug, Clone)]
pub struct StrideEntry {
    pub pc: address,
    cta_entries: HashMap<usize, CtaEntry>,
    warp_entries: HashMap<usize, WarpEntry>,
    inter_warp_strides: Vec<i64>,
    last_stride: i64,
    valid_stride: bool,
    pub prefetch_hit: u64,
    pub prefetch_miss: u64,
    active_cta_num: usize,
    active_warp_num: usize,
    cta_offset: usize,
}

impl StrideEntry {
    fn new(pc: address) -> Self {
        Self {
            pc,
            cta_entries: HashMap::new(),
            warp_entries: HashMap::new(),
            inter_warp_strides: Vec::new(),
            last_stride: 0,
            valid_stride: false,
            prefetch_hit: 0,
            prefetch_miss: 0,
            active_cta_num: 0,
            active_warp_num: 0,
            cta_offset: 0,
        }
    }

    #[must_use]
    pub fn committed_stride(&self) -> Option<i64> {
        self.valid_stride.then_some(self.last_stride)
    }

    /// The lead warp of a CTA: highest load count, falling back to the
    /// second-highest when every other member lags the leader by
    /// [`PREF_LAG_MAX`] loads or more.
    fn find_lead_warp(&self, cta_id: usize) -> Option<usize> {
        let warp_set = &self.cta_entries.get(&cta_id)?.warp_set;
        let load_count =
            |warp: usize| self.warp_entries.get(&warp).map_or(0, |w| w.load_count);

        let lead = *warp_set.iter().max_by_key(|&&warp| load_count(warp))?;
        let follower_in_range = warp_set
            .iter()
            .filter(|&&warp| warp != lead)
            .any(|&warp| load_count(lead) - load_count(warp) < PREF_LAG_MAX);
        if follower_in_range {
            return Some(lead);
        }
        // the pack has fallen far behind; lead from its front instead
        warp_set
            .iter()
            .filter(|&&warp| warp != lead)
            .max_by_key(|&&warp| load_count(warp))
            .copied()
    }
}

/// One synthesized prefetch, plus its staleness counter.
///
/// Address and warp id persist across generation attempts so a recent valid
/// prediction can still be retried while `put_time` stays below
/// [`CANDIDATE_RETRY_WINDOW`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Candidate {
    pub valid: bool,
    pub addr: address,
    pub warp_id: usize,
    pub put_time: u64,
}

impl Candidate {
    /// Eligible to be issued: freshly valid, or recently enough so.
    #[must_use]
    pub fn fresh(&self) -> bool {
        self.valid || self.put_time < CANDIDATE_RETRY_WINDOW
    }
}

/// Inter-warp stride prefetcher.
///
/// Rides alongside demand accesses: the tag array feeds it on every locality
/// probe, and the data cache asks it for a candidate address after every
/// qualifying L1 demand read.
#[derive(Debug, Default)]
pub struct Prefetcher {
    entries: Vec<StrideEntry>,
    last_pc_index: Option<usize>,
    candidate: Candidate,
}

impl Prefetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn probe_entry(&self, pc: address) -> Option<usize> {
        self.entries.iter().position(|entry| entry.pc == pc)
    }

    #[must_use]
    pub fn full(&self) -> bool {
        self.entries.len() >= STRIDE_BUFFER_SIZE
    }

    pub fn fill_entry(&mut self, pc: address) {
        assert!(!self.full());
        self.entries.push(StrideEntry::new(pc));
    }

    #[must_use]
    pub fn entry(&self, index: usize) -> &StrideEntry {
        &self.entries[index]
    }

    #[must_use]
    pub fn candidate(&self) -> Candidate {
        self.candidate
    }

    #[cfg(test)]
    pub(crate) fn force_candidate(&mut self, candidate: Candidate) {
        self.candidate = candidate;
    }

    /// Record a demand access of `warp_id` (in `cta_id`) at `addr` and
    /// accumulate inter-warp strides against co-members at the same dynamic
    /// load.
    pub fn calculate_inter_warp_stride(
        &mut self,
        cta_id: usize,
        warp_id: usize,
        addr: address,
        pc_index: usize,
    ) {
        let entry = &mut self.entries[pc_index];

        let newly_active = {
            let cta = entry.cta_entries.entry(cta_id).or_default();
            let newly_active = !cta.active;
            cta.active = true;
            newly_active
        };
        if newly_active {
            entry.active_cta_num += 1;
        }

        let load_count = {
            let warp = entry.warp_entries.entry(warp_id).or_default();
            warp.load_count += 1;
            // compare against the prediction made for this load ordinal
            if warp.load_count < PREDICTED_ADDR_ORDINAL_LIMIT {
                if let Some(&predicted) = warp.predicted.get(&warp.load_count) {
                    if predicted == addr {
                        entry.prefetch_hit += 1;
                    } else {
                        entry.prefetch_miss += 1;
                    }
                }
            }
            warp.load_count
        };

        {
            let cta = entry.cta_entries.get_mut(&cta_id).unwrap();
            if !cta.warp_set.contains(&warp_id) {
                cta.warp_set.push(warp_id);
                cta.warp_set.sort_unstable();
            }
        }

        entry
            .warp_entries
            .get_mut(&warp_id)
            .unwrap()
            .inter_warp_last_addr = Some(addr);
        self.last_pc_index = Some(pc_index);

        // first co-member warp at the same dynamic load yields a stride
        let entry = &mut self.entries[pc_index];
        let members = entry.cta_entries[&cta_id].warp_set.clone();
        for other in members {
            if other == warp_id {
                continue;
            }
            let Some(other_warp) = entry.warp_entries.get(&other) else {
                continue;
            };
            if other_warp.load_count != load_count {
                continue;
            }
            if let Some(other_addr) = other_warp.inter_warp_last_addr {
                let addr_stride = other_addr as i64 - addr as i64;
                let warp_stride = other as i64 - warp_id as i64;
                let stride = addr_stride / warp_stride;
                if stride != 0 {
                    entry.inter_warp_strides.push(stride);
                }
            }
            break;
        }
    }

    /// Record a demand access of `warp_id` at `addr`, accumulating the
    /// stride against the warp's own previous access.
    pub fn calculate_intra_warp_stride(&mut self, warp_id: usize, addr: address, pc_index: usize) {
        let entry = &mut self.entries[pc_index];
        let newly_active = {
            let warp = entry.warp_entries.entry(warp_id).or_default();
            let newly_active = !warp.active;
            warp.active = true;
            if let Some(last) = warp.intra_warp_last_addr {
                let stride = addr as i64 - last as i64;
                if stride != 0 {
                    warp.intra_strides.push(stride);
                }
            }
            warp.intra_warp_last_addr = Some(addr);
            newly_active
        };
        if newly_active {
            entry.active_warp_num += 1;
        }
        self.last_pc_index = Some(pc_index);
    }

    /// Append `addr` to the warp's address trace.
    pub fn trace_warp_addr(&mut self, warp_id: usize, addr: address, pc_index: usize) {
        self.entries[pc_index]
            .warp_entries
            .entry(warp_id)
            .or_default()
            .addr_trace
            .push(addr);
    }

    /// Re-select the committed stride of every populated entry.
    ///
    /// The committed stride is the mode of the last
    /// [`STRIDE_HISTORY_WINDOW`] observed strides; it is valid iff the mode
    /// occurs at least [`STRIDE_CONFIDENCE_THRESHOLD`] times. An empty or
    /// inconsistent history leaves the entry without a committed stride.
    pub fn select_strides(&mut self) {
        for index in 0..self.entries.len() {
            self.select_inter_stride(index);
            self.select_intra_stride(index);
        }
    }

    pub fn select_inter_stride(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        match mode_of_recent(&entry.inter_warp_strides) {
            Some((stride, count)) if count >= STRIDE_CONFIDENCE_THRESHOLD && stride != 0 => {
                entry.last_stride = stride;
                entry.valid_stride = true;
            }
            _ => entry.valid_stride = false,
        }
    }

    pub fn select_intra_stride(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        for warp in entry.warp_entries.values_mut() {
            match mode_of_recent(&warp.intra_strides) {
                Some((stride, count)) if count >= STRIDE_CONFIDENCE_THRESHOLD && stride != 0 => {
                    warp.intra_stride = stride;
                    warp.valid_intra_stride = true;
                }
                _ => warp.valid_intra_stride = false,
            }
        }
    }

    /// Generate an inter-warp candidate after a demand read of `warp_id` in
    /// `cta_id`.
    ///
    /// Tries the CTA two ahead with an auto-picked leader, then the current
    /// CTA led by the current warp, then the next CTA ahead.
    pub fn calculate_inter_pref_addr(&mut self, warp_id: usize, cta_id: usize) {
        self.candidate.valid = false;
        self.candidate.put_time += 1;
        let Some(pc_index) = self.last_pc_index else {
            return;
        };

        let entry = &mut self.entries[pc_index];
        let active_ctas = entry.active_cta_num;
        if active_ctas == 0 {
            return;
        }
        entry.cta_offset = (entry.cta_offset + 1) % active_ctas;
        if entry.cta_offset < 2 {
            entry.cta_offset = 2;
        }

        self.calcu_addr(warp_id, (cta_id + 2) % active_ctas, LeadWarp::AutoPick);
        if !self.candidate.valid {
            self.calcu_addr(warp_id, cta_id, LeadWarp::Current);
        }
        if !self.candidate.valid {
            self.calcu_addr(warp_id, (cta_id + 1) % active_ctas, LeadWarp::AutoPick);
        }
    }

    /// Core candidate routine for one target CTA.
    ///
    /// Scans the CTA's warp set round-robin from its rotating offset for the
    /// first warp whose load count lags the lead warp by an amount in
    /// (`PREF_LAG_MIN`, `PREF_LAG_MAX`], then extrapolates the lead warp's
    /// last address by the committed stride.
    fn calcu_addr(&mut self, warp_id: usize, target_cta: usize, mode: LeadWarp) {
        let pc_index = self
            .last_pc_index
            .expect("candidate generation without a tracked pc");
        let entry = &mut self.entries[pc_index];

        let active = entry
            .cta_entries
            .get(&target_cta)
            .map_or(false, |cta| cta.active);
        if !active {
            if entry.active_cta_num > 0 {
                entry.cta_offset = (entry.cta_offset + 1) % entry.active_cta_num;
            }
            return;
        }
        if entry.last_stride == 0 || !entry.valid_stride {
            return;
        }

        let lead_warp = match mode {
            LeadWarp::Current => warp_id,
            LeadWarp::AutoPick => match entry.find_lead_warp(target_cta) {
                Some(lead) => lead,
                None => return,
            },
        };
        let Some(lead_entry) = entry.warp_entries.get(&lead_warp) else {
            return;
        };
        let lead_count = lead_entry.load_count;
        let Some(lead_addr) = lead_entry.inter_warp_last_addr else {
            return;
        };
        let stride = entry.last_stride;

        let warp_set = {
            let cta = entry.cta_entries.get_mut(&target_cta).unwrap();
            if cta.warp_set.is_empty() {
                return;
            }
            cta.warp_offset = (cta.warp_offset + 1) % cta.warp_set.len();
            cta.warp_set.clone()
        };
        let start = entry.cta_entries[&target_cta].warp_offset;

        for position in 0..warp_set.len() {
            let candidate_warp = warp_set[(start + position) % warp_set.len()];
            if candidate_warp == lead_warp {
                continue;
            }
            let candidate_count = entry
                .warp_entries
                .get(&candidate_warp)
                .map_or(0, |w| w.load_count);
            let lag = lead_count.saturating_sub(candidate_count);
            if lag <= PREF_LAG_MIN || lag > PREF_LAG_MAX {
                continue;
            }

            let delta = stride * (candidate_warp as i64 - lead_warp as i64);
            let addr = lead_addr.wrapping_add_signed(delta);
            if self.candidate.addr == addr {
                // repeating the previous prediction is pointless
                continue;
            }
            if lead_count > 0 && lead_count < PREDICTED_ADDR_ORDINAL_LIMIT {
                entry
                    .warp_entries
                    .entry(candidate_warp)
                    .or_default()
                    .predicted
                    .insert(lead_count, addr);
            }
            self.candidate = Candidate {
                valid: true,
                addr,
                warp_id: candidate_warp,
                put_time: 0,
            };
            return;
        }
    }

    /// Generate an intra-warp candidate: a warp offset-shifted from the
    /// current one extrapolated by its own committed stride.
    pub fn calculate_intra_pref_addr(&mut self, warp_id: usize) {
        self.candidate.valid = false;
        self.candidate.put_time += 1;
        let Some(pc_index) = self.last_pc_index else {
            return;
        };
        let entry = &self.entries[pc_index];
        if entry.active_warp_num == 0 {
            return;
        }
        let target_warp = (warp_id + INTRA_WARP_OFFSET) % entry.active_warp_num;
        let Some(warp) = entry.warp_entries.get(&target_warp) else {
            return;
        };
        if warp.intra_stride == 0 || !warp.valid_intra_stride {
            return;
        }
        let Some(last) = warp.intra_warp_last_addr else {
            return;
        };
        self.candidate = Candidate {
            valid: true,
            addr: last.wrapping_add_signed(warp.intra_stride),
            warp_id: target_warp,
            put_time: 0,
        };
    }
}

/// The mode of the last [`STRIDE_HISTORY_WINDOW`] values, with ties broken
/// towards the larger stride.
fn mode_of_recent(strides: &[i64]) -> Option<(i64, usize)> {
    strides
        .iter()
        .rev()
        .take(STRIDE_HISTORY_WINDOW)
        .copied()
        .counts()
        .into_iter()
        .max_by_key(|&(stride, count)| (count, stride))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replay `loads` dynamic loads of `num_warps` warps in one CTA with a
    /// constant inter-warp stride.
    fn train(pref: &mut Prefetcher, pc: address, num_warps: usize, loads: u64, stride: u64) {
        if pref.probe_entry(pc).is_none() {
            pref.fill_entry(pc);
        }
        let index = pref.probe_entry(pc).unwrap();
        for load in 0..loads {
            for warp in 0..num_warps {
                let addr = 0x8000_0000 + warp as u64 * stride + load * 0x10000;
                pref.calculate_inter_warp_stride(0, warp, addr, index);
                pref.trace_warp_addr(warp, addr, index);
            }
        }
        pref.select_strides();
    }

    #[test]
    fn table_is_bounded() {
        let mut pref = Prefetcher::new();
        for pc in 0..STRIDE_BUFFER_SIZE as u64 {
            assert!(!pref.full());
            pref.fill_entry(pc * 4);
        }
        assert!(pref.full());
        assert_eq!(pref.probe_entry(4), Some(1));
        assert_eq!(pref.probe_entry(0x999), None);
    }

    #[test]
    fn consistent_strides_are_committed() {
        let mut pref = Prefetcher::new();
        train(&mut pref, 0x40, 4, 8, 128);
        let entry = pref.entry(0);
        assert_eq!(entry.committed_stride(), Some(128));
    }

    #[test]
    fn inconsistent_strides_are_rejected() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        // no stride reaches the confidence threshold
        for stride in [128i64, 256, 512, 128, 256, 512, 128, 256] {
            pref.entries[0].inter_warp_strides.push(stride);
        }
        pref.select_inter_stride(0);
        assert_eq!(pref.entry(0).committed_stride(), None);
    }

    #[test]
    fn empty_history_never_commits() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        pref.select_inter_stride(0);
        assert_eq!(pref.entry(0).committed_stride(), None);
    }

    #[test]
    fn generates_candidate_for_lagging_warp() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        let index = 0;
        // warp 0 leads with 30 loads, warp 1 lags by 22 (within (20, 25])
        for load in 0..30u64 {
            pref.calculate_inter_warp_stride(0, 0, 0x8000_0000 + load * 0x1000, index);
        }
        for load in 0..8u64 {
            pref.calculate_inter_warp_stride(0, 1, 0x8000_0080 + load * 0x1000, index);
        }
        // the warps never ran at equal load counts, so commit the stride
        // history directly
        for _ in 0..8 {
            pref.entries[0].inter_warp_strides.push(128);
        }
        pref.select_inter_stride(0);
        assert_eq!(pref.entry(0).committed_stride(), Some(128));

        pref.calculate_inter_pref_addr(0, 0);
        let candidate = pref.candidate();
        assert!(candidate.valid);
        assert_eq!(candidate.warp_id, 1);
        // lead warp's last address extrapolated by one stride
        let lead_last = 0x8000_0000 + 29 * 0x1000;
        assert_eq!(candidate.addr, lead_last + 128);
        assert_eq!(candidate.put_time, 0);
    }

    #[test]
    fn candidate_goes_stale_after_retry_window() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        pref.calculate_inter_warp_stride(0, 0, 0x8000_0000, 0);
        for _ in 0..CANDIDATE_RETRY_WINDOW {
            pref.calculate_inter_pref_addr(0, 0);
            // no committed stride, so never valid
            assert!(!pref.candidate().valid);
        }
        assert!(!pref.candidate().fresh());
    }

    #[test]
    fn identical_prediction_is_not_repeated() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        for load in 0..30u64 {
            pref.calculate_inter_warp_stride(0, 0, 0x8000_0000 + load * 0x1000, 0);
        }
        for load in 0..8u64 {
            pref.calculate_inter_warp_stride(0, 1, 0x8000_0080 + load * 0x1000, 0);
        }
        for _ in 0..8 {
            pref.entries[0].inter_warp_strides.push(128);
        }
        pref.select_inter_stride(0);

        pref.calculate_inter_pref_addr(0, 0);
        let first = pref.candidate();
        assert!(first.valid);

        // nothing changed; the same address must not be re-issued
        pref.calculate_inter_pref_addr(0, 0);
        let second = pref.candidate();
        assert!(!second.valid);
        assert_eq!(second.addr, first.addr);
        // but it is still fresh enough to retry
        assert!(second.fresh());
    }

    #[test]
    fn prediction_accuracy_is_tracked() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        // pretend load ordinal 3 of warp 1 was predicted at 0x8000_0300
        for _ in 0..2 {
            pref.calculate_inter_warp_stride(0, 1, 0x8000_0000, 0);
        }
        pref.entries[0]
            .warp_entries
            .get_mut(&1)
            .unwrap()
            .predicted
            .insert(3, 0x8000_0300);
        pref.calculate_inter_warp_stride(0, 1, 0x8000_0300, 0);
        assert_eq!(pref.entry(0).prefetch_hit, 1);
        assert_eq!(pref.entry(0).prefetch_miss, 0);

        pref.entries[0]
            .warp_entries
            .get_mut(&1)
            .unwrap()
            .predicted
            .insert(4, 0x8000_0400);
        pref.calculate_inter_warp_stride(0, 1, 0x8000_0999, 0);
        assert_eq!(pref.entry(0).prefetch_miss, 1);
    }

    #[test]
    fn intra_warp_candidate_extends_own_stream() {
        let mut pref = Prefetcher::new();
        pref.fill_entry(0x40);
        // warp 0 streams with stride 256
        for load in 0..9u64 {
            pref.calculate_intra_warp_stride(0, 0x8000_0000 + load * 256, 0);
        }
        pref.select_intra_stride(0);

        // warp 0 is the only active warp, so the +10 offset wraps to it
        pref.calculate_intra_pref_addr(0);
        let candidate = pref.candidate();
        assert!(candidate.valid);
        assert_eq!(candidate.warp_id, 0);
        assert_eq!(candidate.addr, 0x8000_0000 + 8 * 256 + 256);
    }
}
