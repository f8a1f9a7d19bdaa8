//! Duplicate-extent set (§3, §4.7): per-AG interval set of block ranges
//! claimed by more than one owner, used only for data-device extents.
//! Populated during phase 4 pass 1 ("collect duplicates") and consulted
//! during pass 2.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Guarded by a single mutex (§5); additions are short critical
/// sections, so a plain `Mutex<BTreeMap>` rather than a lock-free
/// structure is the right idiom here.
pub struct DupExtentSet {
    inner: Mutex<BTreeMap<u32, BTreeMap<u32, u32>>>,
}

impl DupExtentSet {
    pub fn new() -> Self {
        DupExtentSet { inner: Mutex::new(BTreeMap::new()) }
    }

    /// Record that `[start, start+len)` in AG `agno` was claimed by a
    /// second owner. Overlapping/adjacent ranges are merged.
    pub fn add_range(&self, agno: u32, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let end = start + len;
        let mut guard = self.inner.lock().unwrap();
        let ag_map = guard.entry(agno).or_default();

        // Collect overlapping/adjacent ranges to merge with.
        let mut merged_start = start;
        let mut merged_end = end;
        let overlapping: Vec<u32> = ag_map
            .range(..)
            .filter(|(&s, &e)| s <= merged_end && e >= merged_start)
            .map(|(&s, _)| s)
            .collect();
        for s in &overlapping {
            let e = ag_map.remove(s).unwrap();
            merged_start = merged_start.min(*s);
            merged_end = merged_end.max(e);
        }
        ag_map.insert(merged_start, merged_end);
    }

    /// Whether any portion of `[start, start+len)` in AG `agno` was
    /// ever recorded as duplicate.
    pub fn overlaps(&self, agno: u32, start: u32, len: u32) -> bool {
        let end = start + len;
        let guard = self.inner.lock().unwrap();
        let Some(ag_map) = guard.get(&agno) else { return false };
        ag_map.range(..).any(|(&s, &e)| s < end && e > start)
    }

    pub fn ranges_for_ag(&self, agno: u32) -> Vec<(u32, u32)> {
        let guard = self.inner.lock().unwrap();
        guard.get(&agno).map(|m| m.iter().map(|(&s, &e)| (s, e)).collect()).unwrap_or_default()
    }
}

impl Default for DupExtentSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_overlapping_ranges() {
        let set = DupExtentSet::new();
        set.add_range(0, 100, 10);
        set.add_range(0, 105, 10);
        let ranges = set.ranges_for_ag(0);
        assert_eq!(ranges, vec![(100, 115)]);
    }

    #[test]
    fn distinct_ags_stay_independent() {
        let set = DupExtentSet::new();
        set.add_range(0, 100, 10);
        set.add_range(1, 100, 10);
        assert!(set.overlaps(0, 105, 1));
        assert!(!set.overlaps(2, 105, 1));
    }
}
