//! Incore block-state map (§4.1): per-group structure mapping block
//! offset to state, represented as a run-length interval tree keyed by
//! starting offset. The node at key `k` means "starting at `k`, blocks
//! are in state `S` until the next key".
//!
//! The design notes call for an explicit tagged enum in the tree's
//! value type rather than the historical per-state sentinel-pointer
//! trick; [`BlockState`] is that enum, and the interval tree is a plain
//! `BTreeMap<u64, BlockState>`.

use std::collections::BTreeMap;

use crate::error::RepairError;

/// One of the block states enumerated in §3. Sixteen sentinel slots
/// were reserved historically; only these are ever assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// Seen by only one of the two free-space trees.
    Free1,
    Unknown,
    Inuse,
    /// Seen by only the reverse-map.
    Inuse1,
    /// Claimed more than once.
    Multi,
    Metadata,
    FsMap,
    Ino,
    InuseFs,
    /// Refcount btree block.
    Refc,
    /// Copy-on-write staging block.
    Cow,
    BadState,
}

impl BlockState {
    pub fn is_free_like(self) -> bool {
        matches!(self, BlockState::Free | BlockState::Free1)
    }

    pub fn is_inuse_like(self) -> bool {
        matches!(self, BlockState::Inuse | BlockState::Inuse1)
    }

    /// States that represent the filesystem's own reserved metadata —
    /// a fork claiming one of these is structural corruption (§4.7).
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            BlockState::Ino
                | BlockState::FsMap
                | BlockState::InuseFs
                | BlockState::Refc
                | BlockState::Cow
        )
    }
}

/// The run-length interval tree for one group (AG or RTG).
pub struct BlockStateMap {
    group: u32,
    size: u32,
    runs: BTreeMap<u64, BlockState>,
}

impl BlockStateMap {
    /// Seed a data-device AG: `[0, hdr)` = INUSE_FS (static headers),
    /// `[hdr, agsize)` = UNKNOWN (to be classified during phase 3/4),
    /// `[agsize, ...)` = BAD_STATE (out of range for this AG).
    pub fn new_ag(group: u32, agsize: u32, hdr_blocks: u32) -> Self {
        let mut runs = BTreeMap::new();
        runs.insert(0u64, BlockState::InuseFs);
        runs.insert(hdr_blocks as u64, BlockState::Unknown);
        runs.insert(agsize as u64, BlockState::BadState);
        BlockStateMap { group, size: agsize, runs }
    }

    /// Seed a realtime group: block 0 is INUSE_FS if a realtime
    /// superblock exists there, otherwise the whole group starts FREE.
    pub fn new_rtg(group: u32, rtg_size: u32, has_rt_superblock: bool) -> Self {
        let mut runs = BTreeMap::new();
        if has_rt_superblock {
            runs.insert(0u64, BlockState::InuseFs);
            runs.insert(1u64, BlockState::Free);
        } else {
            runs.insert(0u64, BlockState::Free);
        }
        runs.insert(rtg_size as u64, BlockState::BadState);
        BlockStateMap { group, size: rtg_size, runs }
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Find the run covering `offset`, returning its state and the
    /// remaining length in that run (clamped to `max_len`).
    ///
    /// A `BAD_STATE` result is fatal per §4.1 and the caller must abort
    /// the current phase with a diagnostic naming the offending block.
    pub fn get(&self, offset: u64, max_len: u64) -> Result<(BlockState, u64), RepairError> {
        let (&start, &state) = self
            .runs
            .range(..=offset)
            .next_back()
            .ok_or(RepairError::Structural("block-state map has no covering run"))?;

        if state == BlockState::BadState {
            return Err(RepairError::BadBlockState { ag: self.group, block: offset as u32 });
        }

        let run_end = self
            .runs
            .range((offset + 1)..)
            .next()
            .map(|(&k, _)| k)
            .unwrap_or(u64::MAX);
        let remaining = run_end - offset;
        let _ = start;
        Ok((state, remaining.min(max_len)))
    }

    /// Update `[offset, offset+length)` to `newstate`, merging with
    /// neighboring runs of the same state and splitting any run the
    /// update straddles (the nine structural cases of §4.1).
    pub fn set(&mut self, offset: u64, length: u64, newstate: BlockState) {
        if length == 0 {
            return;
        }
        let end = offset + length;

        // State that must continue immediately after `end`, taken from
        // whatever run covered `end` before we started mutating.
        let tail_state = self
            .runs
            .range(..=end)
            .next_back()
            .map(|(_, &s)| s)
            .unwrap_or(BlockState::Unknown);
        let had_boundary_at_end = self.runs.contains_key(&end);

        // Drop every breakpoint strictly inside [offset, end) plus one
        // at `offset` itself if present (fully absorbed by the new run).
        let to_remove: Vec<u64> = self.runs.range(offset..end).map(|(&k, _)| k).collect();
        for k in to_remove {
            self.runs.remove(&k);
        }

        // Re-establish the boundary at `end` unless the new state would
        // already continue there (the tail run and the new state match,
        // i.e. forward merge).
        if end < self.size as u64 || had_boundary_at_end {
            if tail_state != newstate {
                self.runs.insert(end, tail_state);
            }
        }

        // Insert (or extend into) the run at `offset`. Backward merge:
        // if the preceding run already has `newstate`, no new
        // breakpoint is needed at `offset` at all.
        let prev_state = self.runs.range(..offset).next_back().map(|(_, &s)| s);
        if prev_state != Some(newstate) {
            self.runs.insert(offset, newstate);
        }
    }

    /// Count of blocks (approximate, by summing whole runs) currently
    /// in `state` — used by phase 5 when deciding free-space btree fill
    /// targets from space-pressure analysis.
    pub fn count_state(&self, state: BlockState) -> u64 {
        let mut total = 0u64;
        let mut iter = self.runs.iter().peekable();
        while let Some((&start, &s)) = iter.next() {
            let end = iter.peek().map(|(&k, _)| k).unwrap_or(self.size as u64);
            if s == state {
                total += end.saturating_sub(start);
            }
        }
        total
    }

    /// Iterate every run as `(start, end, state)`, in offset order —
    /// phase 5 walks FREE/FREE1 runs to rebuild the free-space btrees.
    pub fn iter_runs(&self) -> impl Iterator<Item = (u64, u64, BlockState)> + '_ {
        let mut entries: Vec<(u64, BlockState)> = self.runs.iter().map(|(&k, &v)| (k, v)).collect();
        entries.sort_by_key(|&(k, _)| k);
        let size = self.size as u64;
        (0..entries.len()).map(move |i| {
            let (start, state) = entries[i];
            let end = entries.get(i + 1).map(|&(k, _)| k).unwrap_or(size);
            (start, end, state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_ag_with_three_runs() {
        let map = BlockStateMap::new_ag(0, 1000, 4);
        assert_eq!(map.get(0, 100).unwrap(), (BlockState::InuseFs, 4));
        assert_eq!(map.get(4, 100).unwrap().0, BlockState::Unknown);
        assert!(map.get(1000, 10).is_err());
    }

    #[test]
    fn set_merges_forward_and_backward() {
        let mut map = BlockStateMap::new_ag(0, 1000, 4);
        map.set(4, 96, BlockState::Inuse);
        assert_eq!(map.get(4, 1000).unwrap(), (BlockState::Inuse, 96));
        map.set(100, 50, BlockState::Inuse);
        // The two adjacent INUSE runs should have merged into one run.
        assert_eq!(map.get(4, 1000).unwrap(), (BlockState::Inuse, 146));
    }

    #[test]
    fn set_splits_straddled_run() {
        let mut map = BlockStateMap::new_ag(0, 1000, 4);
        map.set(4, 900, BlockState::Unknown);
        map.set(100, 50, BlockState::Multi);
        assert_eq!(map.get(4, 1000).unwrap(), (BlockState::Unknown, 96));
        assert_eq!(map.get(100, 1000).unwrap(), (BlockState::Multi, 50));
        assert_eq!(map.get(150, 1000).unwrap().0, BlockState::Unknown);
    }

    #[test]
    fn rtg_without_superblock_starts_all_free() {
        let map = BlockStateMap::new_rtg(0, 500, false);
        assert_eq!(map.get(0, 500).unwrap(), (BlockState::Free, 500));
    }

    #[test]
    fn free_like_and_inuse_like_classification() {
        assert!(BlockState::Free.is_free_like());
        assert!(BlockState::Free1.is_free_like());
        assert!(!BlockState::Inuse.is_free_like());
        assert!(BlockState::Inuse1.is_inuse_like());
    }

    #[test]
    fn iter_runs_covers_whole_group() {
        let mut map = BlockStateMap::new_ag(0, 100, 4);
        map.set(4, 96, BlockState::Unknown);
        let runs: Vec<_> = map.iter_runs().collect();
        assert_eq!(runs.first().unwrap().0, 0);
        assert_eq!(runs.last().unwrap().1, 100);
    }
}
