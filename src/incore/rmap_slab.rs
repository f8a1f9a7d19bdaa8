//! Reverse-map slab (§3, §4.10): per-AG (and per-RTG) collection of
//! observed `(physical, length, owner, fork, logical offset)` records,
//! built during inode processing and compared to the on-disk
//! reverse-map btree in phase 4.

use std::sync::Mutex;

/// A reverse-map record's owner: either a real inode, or one of the
/// well-known structural owners for AG metadata ([`crate::format::rmap::owner`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Inode(u64),
    Static(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct RmapRecord {
    pub agno: u32,
    pub start_block: u32,
    pub length: u32,
    pub owner: OwnerKind,
    pub is_attr_fork: bool,
    pub is_bmbt_block: bool,
    pub is_unwritten: bool,
    pub logical_offset: u64,
}

/// Append-only during phases 3-4, then frozen (§3 lifecycle summary).
/// Guarded by a single mutex per §5; appends are short critical
/// sections, sorting/freezing happens once at the phase-4 boundary.
pub struct RmapSlab {
    records: Mutex<Vec<RmapRecord>>,
    frozen: Mutex<bool>,
}

impl RmapSlab {
    pub fn new() -> Self {
        RmapSlab { records: Mutex::new(Vec::new()), frozen: Mutex::new(false) }
    }

    /// Append a record. A no-op (rather than a panic) once frozen,
    /// since a worker racing the phase-4 boundary should lose silently
    /// rather than corrupt the now-being-sorted slab.
    pub fn push(&self, rec: RmapRecord) {
        if *self.frozen.lock().unwrap() {
            return;
        }
        self.records.lock().unwrap().push(rec);
    }

    /// Sort by physical start and freeze the slab for phase 4's
    /// parallel walk against the on-disk reverse-map btree.
    pub fn freeze_sorted(&self) -> Vec<RmapRecord> {
        let mut guard = self.records.lock().unwrap();
        guard.sort_by_key(|r| r.start_block);
        *self.frozen.lock().unwrap() = true;
        guard.clone()
    }

    /// Look up every still-unfrozen record in `agno` overlapping
    /// `[start, end)`: whether any of them is an unwritten extent, and
    /// the distinct inode owners among them. Used by phase 4's
    /// duplicate-extent finalize to recover what a merged `(start,
    /// end)` range in [`crate::incore::dup_extents::DupExtentSet`]
    /// discarded (§4.7) — which inode(s) to hold responsible and
    /// whether the §4.7 "unwritten shared extents are always illegal"
    /// rule applies.
    pub fn owners_in_range(&self, agno: u32, start: u32, end: u32) -> (bool, Vec<u64>) {
        let guard = self.records.lock().unwrap();
        let mut any_unwritten = false;
        let mut owners = Vec::new();
        for r in guard.iter() {
            if r.agno != agno {
                continue;
            }
            let r_end = r.start_block + r.length;
            if r.start_block >= end || r_end <= start {
                continue;
            }
            if r.is_unwritten {
                any_unwritten = true;
            }
            if let OwnerKind::Inode(ino) = r.owner {
                if !owners.contains(&ino) {
                    owners.push(ino);
                }
            }
        }
        (any_unwritten, owners)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RmapSlab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_sorts_by_start_block() {
        let slab = RmapSlab::new();
        slab.push(RmapRecord {
            agno: 0,
            start_block: 50,
            length: 4,
            owner: OwnerKind::Inode(100),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });
        slab.push(RmapRecord {
            agno: 0,
            start_block: 10,
            length: 4,
            owner: OwnerKind::Static(1),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });
        let sorted = slab.freeze_sorted();
        assert_eq!(sorted[0].start_block, 10);
        assert_eq!(sorted[1].start_block, 50);
    }

    #[test]
    fn owners_in_range_collects_distinct_inodes_and_unwritten_flag() {
        let slab = RmapSlab::new();
        slab.push(RmapRecord {
            agno: 0,
            start_block: 100,
            length: 8,
            owner: OwnerKind::Inode(200),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });
        slab.push(RmapRecord {
            agno: 0,
            start_block: 100,
            length: 8,
            owner: OwnerKind::Inode(300),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: true,
            logical_offset: 0,
        });
        // Different AG, must not contribute.
        slab.push(RmapRecord {
            agno: 1,
            start_block: 100,
            length: 8,
            owner: OwnerKind::Inode(999),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });

        let (unwritten, owners) = slab.owners_in_range(0, 100, 108);
        assert!(unwritten);
        assert_eq!(owners.len(), 2);
        assert!(owners.contains(&200));
        assert!(owners.contains(&300));
    }

    #[test]
    fn push_after_freeze_is_ignored() {
        let slab = RmapSlab::new();
        slab.freeze_sorted();
        slab.push(RmapRecord {
            agno: 0,
            start_block: 1,
            length: 1,
            owner: OwnerKind::Static(1),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });
        assert_eq!(slab.len(), 0);
    }
}
