//! Incore inode record tree (§4.2): per-AG balanced tree keyed by
//! startinumber, one node per 64 consecutive inode slots — the same
//! chunk size the on-disk inode-allocation btree uses.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::context::ParentsMode;
use crate::error::RepairError;

pub const CHUNK_SIZE: u32 = 64;

/// Tagged variant replacing the historical "manual parent-pointer
/// list": an inode may have zero, one, or (in `Many` mode) several
/// candidate parents while phase 3/6 are still discovering them. The
/// selector is fixed once per run and never flipped (design notes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parents {
    SingleUnknown,
    Single(u64),
    Many(Vec<u64>),
}

impl Default for Parents {
    fn default() -> Self {
        Parents::SingleUnknown
    }
}

/// Per-entry bookkeeping for one inode slot within a chunk.
#[derive(Debug, Clone, Default)]
pub struct InodeSlot {
    pub confirmed: bool,
    pub reached: bool,
    pub refchecked: bool,
    pub is_dir: bool,
    pub is_meta: bool,
    pub parent_known: bool,
    pub file_type: u8,
    pub parents: Parents,
    pub disk_nlink: u32,
    pub refs_observed: u32,
}

/// One node of the tree: 64 consecutive inode slots sharing a
/// `startinumber`, plus the allocation/free bitmasks required to stay
/// disjoint (an inode invariant checked on every mutation in debug
/// builds via `debug_assert!`).
pub struct InodeChunk {
    pub start_ino: u32,
    pub alloc_mask: u64,
    pub free_mask: u64,
    pub slots: Vec<InodeSlot>,
}

impl InodeChunk {
    fn new(start_ino: u32) -> Self {
        InodeChunk {
            start_ino,
            alloc_mask: 0,
            free_mask: u64::MAX,
            slots: vec![InodeSlot::default(); CHUNK_SIZE as usize],
        }
    }

    fn bit(offset: u32) -> u64 {
        1u64 << offset
    }
}

/// Per-AG inode record tree (§4.2). Reader/writer-locked: structural
/// operations (insert/rebalance, i.e. creating a new chunk) take the
/// writer lock; read-mostly lookups may proceed in parallel by cloning
/// the slot they need.
pub struct InodeTree {
    chunks: RwLock<BTreeMap<u32, InodeChunk>>,
}

impl InodeTree {
    pub fn new() -> Self {
        InodeTree { chunks: RwLock::new(BTreeMap::new()) }
    }

    fn chunk_start(agino: u32) -> u32 {
        agino - (agino % CHUNK_SIZE)
    }

    /// Locate (creating if necessary) the chunk covering `agino`, and
    /// run `f` against the slot for that inode under the writer lock.
    pub fn with_slot_mut<R>(&self, agino: u32, f: impl FnOnce(&mut InodeSlot) -> R) -> R {
        let start = Self::chunk_start(agino);
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks.entry(start).or_insert_with(|| InodeChunk::new(start));
        let idx = (agino - start) as usize;
        f(&mut chunk.slots[idx])
    }

    /// Read-mostly lookup: clone out the slot's current state.
    pub fn find(&self, agino: u32) -> Option<InodeSlot> {
        let start = Self::chunk_start(agino);
        let chunks = self.chunks.read().unwrap();
        chunks.get(&start).map(|c| c.slots[(agino - start) as usize].clone())
    }

    /// Whether `agino`'s allocation bit is set, independent of whether
    /// its dinode has been (or is still being) validated — used for
    /// cross-AG directory-entry existence checks during phase 3, where
    /// the target AG's own confirmation pass may still be in flight.
    pub fn is_allocated(&self, agino: u32) -> bool {
        let start = Self::chunk_start(agino);
        let chunks = self.chunks.read().unwrap();
        chunks.get(&start).map(|c| c.alloc_mask & (1u64 << (agino - start)) != 0).unwrap_or(false)
    }

    pub fn mark_used(&self, agino: u32) {
        let start = Self::chunk_start(agino);
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks.entry(start).or_insert_with(|| InodeChunk::new(start));
        let bit = InodeChunk::bit(agino - start);
        chunk.alloc_mask |= bit;
        chunk.free_mask &= !bit;
    }

    pub fn mark_free(&self, agino: u32) {
        let start = Self::chunk_start(agino);
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks.entry(start).or_insert_with(|| InodeChunk::new(start));
        let bit = InodeChunk::bit(agino - start);
        chunk.alloc_mask &= !bit;
        chunk.free_mask |= bit;
    }

    pub fn mark_confirmed(&self, agino: u32) {
        self.with_slot_mut(agino, |s| s.confirmed = true);
    }

    /// Reverse `mark_confirmed`: used when a later phase determines an
    /// already-confirmed inode has no remaining claim on the
    /// filesystem (e.g. phase 4 zapping a duplicate-extent owner) and
    /// must drop out of `iter_confirmed` so phase 5/6/7 stop treating
    /// it as live.
    pub fn clear_confirmed(&self, agino: u32) {
        self.with_slot_mut(agino, |s| s.confirmed = false);
    }

    pub fn mark_reached(&self, agino: u32) {
        self.with_slot_mut(agino, |s| s.reached = true);
    }

    pub fn mark_refchecked(&self, agino: u32) {
        self.with_slot_mut(agino, |s| s.refchecked = true);
    }

    pub fn mark_is_dir(&self, agino: u32, v: bool) {
        self.with_slot_mut(agino, |s| s.is_dir = v);
    }

    pub fn mark_is_meta(&self, agino: u32, v: bool) {
        self.with_slot_mut(agino, |s| s.is_meta = v);
    }

    pub fn set_ftype(&self, agino: u32, ftype: u8) {
        self.with_slot_mut(agino, |s| s.file_type = ftype);
    }

    pub fn set_disk_nlinks(&self, agino: u32, nlink: u32) {
        self.with_slot_mut(agino, |s| s.disk_nlink = nlink);
    }

    pub fn add_inode_ref(&self, agino: u32) {
        self.with_slot_mut(agino, |s| s.refs_observed += 1);
    }

    /// `alloc_ex_data`: attach a parent candidate per the run's fixed
    /// `ParentsMode`. In `Single` mode a conflicting second parent is a
    /// logical inconsistency the caller must record (we return it
    /// rather than silently overwriting).
    pub fn set_parent(
        &self,
        agino: u32,
        parent_ino: u64,
        mode: ParentsMode,
    ) -> Result<(), RepairError> {
        self.with_slot_mut(agino, |s| {
            s.parent_known = true;
            match mode {
                ParentsMode::Single => match &s.parents {
                    Parents::SingleUnknown => {
                        s.parents = Parents::Single(parent_ino);
                        Ok(())
                    }
                    Parents::Single(existing) if *existing == parent_ino => Ok(()),
                    Parents::Single(_) => {
                        Err(RepairError::Logical("conflicting parent for inode under Single mode"))
                    }
                    Parents::Many(_) => {
                        Err(RepairError::Logical("parents mode mismatch: Many under Single selector"))
                    }
                },
                ParentsMode::Many => {
                    match &mut s.parents {
                        Parents::SingleUnknown => s.parents = Parents::Many(vec![parent_ino]),
                        Parents::Many(v) => {
                            if !v.contains(&parent_ino) {
                                v.push(parent_ino);
                            }
                        }
                        Parents::Single(_) => {
                            return Err(RepairError::Logical(
                                "parents mode mismatch: Single under Many selector",
                            ));
                        }
                    }
                    Ok(())
                }
            }
        })
    }

    /// Inode slots referenced by a directory entry ([`Self::add_inode_ref`])
    /// but never marked allocated by the inobt walk — candidates for the
    /// cross-reference-driven cluster rediscovery in §4.5 step 3. Only
    /// chunks the tree has already touched (by a ref or an inobt record)
    /// are considered; a chunk nothing has ever referenced has no
    /// candidates to offer.
    pub fn referenced_unallocated(&self) -> Vec<u32> {
        let chunks = self.chunks.read().unwrap();
        let mut out = Vec::new();
        for chunk in chunks.values() {
            for (i, slot) in chunk.slots.iter().enumerate() {
                let bit = InodeChunk::bit(i as u32);
                if slot.refs_observed > 0 && chunk.alloc_mask & bit == 0 {
                    out.push(chunk.start_ino + i as u32);
                }
            }
        }
        out
    }

    /// Every chunk the tree currently knows about, in startinumber
    /// order — phase 5 walks this to rebuild the inode-allocation btree.
    pub fn iter_chunks(&self) -> Vec<(u32, u64, u64)> {
        let chunks = self.chunks.read().unwrap();
        chunks.values().map(|c| (c.start_ino, c.alloc_mask, c.free_mask)).collect()
    }

    /// All confirmed inode slots as `(agino, slot)` pairs, in order —
    /// phase 6 connectivity walk and phase 7 quota reconciliation both
    /// need to enumerate every confirmed inode.
    pub fn iter_confirmed(&self) -> Vec<(u32, InodeSlot)> {
        let chunks = self.chunks.read().unwrap();
        let mut out = Vec::new();
        for chunk in chunks.values() {
            for (i, slot) in chunk.slots.iter().enumerate() {
                if slot.confirmed {
                    out.push((chunk.start_ino + i as u32, slot.clone()));
                }
            }
        }
        out
    }
}

impl Default for InodeTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_masks_stay_disjoint() {
        let tree = InodeTree::new();
        tree.mark_used(5);
        let chunks = tree.iter_chunks();
        assert_eq!(chunks.len(), 1);
        let (start, alloc, free) = chunks[0];
        assert_eq!(start, 0);
        assert_eq!(alloc & free, 0);
        assert_ne!(alloc & (1 << 5), 0);
    }

    #[test]
    fn single_mode_rejects_conflicting_parent() {
        let tree = InodeTree::new();
        tree.set_parent(10, 100, ParentsMode::Single).unwrap();
        assert!(tree.set_parent(10, 200, ParentsMode::Single).is_err());
        assert!(tree.set_parent(10, 100, ParentsMode::Single).is_ok());
    }

    #[test]
    fn many_mode_accumulates_parents() {
        let tree = InodeTree::new();
        tree.set_parent(10, 100, ParentsMode::Many).unwrap();
        tree.set_parent(10, 200, ParentsMode::Many).unwrap();
        let slot = tree.find(10).unwrap();
        assert_eq!(slot.parents, Parents::Many(vec![100, 200]));
    }

    #[test]
    fn referenced_unallocated_excludes_confirmed_and_unreferenced_slots() {
        let tree = InodeTree::new();
        tree.add_inode_ref(10);
        tree.mark_used(20);
        tree.add_inode_ref(20);

        let candidates = tree.referenced_unallocated();
        assert_eq!(candidates, vec![10]);
    }

    #[test]
    fn confirmed_marks_survive_across_mutations() {
        let tree = InodeTree::new();
        tree.mark_used(70);
        tree.mark_confirmed(70);
        tree.mark_is_dir(70, true);
        let slot = tree.find(70).unwrap();
        assert!(slot.confirmed);
        assert!(slot.is_dir);
        let chunks = tree.iter_chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, 64);
    }
}
