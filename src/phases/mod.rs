//! The seven-phase repair pipeline (§4.1-§4.14). Phases run strictly
//! in order; within a phase, work is fanned out per-AG via
//! [`crate::worker_pool::map`] subject to the per-group locking
//! discipline of §5.

pub mod dinode;
pub mod extent_recon;
pub mod phase1_super;
pub mod phase2_log;
pub mod phase3_inodes;
pub mod phase4_rmap;
pub mod phase4_refcount;
pub mod phase5_rebuild;
pub mod phase6_connectivity;
pub mod phase7_quota;

use crate::incore::block_state::BlockStateMap;
use crate::incore::dir_graph::DirGraph;
use crate::incore::dup_extents::DupExtentSet;
use crate::incore::inode_tree::InodeTree;
use crate::incore::quota_acc::QuotaAccumulator;
use crate::incore::rmap_slab::RmapSlab;
use std::sync::Mutex;

/// The incore state shared by every phase from 3 onward, indexed by AG
/// number. One `RepairState` lives for the whole run, built once phase 1
/// has established [`crate::format::superblock::FsContext`]'s AG count
/// and per-AG geometry.
pub struct RepairState {
    pub block_state: Vec<Mutex<BlockStateMap>>,
    pub inode_trees: Vec<InodeTree>,
    pub dup_extents: DupExtentSet,
    pub rmap_slab: RmapSlab,
    pub dir_graph: DirGraph,
    pub quota_acc: QuotaAccumulator,
    /// Realtime-group block-state maps, empty when there is no
    /// realtime device.
    pub rt_block_state: Vec<Mutex<BlockStateMap>>,
    pub rt_rmap_slab: RmapSlab,
}

impl RepairState {
    /// Seed one `BlockStateMap`/`InodeTree` pair per AG. `hdr_blocks` is
    /// the number of leading blocks in every AG reserved for the
    /// superblock/AGI/AGF/AGFL headers (fixed regardless of AG size).
    pub fn new(fs: &crate::format::superblock::FsContext, hdr_blocks: u32) -> Self {
        let block_state = (0..fs.ag_count)
            .map(|agno| Mutex::new(BlockStateMap::new_ag(agno, fs.ag_size(agno), hdr_blocks)))
            .collect();
        let inode_trees = (0..fs.ag_count).map(|_| InodeTree::new()).collect();

        RepairState {
            block_state,
            inode_trees,
            dup_extents: DupExtentSet::new(),
            rmap_slab: RmapSlab::new(),
            dir_graph: DirGraph::new(),
            quota_acc: QuotaAccumulator::new(),
            rt_block_state: Vec::new(),
            rt_rmap_slab: RmapSlab::new(),
        }
    }

    /// Seed realtime-group block-state maps once phase 2 has located
    /// the realtime bitmap/summary inodes and determined the device's
    /// extent geometry (§4.1, realtime seeding rule).
    pub fn init_realtime(&mut self, rtg_count: u32, rtg_size: u32, has_rt_superblock: bool) {
        self.rt_block_state = (0..rtg_count)
            .map(|g| Mutex::new(BlockStateMap::new_rtg(g, rtg_size, has_rt_superblock)))
            .collect();
    }
}
