//! Incore space/inode bookkeeping (§3, §4.1-§4.2) and the duplicate-extent
//! / reverse-map slabs (§4.7, §4.10) that the phase pipeline builds up
//! and cross-checks against on-disk structures.
//!
//! Every structure here is owned per allocation group (or per realtime
//! group) and guarded the way §5 describes: a mutex per group for the
//! block-state map and reverse-map slab, one mutex for the duplicate-
//! extent set, a reader/writer lock for the inode tree.

pub mod block_state;
pub mod dir_graph;
pub mod dup_extents;
pub mod inode_tree;
pub mod quota_acc;
pub mod rmap_slab;

pub use block_state::{BlockState, BlockStateMap};
pub use dir_graph::DirGraph;
pub use dup_extents::DupExtentSet;
pub use inode_tree::{InodeTree, Parents};
pub use quota_acc::QuotaAccumulator;
pub use rmap_slab::{OwnerKind, RmapRecord, RmapSlab};
