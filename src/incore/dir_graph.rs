//! Incore directory graph (§4.13, design notes): the parent→children
//! adjacency phase 6's iterative BFS walks. Built during phase 3/4 as
//! each directory's surviving entries are determined; consumed once,
//! read-only, by phase 6.
//!
//! The design notes call for an explicit visit bitmap per inode record
//! rather than graph pointers, and an iterative BFS with a FIFO of
//! pending directories rather than recursion — both live in
//! [`crate::phases::phase6_connectivity`], which owns the traversal.
//! This module only owns the edges.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct DirChildEdge {
    pub name: Vec<u8>,
    pub child_ino: u64,
    pub file_type: u8,
}

/// Append-only during phases 3-4 (one writer per directory inode, so
/// no intra-directory races), read during phase 6.
pub struct DirGraph {
    edges: Mutex<HashMap<u64, Vec<DirChildEdge>>>,
    /// Directories phase 3 found with no ".." entry and no parent known
    /// yet (§4.8 step 7): phase 6 resolves the parent through the BFS
    /// and appends the entry then.
    pending_dotdot: Mutex<HashSet<u64>>,
}

impl DirGraph {
    pub fn new() -> Self {
        DirGraph { edges: Mutex::new(HashMap::new()), pending_dotdot: Mutex::new(HashSet::new()) }
    }

    pub fn mark_missing_dotdot(&self, dir_ino: u64) {
        self.pending_dotdot.lock().unwrap().insert(dir_ino);
    }

    pub fn pending_dotdot(&self) -> Vec<u64> {
        self.pending_dotdot.lock().unwrap().iter().copied().collect()
    }

    pub fn clear_pending_dotdot(&self, dir_ino: u64) {
        self.pending_dotdot.lock().unwrap().remove(&dir_ino);
    }

    /// Record every non-"."/".." entry a directory's final (possibly
    /// rebuilt) entry set holds.
    pub fn set_children(&self, dir_ino: u64, children: Vec<DirChildEdge>) {
        self.edges.lock().unwrap().insert(dir_ino, children);
    }

    pub fn children_of(&self, dir_ino: u64) -> Vec<DirChildEdge> {
        self.edges.lock().unwrap().get(&dir_ino).cloned().unwrap_or_default()
    }

    pub fn known_dirs(&self) -> Vec<u64> {
        self.edges.lock().unwrap().keys().copied().collect()
    }
}

impl Default for DirGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_returns_children() {
        let g = DirGraph::new();
        g.set_children(
            128,
            vec![DirChildEdge { name: b"a".to_vec(), child_ino: 200, file_type: 1 }],
        );
        let children = g.children_of(128);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].child_ino, 200);
        assert!(g.children_of(999).is_empty());
    }
}
