//! Directory processor (§4.8): parses every directory block, validates
//! entries against the incore inode tree, and classifies the directory
//! into the state machine that decides whether a rebuild is needed.
//!
//! ```text
//! INIT -> SCANNING -> CLEAN
//!                   -> DIRTY_SALVAGE -> REBUILDING -> CLEAN
//!                                    -> FATAL (rebuild failed)
//! ```

use crate::diag::Correction;
use crate::dir::name_index::{CollisionKind, NameIndex};
use crate::format::dir::DirEntryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    Init,
    Scanning,
    Clean,
    DirtySalvage,
    Rebuilding,
    Fatal,
}

/// What the dinode processor / phase 6 knows about a directory-entry
/// target, without the directory processor needing its own handle into
/// the incore inode tree.
pub trait TargetLookup {
    fn exists_confirmed(&self, ino: u64) -> bool;
    fn is_dir(&self, ino: u64) -> bool;
    fn is_meta(&self, ino: u64) -> bool;
}

pub struct DirScanOutcome {
    pub state: DirState,
    pub surviving_entries: Vec<DirEntryRecord>,
    pub corrections: Vec<Correction>,
    pub has_dot: bool,
    pub has_dotdot: bool,
    pub observed_dotdot_target: Option<u64>,
    pub needs_rebuild: bool,
}

/// Scan every block of a directory's data extents (in logical-block
/// order) and decide what survives. `self_ino` is the directory's own
/// inumber (for validating "."); `known_parent` is the parent inumber
/// already observed from the *parent's* scan, if any (used to repair
/// a missing "..", §4.8 step 7).
pub fn scan_directory(
    blocks: &[Vec<DirEntryRecord>],
    self_ino: u64,
    known_parent: Option<u64>,
    lookup: &dyn TargetLookup,
) -> DirScanOutcome {
    let mut index = NameIndex::new();
    let mut surviving = Vec::new();
    let mut corrections = Vec::new();
    let mut dirty = false;
    let mut has_dot = false;
    let mut has_dotdot = false;
    let mut dotdot_target = None;

    for (block_no, block) in blocks.iter().enumerate() {
        for entry in block {
            if entry.child_ino == 0 {
                // B3: inumber 0 is never a valid directory-entry target.
                corrections.push(Correction::new(crate::context::RuleLabels::DIR_ENTRY_DROPPED, false));
                dirty = true;
                continue;
            }

            if entry.is_dot() {
                if has_dot || entry.child_ino != self_ino {
                    corrections
                        .push(Correction::new(crate::context::RuleLabels::DIR_ENTRY_DROPPED, false));
                    dirty = true;
                    continue;
                }
                has_dot = true;
                surviving.push(entry.clone());
                continue;
            }

            if entry.is_dotdot() {
                if block_no != 0 || has_dotdot {
                    corrections
                        .push(Correction::new(crate::context::RuleLabels::DIR_ENTRY_DROPPED, false));
                    dirty = true;
                    continue;
                }
                has_dotdot = true;
                dotdot_target = Some(entry.child_ino);
                surviving.push(entry.clone());
                continue;
            }

            if !lookup.exists_confirmed(entry.child_ino) {
                corrections.push(Correction::new(crate::context::RuleLabels::DIR_ENTRY_DROPPED, false));
                dirty = true;
                continue;
            }

            if lookup.is_meta(entry.child_ino) {
                // A regular entry pointing at a metadata inode (or the
                // converse, checked by the dinode processor itself) is
                // dropped — metadata must not leak into the namespace.
                corrections.push(Correction::new(crate::context::RuleLabels::DIR_ENTRY_DROPPED, false));
                dirty = true;
                continue;
            }

            let expected_is_dir = entry.file_type == FTYPE_DIR;
            let mut entry = entry.clone();
            if expected_is_dir != lookup.is_dir(entry.child_ino) {
                entry.file_type = if lookup.is_dir(entry.child_ino) { FTYPE_DIR } else { FTYPE_REG };
                corrections.push(Correction::new("ftype-mismatch", false));
                dirty = true;
            }

            match index.insert(&entry.name, entry.child_ino, entry.file_type) {
                Some(CollisionKind::Raw) => {
                    corrections
                        .push(Correction::new(crate::context::RuleLabels::DIR_ENTRY_DROPPED, false));
                    dirty = true;
                    continue;
                }
                Some(CollisionKind::Normalized) => {
                    corrections.push(Correction::new("name-rendering-identical", false));
                }
                Some(CollisionKind::Skeleton) => {
                    corrections.push(Correction::new("name-confusable", false));
                }
                None => {}
            }

            surviving.push(entry);
        }
    }

    if !has_dot {
        corrections.push(Correction::new(crate::context::RuleLabels::MISSING_DOT, false));
        surviving.push(DirEntryRecord { child_ino: self_ino, name: b".".to_vec(), file_type: FTYPE_DIR, block_offset: 0 });
        dirty = true;
    }

    if !has_dotdot {
        if let Some(parent) = known_parent {
            corrections.push(Correction::new(crate::context::RuleLabels::MISSING_DOTDOT, false));
            surviving.push(DirEntryRecord { child_ino: parent, name: b"..".to_vec(), file_type: FTYPE_DIR, block_offset: 0 });
            dotdot_target = Some(parent);
            dirty = true;
        }
        // If the parent isn't known yet, phase 6's connectivity pass
        // defers this directory and fixes it once the edge is found.
    }

    DirScanOutcome {
        state: if dirty { DirState::DirtySalvage } else { DirState::Clean },
        surviving_entries: surviving,
        corrections,
        has_dot,
        has_dotdot,
        observed_dotdot_target: dotdot_target,
        needs_rebuild: dirty,
    }
}

const FTYPE_DIR: u8 = 2;
const FTYPE_REG: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeLookup {
        confirmed: Vec<u64>,
        dirs: Vec<u64>,
        meta: Vec<u64>,
    }

    impl TargetLookup for FakeLookup {
        fn exists_confirmed(&self, ino: u64) -> bool {
            self.confirmed.contains(&ino)
        }
        fn is_dir(&self, ino: u64) -> bool {
            self.dirs.contains(&ino)
        }
        fn is_meta(&self, ino: u64) -> bool {
            self.meta.contains(&ino)
        }
    }

    fn entry(ino: u64, name: &str, ftype: u8) -> DirEntryRecord {
        DirEntryRecord { child_ino: ino, name: name.as_bytes().to_vec(), file_type: ftype, block_offset: 0 }
    }

    #[test]
    fn clean_directory_with_dot_dotdot_and_one_child() {
        let lookup = FakeLookup { confirmed: vec![200], dirs: vec![], meta: vec![] };
        let blocks = vec![vec![
            entry(128, ".", FTYPE_DIR),
            entry(1, "..", FTYPE_DIR),
            entry(200, "file.txt", FTYPE_REG),
        ]];
        let outcome = scan_directory(&blocks, 128, Some(1), &lookup);
        assert_eq!(outcome.state, DirState::Clean);
        assert_eq!(outcome.surviving_entries.len(), 3);
    }

    #[test]
    fn drops_entry_targeting_free_inode() {
        let lookup = FakeLookup { confirmed: vec![], dirs: vec![], meta: vec![] };
        let blocks = vec![vec![entry(128, ".", FTYPE_DIR), entry(999, "ghost", FTYPE_REG)]];
        let outcome = scan_directory(&blocks, 128, None, &lookup);
        assert_eq!(outcome.state, DirState::DirtySalvage);
        assert_eq!(outcome.surviving_entries.len(), 1);
    }

    #[test]
    fn missing_dotdot_is_recreated_when_parent_known() {
        let lookup = FakeLookup { confirmed: vec![], dirs: vec![], meta: vec![] };
        let blocks = vec![vec![entry(128, ".", FTYPE_DIR)]];
        let outcome = scan_directory(&blocks, 128, Some(5), &lookup);
        assert!(outcome.has_dot);
        assert!(!outcome.has_dotdot);
        assert_eq!(outcome.observed_dotdot_target, Some(5));
        assert!(outcome.needs_rebuild);
    }

    #[test]
    fn dotdot_outside_first_block_is_dropped() {
        let lookup = FakeLookup { confirmed: vec![], dirs: vec![], meta: vec![] };
        let blocks = vec![vec![entry(128, ".", FTYPE_DIR)], vec![entry(1, "..", FTYPE_DIR)]];
        let outcome = scan_directory(&blocks, 128, Some(1), &lookup);
        assert!(!outcome.has_dotdot);
    }

    #[test]
    fn duplicate_name_is_dropped_as_hard_error() {
        let lookup = FakeLookup { confirmed: vec![10, 11], dirs: vec![], meta: vec![] };
        let blocks = vec![vec![entry(10, "dup", FTYPE_REG), entry(11, "dup", FTYPE_REG)]];
        let outcome = scan_directory(&blocks, 128, None, &lookup);
        let kept: Vec<_> = outcome.surviving_entries.iter().filter(|e| e.name == b"dup").collect();
        assert_eq!(kept.len(), 1);
    }
}
