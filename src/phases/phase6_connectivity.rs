//! Phase 6: connectivity and orphanage (§4.13).
//!
//! A single iterative BFS from the root directory over
//! [`crate::incore::dir_graph::DirGraph`]'s edges, marking every
//! inode it reaches in the per-AG [`crate::incore::inode_tree::InodeTree`].
//! Unlike phases 3-5, this walk is inherently one global traversal
//! rather than independent per-AG work, so it runs sequentially on the
//! calling thread instead of through [`crate::worker_pool`].
//!
//! Once the walk settles, two follow-up passes run against what it
//! found: directories phase 3 flagged as missing a ".." entry get one
//! now that their parent is known, and confirmed inodes the walk never
//! reached are re-parented into the orphanage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::mem::offset_of;

use crate::context::{RepairContext, RuleLabels};
use crate::diag::{Correction, PhaseReport};
use crate::dir::rebuild::rebuild_directory;
use crate::error::{ErrorKind, RepairError};
use crate::format::bmbt::collect_bmbt_extents;
use crate::format::dir::shortform::{encode_shortform_dir, parse_shortform_dir};
use crate::format::dir::DirEntryRecord;
use crate::format::extent::{parse_extent_list, Extent};
use crate::format::inode::{
    parse_inode_core, InodeInfo, XfsDinodeCore, XFS_DINODE_FMT_BTREE, XFS_DINODE_FMT_EXTENTS,
    XFS_DINODE_FMT_LOCAL, XFS_DINODE_FMT_META_BTREE,
};
use crate::format::superblock::{FormatVersion, FsContext};
use crate::incore::dir_graph::DirChildEdge;
use crate::io::engine::IoEngine;
use crate::io::reader::IoPhase;
use crate::io::txn::BufferCache;
use crate::phases::RepairState;

const FTYPE_DIR: u8 = 2;
const FTYPE_REG: u8 = 1;

pub struct Phase6Outcome {
    pub report: PhaseReport,
}

/// Drive the whole of phase 6: BFS walk, missing-".." fixup, orphan
/// collection, orphanage attachment.
pub fn run(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    cache: &BufferCache,
    state: &RepairState,
) -> Result<Phase6Outcome, RepairError> {
    let mut report = PhaseReport::new("connectivity");

    let parent_of = walk(fs, state);

    for dir_ino in state.dir_graph.pending_dotdot() {
        let Some(&parent_ino) = parent_of.get(&dir_ino) else {
            continue;
        };
        if resolve_dotdot(ctx, fs, engine, cache, state, dir_ino, parent_ino)? {
            state.dir_graph.clear_pending_dotdot(dir_ino);
            report.bump(ErrorKind::LogicalInconsistency);
            report.record(Correction::new(RuleLabels::MISSING_DOTDOT, ctx.dry_run).inode(dir_ino));
        }
    }

    let orphans = collect_orphans(ctx, fs, engine, state, &mut report)?;
    attach_orphans(ctx, fs, engine, cache, state, &orphans, &mut report)?;

    Ok(Phase6Outcome { report })
}

fn mark_reached(fs: &FsContext, state: &RepairState, ino: u64) {
    let agno = fs.ino_to_agno(ino) as usize;
    let agino = fs.ino_to_agino(ino);
    if let Some(tree) = state.inode_trees.get(agno) {
        tree.mark_reached(agino);
    }
}

fn is_confirmed_dir(fs: &FsContext, state: &RepairState, ino: u64) -> bool {
    let agno = fs.ino_to_agno(ino) as usize;
    let agino = fs.ino_to_agino(ino);
    state
        .inode_trees
        .get(agno)
        .and_then(|t| t.find(agino))
        .map(|s| s.confirmed && s.is_dir)
        .unwrap_or(false)
}

/// Iterative BFS from the root directory over the directory graph.
/// Returns the first-discovered parent of every directory the walk
/// reaches besides the root, for the missing-".." fixup below.
fn walk(fs: &FsContext, state: &RepairState) -> HashMap<u64, u64> {
    let mut parent_of: HashMap<u64, u64> = HashMap::new();
    let mut visited: HashSet<u64> = HashSet::new();
    let mut queue: VecDeque<u64> = VecDeque::new();

    visited.insert(fs.root_ino);
    mark_reached(fs, state, fs.root_ino);
    queue.push_back(fs.root_ino);

    while let Some(dir_ino) = queue.pop_front() {
        for edge in state.dir_graph.children_of(dir_ino) {
            mark_reached(fs, state, edge.child_ino);
            if edge.file_type == FTYPE_DIR && visited.insert(edge.child_ino) {
                parent_of.entry(edge.child_ino).or_insert(dir_ino);
                if is_confirmed_dir(fs, state, edge.child_ino) {
                    queue.push_back(edge.child_ino);
                }
            }
        }
    }

    parent_of
}

/// Read a directory inode's raw bytes and parse its core fields. Mirrors
/// the lock/read pattern `phase3_inodes::process_one_inode` uses, minus
/// the buffer-cache round trip, since phase 6's patches are one-shot
/// rather than folded into a chunk-wide worker transaction.
fn read_dinode(fs: &FsContext, engine: &mut IoEngine, ino: u64) -> Result<(u64, usize, Vec<u8>, InodeInfo), RepairError> {
    let (block_byte, within) = fs.ino_to_disk_position(ino);
    let buf = engine.read_at(block_byte, fs.block_size as usize, IoPhase::InodeChunks)?.to_vec();
    let end = (within + fs.inode_size as usize).min(buf.len());
    if within >= end {
        return Err(RepairError::Structural("inode offset out of block bounds"));
    }
    let is_v5 = fs.version == FormatVersion::V5;
    let info = parse_inode_core(&buf[within..end], ino, is_v5, fs.has_nrext64, fs.inode_size)?;
    Ok((block_byte, within, buf, info))
}

fn data_extents_of(engine: &mut IoEngine, fs: &FsContext, within: usize, buf: &[u8], info: &InodeInfo) -> Vec<Extent> {
    let fork_start = within + info.data_fork_offset;
    let fork_end = (fork_start + info.data_fork_size).min(buf.len());
    if fork_start >= fork_end {
        return Vec::new();
    }
    match info.format {
        XFS_DINODE_FMT_EXTENTS => {
            parse_extent_list(&buf[fork_start..fork_end], info.nextents, fs).unwrap_or_default()
        }
        XFS_DINODE_FMT_BTREE => {
            collect_bmbt_extents(engine, fs, &buf[fork_start..fork_end], info.data_fork_size).unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

/// Patch a directory's parent link now that it is known, per §4.8 step
/// 7. Shortform directories store the parent inumber directly in the
/// fork header, so the fix re-encodes just the fork in place; block-
/// resident directories go through the rebuild pipeline since ".." is
/// a real entry inside the data block there. Returns whether the fix
/// was applied (false on a dry run, or when re-encoding doesn't fit).
fn resolve_dotdot(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    cache: &BufferCache,
    state: &RepairState,
    dir_ino: u64,
    parent_ino: u64,
) -> Result<bool, RepairError> {
    if ctx.dry_run {
        return Ok(true);
    }

    let (block_byte, within, mut buf, info) = match read_dinode(fs, engine, dir_ino) {
        Ok(v) => v,
        Err(_) => return Ok(false),
    };

    if info.format == XFS_DINODE_FMT_LOCAL {
        let fork_start = within + info.data_fork_offset;
        let fork_end = (fork_start + info.data_fork_size).min(buf.len());
        if fork_start >= fork_end {
            return Ok(false);
        }
        // The value passed in only seeds the synthesized "." entry,
        // which `encode_shortform_dir` drops again below — the real
        // (stale) parent lives in the header and is superseded here.
        let entries = parse_shortform_dir(&buf[fork_start..fork_end], 0, fs).unwrap_or_default();
        let encoded = encode_shortform_dir(&entries, parent_ino, fs);
        if encoded.len() > fork_end - fork_start {
            return Ok(false);
        }
        buf[fork_start..fork_start + encoded.len()].copy_from_slice(&encoded);
        engine.write_at(block_byte, &buf)?;
        return Ok(true);
    }

    let old_extents = data_extents_of(engine, fs, within, &buf, &info);
    let Some(first_extent) = old_extents.first() else {
        return Ok(false);
    };
    let first_block = Some((first_extent.ag_number, first_extent.ag_block));

    let mut surviving: Vec<DirEntryRecord> = vec![
        DirEntryRecord { child_ino: dir_ino, name: b".".to_vec(), file_type: FTYPE_DIR, block_offset: 0 },
        DirEntryRecord { child_ino: parent_ino, name: b"..".to_vec(), file_type: FTYPE_DIR, block_offset: 0 },
    ];
    surviving.extend(state.dir_graph.children_of(dir_ino).into_iter().map(|c| DirEntryRecord {
        child_ino: c.child_ino,
        name: c.name,
        file_type: c.file_type,
        block_offset: 0,
    }));

    let agno = fs.ino_to_agno(dir_ino);
    let Some(block_state) = state.block_state.get(agno as usize) else {
        return Ok(false);
    };
    let mut guard = block_state.lock().unwrap();
    let result = rebuild_directory(
        ctx,
        fs,
        engine,
        cache,
        &mut guard,
        dir_ino,
        parent_ino,
        &old_extents,
        surviving,
        first_block,
    );
    Ok(result.is_ok())
}

/// §4.13: a disconnected metadata inode is demoted — format reset to
/// EXTENTS, metadata flag cleared — before being orphaned, so its
/// contents don't leak into the user namespace under `lost+found`.
/// A read/parse failure here just means the format patch is skipped;
/// the inode is still demoted incore and orphaned either way.
fn demote_metadata_inode(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    state: &RepairState,
    ino: u64,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let agno = fs.ino_to_agno(ino) as usize;
    let agino = fs.ino_to_agino(ino);
    if let Some(tree) = state.inode_trees.get(agno) {
        tree.mark_is_meta(agino, false);
    }
    report.bump(ErrorKind::LogicalInconsistency);
    report.record(Correction::new("metadata-inode-demoted", ctx.dry_run).inode(ino));

    if ctx.dry_run {
        return Ok(());
    }

    let (block_byte, within, mut buf, info) = match read_dinode(fs, engine, ino) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };
    if info.format == XFS_DINODE_FMT_META_BTREE {
        buf[within + offset_of!(XfsDinodeCore, di_format)] = XFS_DINODE_FMT_EXTENTS;
        engine.write_at(block_byte, &buf)?;
    }
    Ok(())
}

/// Every confirmed inode the BFS never reached, excluding the root
/// itself — these are the orphans phase 6 re-parents into the
/// orphanage. A disconnected metadata inode is demoted first (§4.13)
/// rather than excluded outright.
fn collect_orphans(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    state: &RepairState,
    report: &mut PhaseReport,
) -> Result<Vec<(u64, bool)>, RepairError> {
    let mut unreached = Vec::new();
    for (agno_idx, tree) in state.inode_trees.iter().enumerate() {
        let agno = agno_idx as u32;
        for (agino, slot) in tree.iter_confirmed() {
            let ino = fs.agino_to_ino(agno, agino);
            if ino == fs.root_ino || slot.reached {
                continue;
            }
            unreached.push((ino, slot.is_dir, slot.is_meta || fs.is_metadata_ino(ino)));
        }
    }

    let mut orphans = Vec::with_capacity(unreached.len());
    for (ino, is_dir, is_meta) in unreached {
        if is_meta {
            demote_metadata_inode(ctx, fs, engine, state, ino, report)?;
        }
        orphans.push((ino, is_dir));
    }
    Ok(orphans)
}

/// Find the orphanage directory among the root's known children. This
/// crate has no inode/block allocation primitive to create one from
/// scratch, so a missing orphanage is reported and orphan attachment
/// is skipped for this run (see `DESIGN.md`).
fn find_orphanage(ctx: &RepairContext, fs: &FsContext, state: &RepairState) -> Option<u64> {
    let name = ctx.orphanage_name.as_bytes();
    state
        .dir_graph
        .children_of(fs.root_ino)
        .into_iter()
        .find(|e| e.file_type == FTYPE_DIR && e.name == name)
        .map(|e| e.child_ino)
}

fn attach_orphans(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &mut IoEngine,
    cache: &BufferCache,
    state: &RepairState,
    orphans: &[(u64, bool)],
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    if orphans.is_empty() {
        return Ok(());
    }

    let Some(orphanage_ino) = find_orphanage(ctx, fs, state) else {
        report.bump(ErrorKind::LogicalInconsistency);
        report.record(Correction::new("orphanage-missing", ctx.dry_run));
        return Ok(());
    };

    for &(ino, _) in orphans {
        report.bump(ErrorKind::LogicalInconsistency);
        report.record(Correction::new(RuleLabels::ORPHANED, ctx.dry_run).inode(ino));
        mark_reached(fs, state, ino);
    }

    if ctx.dry_run {
        return Ok(());
    }

    let mut children = state.dir_graph.children_of(orphanage_ino);
    for &(ino, is_dir) in orphans {
        children.push(DirChildEdge {
            name: format!("orphan-{ino}").into_bytes(),
            child_ino: ino,
            file_type: if is_dir { FTYPE_DIR } else { FTYPE_REG },
        });
    }

    let (_, within, buf, info) = read_dinode(fs, engine, orphanage_ino)?;
    let old_extents = data_extents_of(engine, fs, within, &buf, &info);

    let mut surviving: Vec<DirEntryRecord> = vec![
        DirEntryRecord { child_ino: orphanage_ino, name: b".".to_vec(), file_type: FTYPE_DIR, block_offset: 0 },
        DirEntryRecord { child_ino: fs.root_ino, name: b"..".to_vec(), file_type: FTYPE_DIR, block_offset: 0 },
    ];
    surviving.extend(children.iter().map(|c| DirEntryRecord {
        child_ino: c.child_ino,
        name: c.name.clone(),
        file_type: c.file_type,
        block_offset: 0,
    }));

    let first_block = old_extents.first().map(|e| (e.ag_number, e.ag_block));
    let agno = fs.ino_to_agno(orphanage_ino);
    let Some(block_state) = state.block_state.get(agno as usize) else {
        return Err(RepairError::Structural("orphanage AG out of range"));
    };
    let mut guard = block_state.lock().unwrap();
    if rebuild_directory(
        ctx,
        fs,
        engine,
        cache,
        &mut guard,
        orphanage_ino,
        fs.root_ino,
        &old_extents,
        surviving,
        first_block,
    )
    .is_ok()
    {
        drop(guard);
        state.dir_graph.set_children(orphanage_ino, children);
    }

    for &(ino, is_dir) in orphans {
        if is_dir {
            resolve_dotdot(ctx, fs, engine, cache, state, ino, orphanage_ino)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::RepairState;

    fn ctx() -> FsContext {
        crate::format::superblock::tests::minimal_ctx(true)
    }

    fn state_with_ags(fs: &FsContext) -> RepairState {
        RepairState::new(fs, 4)
    }

    #[test]
    fn walk_marks_root_and_direct_children_reached() {
        let fs = ctx();
        let state = state_with_ags(&fs);
        state.dir_graph.set_children(
            fs.root_ino,
            vec![DirChildEdge { name: b"a".to_vec(), child_ino: 200, file_type: 1 }],
        );
        let parent_of = walk(&fs, &state);
        assert!(parent_of.is_empty());

        let agno = fs.ino_to_agno(200);
        let agino = fs.ino_to_agino(200);
        let slot = state.inode_trees[agno as usize].find(agino).unwrap();
        assert!(slot.reached);
    }

    #[test]
    fn walk_records_first_discovered_parent_of_a_subdirectory() {
        let fs = ctx();
        let state = state_with_ags(&fs);
        let sub_ino = fs.agino_to_ino(0, 200);
        state.inode_trees[0].mark_used(200);
        state.inode_trees[0].mark_confirmed(200);
        state.inode_trees[0].mark_is_dir(200, true);

        state.dir_graph.set_children(
            fs.root_ino,
            vec![DirChildEdge { name: b"sub".to_vec(), child_ino: sub_ino, file_type: FTYPE_DIR }],
        );
        let parent_of = walk(&fs, &state);
        assert_eq!(parent_of.get(&sub_ino), Some(&fs.root_ino));
    }

    fn test_engine(fs: &FsContext) -> IoEngine {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::File::create(tmp.path())
            .unwrap()
            .set_len(fs.ag_blocks as u64 * fs.block_size as u64)
            .unwrap();
        IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap()
    }

    #[test]
    fn collect_orphans_skips_reached_but_keeps_unreached_metadata_inodes() {
        let fs = ctx();
        let state = state_with_ags(&fs);
        state.inode_trees[0].mark_used(50);
        state.inode_trees[0].mark_confirmed(50);
        let unreached_ino = fs.agino_to_ino(0, 50);

        let rc = RepairContext::default();
        let mut engine = test_engine(&fs);
        let mut report = PhaseReport::new("connectivity");
        let orphans = collect_orphans(&rc, &fs, &mut engine, &state, &mut report).unwrap();
        assert!(orphans.iter().any(|(ino, _)| *ino == unreached_ino));
    }

    #[test]
    fn collect_orphans_demotes_unreached_metadata_inode_before_orphaning() {
        let fs = ctx();
        let state = state_with_ags(&fs);
        state.inode_trees[0].mark_used(50);
        state.inode_trees[0].mark_confirmed(50);
        state.inode_trees[0].mark_is_meta(50, true);
        let meta_ino = fs.agino_to_ino(0, 50);

        let rc = RepairContext::default();
        let mut engine = test_engine(&fs);
        let mut report = PhaseReport::new("connectivity");
        let orphans = collect_orphans(&rc, &fs, &mut engine, &state, &mut report).unwrap();

        assert!(orphans.iter().any(|(ino, _)| *ino == meta_ino));
        assert!(!state.inode_trees[0].find(50).unwrap().is_meta);
        assert!(report.corrections.iter().any(|c| c.rule == "metadata-inode-demoted"));
    }

    #[test]
    fn attach_orphans_reports_missing_orphanage_without_panicking() {
        let fs = ctx();
        let state = state_with_ags(&fs);
        let rc = RepairContext::default();
        let cache = BufferCache::new();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::File::create(tmp.path())
            .unwrap()
            .set_len(fs.ag_blocks as u64 * fs.block_size as u64)
            .unwrap();
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let mut report = PhaseReport::new("connectivity");

        attach_orphans(&rc, &fs, &mut engine, &cache, &state, &[(500, false)], &mut report).unwrap();
        assert!(report.total_errors() > 0);
    }
}
