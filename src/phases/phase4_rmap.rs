//! Phase 4, reverse-map half (§4.7 pass 2, §4.10).
//!
//! Two jobs per AG, run as two separate worker-pool barriers since the
//! second needs every AG's contribution to the shared reverse-map slab
//! to have landed first:
//!
//!   1. Seed static AG-metadata ownership (header blocks, free-space
//!      and inode btree roots, inode-chunk blocks) into the block-state
//!      map and reverse-map slab, then commit the MULTI transition
//!      (§4.7 pass 2) for every range phase 3's CollectDuplicates pass
//!      flagged.
//!   2. Freeze the slab once, then diff each AG's reconciled view
//!      against the on-disk reverse-map btree. A mismatch doesn't
//!      rewrite anything here — it only marks the AG for phase 5.
//!
//! Static-metadata seeding happens here rather than in phase 1/3
//! because it needs the AGF/AGI roots phase 1 doesn't parse and phase
//! 3 doesn't carry forward; see DESIGN.md for the ordering tradeoff
//! this implies (an inode extent that wrongly claims a btree-root
//! block during phase 3 is only caught here, one phase later, rather
//! than at the moment phase 3 processes that inode).

use std::collections::HashSet;
use std::sync::Mutex;

use crate::context::{RepairContext, RuleLabels};
use crate::diag::{Correction, PhaseReport};
use crate::error::{ErrorKind, RepairError};
use crate::format::ag::{AgfInfo, AgiInfo};
use crate::format::btree::{collect_records, XfsInobtRec, INOBT_SHAPE, RMAPBT_SHAPE};
use crate::format::rmap::owner as rmap_owner;
use crate::format::rmap::XfsRmapRec;
use crate::format::superblock::FsContext;
use crate::incore::block_state::{BlockState, BlockStateMap};
use crate::incore::dup_extents::DupExtentSet;
use crate::incore::inode_tree::{InodeTree, CHUNK_SIZE};
use crate::incore::rmap_slab::{OwnerKind, RmapRecord, RmapSlab};
use crate::io::engine::IoEngine;
use crate::io::reader::{IoPhase, IoReader};
use crate::phases::dinode::zap_inode_for_duplicate;
use crate::phases::extent_recon::{reconcile_extent, ForkKind, ReconPass, ReconRequest};
use crate::phases::RepairState;
use crate::worker_pool;

const HDR_READ_LEN: usize = 512;

pub struct Phase4RmapOutcome {
    pub report: PhaseReport,
    /// AGs whose on-disk reverse-map btree disagrees with the
    /// reconciled slab and must be rebuilt by phase 5.
    pub ags_needing_rmap_rebuild: Vec<u32>,
    /// The slab, frozen at this phase boundary — phase 4's refcount
    /// pass reuses it rather than re-deriving ownership from scratch.
    pub frozen_rmap: Vec<RmapRecord>,
}

pub fn run(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
) -> Result<Phase4RmapOutcome, RepairError> {
    let agnos: Vec<u32> = (0..fs.ag_count).collect();

    let seed_reports =
        worker_pool::map(ctx, agnos.clone(), |agno| seed_and_finalize_ag(ctx, fs, engine, state, agno));
    let mut report = PhaseReport::new("rmap");
    for r in seed_reports {
        report.merge(r);
    }

    let frozen = state.rmap_slab.freeze_sorted();

    if !fs.has_rmapbt {
        return Ok(Phase4RmapOutcome {
            report,
            ags_needing_rmap_rebuild: Vec::new(),
            frozen_rmap: frozen,
        });
    }

    let diffs = worker_pool::map(ctx, agnos, |agno| diff_ag(ctx, fs, engine, &frozen, agno));
    let mut ags_needing_rmap_rebuild = Vec::new();
    for (agno, r, dirty) in diffs {
        report.merge(r);
        if dirty {
            ags_needing_rmap_rebuild.push(agno);
        }
    }

    Ok(Phase4RmapOutcome { report, ags_needing_rmap_rebuild, frozen_rmap: frozen })
}

fn seed_and_finalize_ag(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    agno: u32,
) -> PhaseReport {
    let mut report = PhaseReport::new("rmap");
    if let Err(e) = seed_and_finalize_ag_inner(ctx, fs, engine, state, agno, &mut report) {
        report.bump(e.kind());
        report.record(Correction::new("ag-rmap-seed-aborted", ctx.dry_run).ag(agno));
    }
    report
}

fn seed_and_finalize_ag_inner(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let Some(block_state) = state.block_state.get(agno as usize) else {
        return Err(RepairError::Structural("rmap phase: AG out of range"));
    };

    seed_static_metadata(fs, engine, block_state, &state.rmap_slab, agno)?;
    finalize_duplicates(
        ctx,
        report,
        engine,
        fs,
        block_state,
        &state.dup_extents,
        &state.rmap_slab,
        &state.inode_trees,
        agno,
        fs.has_reflink,
    )?;
    Ok(())
}

/// Mark AG-structural metadata — free-space/inode btree roots and the
/// blocks backing each allocated 64-inode chunk — as reserved in the
/// block-state map, and record the same ownership in the reverse-map
/// slab under the appropriate well-known static owner.
fn seed_static_metadata(
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    block_state: &Mutex<BlockStateMap>,
    rmap_slab: &RmapSlab,
    agno: u32,
) -> Result<(), RepairError> {
    let (agf, agi) = {
        let mut eng = engine.lock().unwrap();
        let agf_buf = eng.read_at(fs.agf_byte_offset(agno), HDR_READ_LEN, IoPhase::Agf)?.to_vec();
        let agf = AgfInfo::from_buf(&agf_buf, agno, fs.version)?;
        let agi_buf = eng.read_at(fs.agi_byte_offset(agno), HDR_READ_LEN, IoPhase::Agi)?.to_vec();
        let agi = AgiInfo::from_buf(&agi_buf, agno, fs.version)?;
        (agf, agi)
    };

    let mark = |block: u32, state: BlockState, owner: u64| {
        block_state.lock().unwrap().set(block as u64, 1, state);
        rmap_slab.push(RmapRecord {
            agno,
            start_block: block,
            length: 1,
            owner: OwnerKind::Static(owner),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });
    };

    mark(agf.bnobt_root, BlockState::FsMap, rmap_owner::BNOBT);
    mark(agf.cntbt_root, BlockState::FsMap, rmap_owner::CNTBT);
    mark(agi.inobt_root, BlockState::Ino, rmap_owner::INOBT);
    if fs.has_finobt && agi.finobt_root != 0 {
        mark(agi.finobt_root, BlockState::Ino, rmap_owner::INOBT);
    }
    if fs.has_rmapbt && agf.rmap_root != 0 {
        mark(agf.rmap_root, BlockState::InuseFs, rmap_owner::FS);
    }
    if fs.has_reflink && agf.refcount_root != 0 {
        mark(agf.refcount_root, BlockState::Refc, rmap_owner::REFC);
    }

    let inobt_records: Vec<XfsInobtRec> = {
        let mut eng = engine.lock().unwrap();
        collect_records::<IoEngine, XfsInobtRec>(&mut eng, fs, agno, agi.inobt_root, agi.inobt_level, INOBT_SHAPE)?
    };
    let blocks_per_chunk = (CHUNK_SIZE / fs.inodes_per_block as u32).max(1);
    for rec in &inobt_records {
        let start_block = rec.start_ino() >> fs.inop_blog;
        for b in 0..blocks_per_chunk {
            mark(start_block + b, BlockState::Ino, rmap_owner::INODES);
        }
    }

    Ok(())
}

/// §4.7 pass 2: commit the MULTI transition for every range phase 3
/// only recorded as a duplicate, warning unless the filesystem is
/// reflink-capable and the range is a written share (an unwritten
/// shared extent is always illegal, reflink or not). Each merged
/// range's owning inode(s) and unwritten flag were discarded when
/// `DupExtentSet` collapsed them to a bare `(start, end)`, so they are
/// recovered here from the still-unfrozen reverse-map slab.
///
/// When the share is not legitimate and at least one owner was
/// identified, every owning inode is zapped (§8 scenario 3) and the
/// range is left `FREE` rather than `MULTI`, since it then has no
/// remaining owner. If no owner can be identified (e.g. reverse-map
/// collection found nothing for this range), the range is left
/// `MULTI` with the warning already recorded — freeing a range nobody
/// could be shown to have vacated would be worse than the stale state.
#[allow(clippy::too_many_arguments)]
fn finalize_duplicates(
    ctx: &RepairContext,
    report: &mut PhaseReport,
    engine: &Mutex<IoEngine>,
    fs: &FsContext,
    block_state: &Mutex<BlockStateMap>,
    dup_extents: &DupExtentSet,
    rmap_slab: &RmapSlab,
    inode_trees: &[InodeTree],
    agno: u32,
    reflink_capable: bool,
) -> Result<(), RepairError> {
    for (start, end) in dup_extents.ranges_for_ag(agno) {
        let (is_unwritten, owners) = rmap_slab.owners_in_range(agno, start, end);
        let req = ReconRequest {
            owner_ino: owners.first().copied().unwrap_or(0),
            fork: ForkKind::Data,
            logical_offset: 0,
            is_unwritten,
            reflink_capable,
            zapping_metadata: false,
        };
        reconcile_extent(
            ctx,
            report,
            block_state,
            dup_extents,
            None,
            agno,
            start,
            (end - start) as u64,
            &req,
            ReconPass::Finalize,
        )?;

        let legitimate_share = reflink_capable && !is_unwritten;
        if !legitimate_share && !owners.is_empty() {
            for &owner_ino in &owners {
                let owner_agno = fs.ino_to_agno(owner_ino) as usize;
                let owner_agino = fs.ino_to_agino(owner_ino);
                if let Some(tree) = inode_trees.get(owner_agno) {
                    tree.clear_confirmed(owner_agino);
                    tree.mark_free(owner_agino);
                }
                if !ctx.dry_run {
                    let mut eng = engine.lock().unwrap();
                    zap_inode_for_duplicate(fs, &mut eng, owner_ino)?;
                }
            }
            if !ctx.dry_run {
                block_state.lock().unwrap().set(start as u64, (end - start) as u64, BlockState::Free);
            }
        }
    }
    Ok(())
}

fn encode_owner(owner: OwnerKind) -> u64 {
    match owner {
        OwnerKind::Inode(ino) => ino,
        OwnerKind::Static(s) => s,
    }
}

fn diff_ag(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    frozen: &[RmapRecord],
    agno: u32,
) -> (u32, PhaseReport, bool) {
    let mut report = PhaseReport::new("rmap");
    match diff_ag_inner(ctx, fs, engine, frozen, agno, &mut report) {
        Ok(dirty) => (agno, report, dirty),
        Err(e) => {
            report.bump(e.kind());
            report.record(Correction::new("ag-rmap-diff-aborted", ctx.dry_run).ag(agno));
            (agno, report, false)
        }
    }
}

fn diff_ag_inner(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    frozen: &[RmapRecord],
    agno: u32,
    report: &mut PhaseReport,
) -> Result<bool, RepairError> {
    let agf_buf = {
        let mut eng = engine.lock().unwrap();
        eng.read_at(fs.agf_byte_offset(agno), HDR_READ_LEN, IoPhase::Agf)?.to_vec()
    };
    let agf = AgfInfo::from_buf(&agf_buf, agno, fs.version)?;
    if agf.rmap_root == 0 {
        return Ok(false);
    }

    let ondisk: Vec<XfsRmapRec> = {
        let mut eng = engine.lock().unwrap();
        collect_records::<IoEngine, XfsRmapRec>(&mut eng, fs, agno, agf.rmap_root, agf.rmap_level, RMAPBT_SHAPE)?
    };
    let observed: HashSet<(u32, u32, u64)> = ondisk
        .iter()
        .map(|r| {
            let e = r.unpack();
            (e.start_block, e.block_count, e.owner)
        })
        .collect();

    let expected: HashSet<(u32, u32, u64)> = frozen
        .iter()
        .filter(|r| r.agno == agno)
        .map(|r| (r.start_block, r.length, encode_owner(r.owner)))
        .collect();

    if expected != observed {
        report.bump(ErrorKind::StructuralCorruption);
        report.record(Correction::new(RuleLabels::RMAP_MISMATCH, ctx.dry_run).ag(agno));
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::superblock::tests::minimal_ctx;

    fn test_engine(fs: &FsContext) -> Mutex<IoEngine> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::File::create(tmp.path())
            .unwrap()
            .set_len(fs.ag_blocks as u64 * fs.block_size as u64)
            .unwrap();
        Mutex::new(IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap())
    }

    #[test]
    fn finalize_duplicates_commits_multi_and_warns_when_no_owner_identified() {
        let mut fs = minimal_ctx(true);
        fs.ag_count = 1;
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        map.lock().unwrap().set(100, 8, BlockState::Inuse);
        let dup = DupExtentSet::new();
        dup.add_range(0, 100, 8);
        let slab = RmapSlab::new();
        let inode_trees = vec![InodeTree::new()];
        let engine = test_engine(&fs);
        let ctx = RepairContext::default();
        let mut report = PhaseReport::new("test");

        // No rmap records were pushed for this range, so no owner can
        // be identified to zap — the range is left MULTI rather than
        // guessed free.
        finalize_duplicates(&ctx, &mut report, &engine, &fs, &map, &dup, &slab, &inode_trees, 0, false)
            .unwrap();

        assert_eq!(map.lock().unwrap().get(100, 8).unwrap().0, BlockState::Multi);
        assert!(report.total_errors() > 0);
    }

    #[test]
    fn finalize_duplicates_suppresses_warning_for_reflink_written_share() {
        let mut fs = minimal_ctx(true);
        fs.ag_count = 1;
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        map.lock().unwrap().set(100, 8, BlockState::Inuse);
        let dup = DupExtentSet::new();
        dup.add_range(0, 100, 8);
        let slab = RmapSlab::new();
        let inode_trees = vec![InodeTree::new()];
        let engine = test_engine(&fs);
        let ctx = RepairContext::default();
        let mut report = PhaseReport::new("test");

        finalize_duplicates(&ctx, &mut report, &engine, &fs, &map, &dup, &slab, &inode_trees, 0, true)
            .unwrap();

        assert_eq!(map.lock().unwrap().get(100, 8).unwrap().0, BlockState::Multi);
        assert_eq!(report.total_errors(), 0);
    }

    #[test]
    fn finalize_duplicates_zaps_both_owners_and_frees_the_block_on_non_reflink_fs() {
        let mut fs = minimal_ctx(true);
        fs.ag_count = 1;
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        map.lock().unwrap().set(100, 8, BlockState::Inuse);
        let dup = DupExtentSet::new();
        dup.add_range(0, 100, 8);

        let owner_a = fs.agino_to_ino(0, 200);
        let owner_b = fs.agino_to_ino(0, 264);
        let slab = RmapSlab::new();
        slab.push(RmapRecord {
            agno: 0,
            start_block: 100,
            length: 8,
            owner: OwnerKind::Inode(owner_a),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });
        slab.push(RmapRecord {
            agno: 0,
            start_block: 100,
            length: 8,
            owner: OwnerKind::Inode(owner_b),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        });

        let inode_trees = vec![InodeTree::new()];
        inode_trees[0].mark_used(200);
        inode_trees[0].mark_confirmed(200);
        inode_trees[0].mark_used(264);
        inode_trees[0].mark_confirmed(264);

        let engine = test_engine(&fs);
        let ctx = RepairContext::default();
        let mut report = PhaseReport::new("test");

        finalize_duplicates(&ctx, &mut report, &engine, &fs, &map, &dup, &slab, &inode_trees, 0, false)
            .unwrap();

        assert_eq!(map.lock().unwrap().get(100, 8).unwrap().0, BlockState::Free);
        assert!(!inode_trees[0].find(200).unwrap().confirmed);
        assert!(!inode_trees[0].find(264).unwrap().confirmed);
    }

    #[test]
    fn finalize_duplicates_zaps_owner_for_unwritten_share_even_on_reflink_fs() {
        let mut fs = minimal_ctx(true);
        fs.ag_count = 1;
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        map.lock().unwrap().set(100, 8, BlockState::Inuse);
        let dup = DupExtentSet::new();
        dup.add_range(0, 100, 8);

        let owner = fs.agino_to_ino(0, 200);
        let slab = RmapSlab::new();
        slab.push(RmapRecord {
            agno: 0,
            start_block: 100,
            length: 8,
            owner: OwnerKind::Inode(owner),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: true,
            logical_offset: 0,
        });

        let inode_trees = vec![InodeTree::new()];
        inode_trees[0].mark_used(200);
        inode_trees[0].mark_confirmed(200);

        let engine = test_engine(&fs);
        // reflink-capable, but the shared extent is unwritten — always
        // illegal per §4.7, so this must still warn and zap.
        let ctx = RepairContext::default();
        let mut report = PhaseReport::new("test");

        finalize_duplicates(&ctx, &mut report, &engine, &fs, &map, &dup, &slab, &inode_trees, 0, true)
            .unwrap();

        assert!(report.total_errors() > 0);
        assert_eq!(map.lock().unwrap().get(100, 8).unwrap().0, BlockState::Free);
        assert!(!inode_trees[0].find(200).unwrap().confirmed);
    }

    #[test]
    fn run_is_a_noop_without_rmapbt_support() {
        let fs = {
            let mut fs = minimal_ctx(true);
            fs.ag_count = 1;
            fs
        };
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::File::create(tmp.path())
            .unwrap()
            .set_len(fs.ag_blocks as u64 * fs.block_size as u64)
            .unwrap();
        let engine = Mutex::new(IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap());
        let state = RepairState::new(&fs, 4);
        let ctx = RepairContext::default();

        // AGF/AGI are unreadable (all-zero image), so seeding fails per-AG
        // and is recorded as an aborted AG rather than propagating — the
        // rmapbt diff step is still skipped outright since `has_rmapbt`
        // is false on this fixture.
        let outcome = run(&ctx, &fs, &engine, &state).unwrap();
        assert!(outcome.ags_needing_rmap_rebuild.is_empty());
    }
}
