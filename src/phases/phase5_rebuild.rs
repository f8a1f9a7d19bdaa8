//! Phase 5: btree reconstruction (§4.12).
//!
//! Rewrites each AG's free-space, inode-allocation, reverse-map and
//! refcount btrees from the incore state phases 3-4 established, and
//! patches the AGF/AGI counters that describe them. Scope limitation
//! (see DESIGN.md): only single-level (leaf-only) trees are rebuilt —
//! an AG whose record count overflows one block is reported as a
//! resource-exhaustion error rather than grown into a multi-level
//! tree, since incremental btree-split logic is substantial and out
//! of scope for this pass.

use std::sync::Mutex;

use crate::context::RepairContext;
use crate::diag::{Correction, PhaseReport};
use crate::error::{ErrorKind, RepairError};
use crate::format::ag::{AgfInfo, AgiInfo, XfsAgf, XfsAgi};
use crate::format::btree::{
    leaf_header_size, write_leaf_header, BNOBT_SHAPE, CNTBT_SHAPE, INOBT_SHAPE, RMAPBT_SHAPE,
    REFCOUNTBT_SHAPE,
};
use crate::format::rmap::flags as rmap_flags;
use crate::format::superblock::FsContext;
use crate::incore::block_state::BlockState;
use crate::incore::rmap_slab::{OwnerKind, RmapRecord};
use crate::io::engine::IoEngine;
use crate::io::reader::{IoPhase, IoReader};
use crate::phases::phase4_refcount::expected_refcounts;
use crate::phases::RepairState;
use crate::worker_pool;

const HDR_READ_LEN: usize = 512;

pub struct Phase5Outcome {
    pub report: PhaseReport,
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    frozen_rmap: &[RmapRecord],
    ags_needing_rmap_rebuild: &[u32],
    ags_needing_refcount_rebuild: &[u32],
) -> Result<Phase5Outcome, RepairError> {
    let agnos: Vec<u32> = (0..fs.ag_count).collect();
    let reports = worker_pool::map(ctx, agnos, |agno| {
        rebuild_ag(
            ctx,
            fs,
            engine,
            state,
            frozen_rmap,
            ags_needing_rmap_rebuild.contains(&agno),
            ags_needing_refcount_rebuild.contains(&agno),
            agno,
        )
    });

    let mut report = PhaseReport::new("rebuild");
    for r in reports {
        report.merge(r);
    }
    Ok(Phase5Outcome { report })
}

#[allow(clippy::too_many_arguments)]
fn rebuild_ag(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    frozen_rmap: &[RmapRecord],
    rebuild_rmap: bool,
    rebuild_refcount: bool,
    agno: u32,
) -> PhaseReport {
    let mut report = PhaseReport::new("rebuild");
    if let Err(e) = rebuild_ag_inner(
        ctx,
        fs,
        engine,
        state,
        frozen_rmap,
        rebuild_rmap,
        rebuild_refcount,
        agno,
        &mut report,
    ) {
        report.bump(e.kind());
        report.record(Correction::new("ag-rebuild-aborted", ctx.dry_run).ag(agno));
    }
    report
}

#[allow(clippy::too_many_arguments)]
fn rebuild_ag_inner(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    frozen_rmap: &[RmapRecord],
    rebuild_rmap: bool,
    rebuild_refcount: bool,
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    rebuild_free_space_btrees(ctx, fs, engine, state, agno, report)?;
    rebuild_inode_btree(ctx, fs, engine, state, agno, report)?;

    if rebuild_rmap {
        rebuild_rmap_btree(ctx, fs, engine, frozen_rmap, agno, report)?;
    }
    if rebuild_refcount {
        rebuild_refcount_btree(ctx, fs, engine, frozen_rmap, agno, report)?;
    }

    Ok(())
}

fn leaf_capacity(fs: &FsContext, rec_size: usize) -> usize {
    let hdr = leaf_header_size(fs.version);
    (fs.block_size as usize).saturating_sub(hdr) / rec_size
}

/// Write `records` (already serialized, `rec_size` bytes apiece) as a
/// single leaf block at `root_block`, and return the numrecs written.
/// Errors with `ResourceExhaustion` if they don't fit in one block.
fn write_leaf(
    fs: &FsContext,
    engine: &mut IoEngine,
    agno: u32,
    root_block: u32,
    magic_v5: u32,
    rec_size: usize,
    records: &[Vec<u8>],
) -> Result<u16, RepairError> {
    let hdr = leaf_header_size(fs.version);
    let capacity = leaf_capacity(fs, rec_size);
    if records.len() > capacity {
        return Err(RepairError::ResourceExhaustion("rebuilt btree overflows a single leaf block"));
    }
    if root_block == 0 {
        return Err(RepairError::Structural("rebuild: btree has no root block to rewrite"));
    }

    let mut buf = vec![0u8; fs.block_size as usize];
    write_leaf_header(&mut buf, fs.version, magic_v5, records.len() as u16);
    for (i, rec) in records.iter().enumerate() {
        let off = hdr + i * rec_size;
        buf[off..off + rec_size].copy_from_slice(rec);
    }

    engine.write_at(fs.ag_block_to_byte(agno, root_block), &buf)?;
    Ok(records.len() as u16)
}

fn read_agf(fs: &FsContext, engine: &mut IoEngine, agno: u32) -> Result<(AgfInfo, Vec<u8>), RepairError> {
    let offset = fs.agf_byte_offset(agno);
    let buf = engine.read_at(offset, HDR_READ_LEN, IoPhase::Agf)?.to_vec();
    let agf = AgfInfo::from_buf(&buf, agno, fs.version)?;
    Ok((agf, buf))
}

fn read_agi(fs: &FsContext, engine: &mut IoEngine, agno: u32) -> Result<(AgiInfo, Vec<u8>), RepairError> {
    let offset = fs.agi_byte_offset(agno);
    let buf = engine.read_at(offset, HDR_READ_LEN, IoPhase::Agi)?.to_vec();
    let agi = AgiInfo::from_buf(&buf, agno, fs.version)?;
    Ok((agi, buf))
}

fn patch_u32(buf: &mut [u8], field_offset: usize, value: u32) {
    buf[field_offset..field_offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn rebuild_free_space_btrees(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let Some(block_state) = state.block_state.get(agno as usize) else {
        return Err(RepairError::Structural("rebuild: AG out of range"));
    };

    let runs: Vec<(u64, u64)> = {
        let map = block_state.lock().unwrap();
        map.iter_runs()
            .filter(|(_, _, s)| s.is_free_like())
            .map(|(start, len, _)| (start, len))
            .collect()
    };

    let freeblks: u64 = runs.iter().map(|(_, len)| len).sum();
    let longest = runs.iter().map(|(_, len)| *len).max().unwrap_or(0);

    let mut eng = engine.lock().unwrap();
    let (agf, mut agf_buf) = read_agf(fs, &mut eng, agno)?;

    if agf.freeblks as u64 == freeblks && agf.longest as u64 == longest {
        return Ok(());
    }
    report.bump(ErrorKind::LogicalInconsistency);
    report.record(Correction::new("free-space-accounting-mismatch", ctx.dry_run).ag(agno));
    if ctx.dry_run {
        return Ok(());
    }

    let mut by_block: Vec<(u64, u64)> = runs.clone();
    by_block.sort_by_key(|(start, _)| *start);
    let bnobt_records: Vec<Vec<u8>> = by_block
        .iter()
        .map(|(start, len)| {
            let mut b = vec![0u8; 8];
            b[0..4].copy_from_slice(&(*start as u32).to_be_bytes());
            b[4..8].copy_from_slice(&(*len as u32).to_be_bytes());
            b
        })
        .collect();
    write_leaf(fs, &mut eng, agno, agf.bnobt_root, BNOBT_SHAPE.magic_v5, 8, &bnobt_records)?;

    let mut by_len = runs;
    by_len.sort_by_key(|(_, len)| *len);
    let cntbt_records: Vec<Vec<u8>> = by_len
        .iter()
        .map(|(start, len)| {
            let mut b = vec![0u8; 8];
            b[0..4].copy_from_slice(&(*start as u32).to_be_bytes());
            b[4..8].copy_from_slice(&(*len as u32).to_be_bytes());
            b
        })
        .collect();
    write_leaf(fs, &mut eng, agno, agf.cntbt_root, CNTBT_SHAPE.magic_v5, 8, &cntbt_records)?;

    patch_u32(&mut agf_buf, std::mem::offset_of!(XfsAgf, agf_freeblks), freeblks as u32);
    patch_u32(&mut agf_buf, std::mem::offset_of!(XfsAgf, agf_longest), longest as u32);
    patch_u32(&mut agf_buf, std::mem::offset_of!(XfsAgf, agf_levels) + 0, 1);
    patch_u32(&mut agf_buf, std::mem::offset_of!(XfsAgf, agf_levels) + 4, 1);
    eng.write_at(fs.agf_byte_offset(agno), &agf_buf)?;

    Ok(())
}

fn rebuild_inode_btree(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    state: &RepairState,
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let Some(inode_tree) = state.inode_trees.get(agno as usize) else {
        return Err(RepairError::Structural("rebuild: AG out of range"));
    };

    let chunks = inode_tree.iter_chunks();
    let count: u32 = chunks.iter().map(|(_, alloc, _)| alloc.count_ones()).sum();
    let freecount: u32 = chunks.iter().map(|(_, _, free)| free.count_ones()).sum();

    let mut eng = engine.lock().unwrap();
    let (agi, mut agi_buf) = read_agi(fs, &mut eng, agno)?;

    if agi.count == count && agi.freecount == freecount {
        return Ok(());
    }
    report.bump(ErrorKind::LogicalInconsistency);
    report.record(Correction::new("inode-btree-accounting-mismatch", ctx.dry_run).ag(agno));
    if ctx.dry_run {
        return Ok(());
    }

    let records: Vec<Vec<u8>> = chunks
        .iter()
        .map(|(start_ino, _, free_mask)| {
            let mut b = vec![0u8; 16];
            b[0..4].copy_from_slice(&start_ino.to_be_bytes());
            b[4..6].copy_from_slice(&0u16.to_be_bytes()); // holemask: no sparse chunks
            b[6] = 64;
            b[7] = free_mask.count_ones() as u8;
            b[8..16].copy_from_slice(&free_mask.to_be_bytes());
            b
        })
        .collect();
    write_leaf(fs, &mut eng, agno, agi.inobt_root, INOBT_SHAPE.magic_v5, 16, &records)?;

    patch_u32(&mut agi_buf, std::mem::offset_of!(XfsAgi, agi_count), count);
    patch_u32(&mut agi_buf, std::mem::offset_of!(XfsAgi, agi_freecount), freecount);
    patch_u32(&mut agi_buf, std::mem::offset_of!(XfsAgi, agi_level), 1);
    eng.write_at(fs.agi_byte_offset(agno), &agi_buf)?;

    Ok(())
}

fn encode_owner(owner: OwnerKind) -> u64 {
    match owner {
        OwnerKind::Inode(ino) => ino,
        OwnerKind::Static(s) => s,
    }
}

fn rebuild_rmap_btree(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    frozen_rmap: &[RmapRecord],
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let mut eng = engine.lock().unwrap();
    let (agf, mut agf_buf) = read_agf(fs, &mut eng, agno)?;

    if ctx.dry_run {
        report.record(Correction::new("rmap-btree-rebuilt", true).ag(agno));
        return Ok(());
    }

    let mut records: Vec<&RmapRecord> = frozen_rmap.iter().filter(|r| r.agno == agno).collect();
    records.sort_by_key(|r| r.start_block);

    let serialized: Vec<Vec<u8>> = records
        .iter()
        .map(|r| {
            let mut b = vec![0u8; 24];
            b[0..4].copy_from_slice(&r.start_block.to_be_bytes());
            b[4..8].copy_from_slice(&r.length.to_be_bytes());
            b[8..16].copy_from_slice(&encode_owner(r.owner).to_be_bytes());
            let mut raw = r.logical_offset & 0x003F_FFFF_FFFF_FFFF;
            if r.is_attr_fork {
                raw |= rmap_flags::ATTR_FORK;
            }
            if r.is_bmbt_block {
                raw |= rmap_flags::BMBT_BLOCK;
            }
            if r.is_unwritten {
                raw |= rmap_flags::UNWRITTEN;
            }
            b[16..24].copy_from_slice(&raw.to_be_bytes());
            b
        })
        .collect();

    write_leaf(fs, &mut eng, agno, agf.rmap_root, RMAPBT_SHAPE.magic_v5, 24, &serialized)?;
    patch_u32(&mut agf_buf, std::mem::offset_of!(XfsAgf, agf_rmap_level), 1);
    eng.write_at(fs.agf_byte_offset(agno), &agf_buf)?;

    report.bump(ErrorKind::StructuralCorruption);
    report.record(Correction::new("rmap-btree-rebuilt", ctx.dry_run).ag(agno));
    Ok(())
}

fn rebuild_refcount_btree(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    frozen_rmap: &[RmapRecord],
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let mut eng = engine.lock().unwrap();
    let (agf, mut agf_buf) = read_agf(fs, &mut eng, agno)?;

    if ctx.dry_run {
        report.record(Correction::new("refcount-btree-rebuilt", true).ag(agno));
        return Ok(());
    }

    let runs = expected_refcounts(frozen_rmap, agno);
    let serialized: Vec<Vec<u8>> = runs
        .iter()
        .map(|(start, len, refcount)| {
            let mut b = vec![0u8; 12];
            b[0..4].copy_from_slice(&start.to_be_bytes());
            b[4..8].copy_from_slice(&len.to_be_bytes());
            b[8..12].copy_from_slice(&refcount.to_be_bytes());
            b
        })
        .collect();

    write_leaf(fs, &mut eng, agno, agf.refcount_root, REFCOUNTBT_SHAPE.magic_v5, 12, &serialized)?;
    patch_u32(&mut agf_buf, std::mem::offset_of!(XfsAgf, agf_refcount_level), 1);
    eng.write_at(fs.agf_byte_offset(agno), &agf_buf)?;

    report.bump(ErrorKind::StructuralCorruption);
    report.record(Correction::new("refcount-btree-rebuilt", ctx.dry_run).ag(agno));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incore::block_state::BlockStateMap;

    #[test]
    fn leaf_capacity_matches_block_layout() {
        let fs = crate::format::superblock::tests::minimal_ctx(true);
        let cap = leaf_capacity(&fs, 8);
        assert!(cap > 0);
        assert!(cap * 8 + leaf_header_size(fs.version) <= fs.block_size as usize);
    }

    #[test]
    fn rebuild_free_space_is_a_noop_when_agf_already_matches() {
        let fs = crate::format::superblock::tests::minimal_ctx(true);
        let map = Mutex::new(BlockStateMap::new_ag(0, 1024, 4));
        map.lock().unwrap().set(4, 1020, BlockState::Free);
        // No engine access happens unless mismatched against the AGF,
        // so exercising the free-run computation alone is sufficient
        // here; the full read/patch path is covered via phase4/5
        // integration through the orchestrator.
        let runs: Vec<(u64, u64)> = {
            let g = map.lock().unwrap();
            g.iter_runs().filter(|(_, _, s)| s.is_free_like()).map(|(s, l, _)| (s, l)).collect()
        };
        assert_eq!(runs, vec![(4, 1020)]);
        let _ = fs;
    }
}
