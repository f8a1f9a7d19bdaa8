//! Phase 3: inode discovery, two passes per AG (§4.5).
//!
//! Each AG is handed to a worker: clear (or, read-only, just record)
//! the AGI unlinked-list buckets, walk the inode-allocation btree and
//! run the Dinode Processor (§4.6, [`crate::phases::dinode`]) over
//! every allocated record, then retry any inode whose first read
//! failed transiently until the retry pool drains or
//! `ctx.max_uncertain_passes` is exhausted.
//!
//! The data device only exposes one [`IoEngine`], so the per-AG
//! parallelism the worker pool provides is over the CPU-bound dinode
//! logic; actual device reads/writes serialize on a shared mutex. That
//! mutex is the "I/O through the Buffer Service" suspension point §5
//! calls out — workers never hold it across anything but a single
//! buffer fetch or inode processing call.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::context::RepairContext;
use crate::diag::{Correction, PhaseReport};
use crate::error::{ErrorKind, RepairError};
use crate::format::ag::{AgiInfo, XfsAgi};
use crate::format::btree::{collect_records, XfsInobtRec, INOBT_SHAPE};
use crate::format::inode::parse_inode_core;
use crate::format::superblock::{FormatVersion, FsContext};
use crate::io::engine::IoEngine;
use crate::io::reader::{IoPhase, IoReader};
use crate::io::txn::BufferCache;
use crate::phases::dinode::process_dinode;
use crate::phases::RepairState;
use crate::worker_pool;

const AGI_READ_LEN: usize = 512;

pub struct Phase3Outcome {
    pub report: PhaseReport,
}

pub fn run(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    cache: &BufferCache,
    state: &RepairState,
) -> Result<Phase3Outcome, RepairError> {
    let agnos: Vec<u32> = (0..fs.ag_count).collect();
    let reports = worker_pool::map(ctx, agnos, |agno| process_ag(ctx, fs, engine, cache, state, agno));

    let mut report = PhaseReport::new("inodes");
    for r in reports {
        report.merge(r);
    }
    Ok(Phase3Outcome { report })
}

fn process_ag(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    cache: &BufferCache,
    state: &RepairState,
    agno: u32,
) -> PhaseReport {
    let mut report = PhaseReport::new("inodes");
    if let Err(e) = process_ag_inner(ctx, fs, engine, cache, state, agno, &mut report) {
        report.bump(e.kind());
        report.record(Correction::new("ag-inode-discovery-aborted", ctx.dry_run).ag(agno));
    }
    report
}

fn process_ag_inner(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    cache: &BufferCache,
    state: &RepairState,
    agno: u32,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let agi = read_agi(fs, engine, agno)?;

    clear_agi_unlinked(ctx, fs, engine, agno, &agi, report)?;

    let inobt_records: Vec<XfsInobtRec> = {
        let mut eng = engine.lock().unwrap();
        collect_records::<IoEngine, XfsInobtRec>(&mut eng, fs, agno, agi.inobt_root, agi.inobt_level, INOBT_SHAPE)?
    };

    let mut transient_failures = Vec::new();
    let mut rediscovery_attempted: HashSet<u32> = HashSet::new();

    for rec in &inobt_records {
        for bit in 0..64u32 {
            if !rec.is_allocated(bit) {
                continue;
            }
            let agino = rec.start_ino() + bit;
            let ino = fs.agino_to_ino(agno, agino);
            match process_one_inode(ctx, fs, engine, cache, state, report, ino) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::TransientIo => transient_failures.push(ino),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.bump(e.kind());
                    report.record(Correction::new("inode-processing-error", ctx.dry_run).inode(ino).ag(agno));
                }
            }
        }
    }

    // §4.5 step 3: reprocess the "uncertain inodes" pool. Two kinds of
    // uncertainty feed it: reads that failed transiently on the first
    // attempt, and agino slots a directory entry referenced
    // (`InodeTree::add_inode_ref`, populated while dinode processing
    // scans directory contents in this and every other AG) that the
    // inobt walk above never marked allocated — evidence of a cluster a
    // corrupt or incomplete inobt leaf missed. Both are retried until
    // each pass finds nothing new, since recovering one directory can
    // surface further cross-references to rediscover.
    let mut pass = 0u32;
    while pass < ctx.max_uncertain_passes {
        pass += 1;
        let mut still_failing = Vec::new();
        let mut progressed = !transient_failures.is_empty();
        for ino in transient_failures.drain(..) {
            match process_one_inode(ctx, fs, engine, cache, state, report, ino) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::TransientIo => still_failing.push(ino),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.bump(e.kind());
                    report.record(Correction::new("inode-processing-error", ctx.dry_run).inode(ino).ag(agno));
                }
            }
        }
        transient_failures = still_failing;

        let Some(tree) = state.inode_trees.get(agno as usize) else {
            break;
        };
        let candidates: Vec<u32> = tree
            .referenced_unallocated()
            .into_iter()
            .filter(|agino| rediscovery_attempted.insert(*agino))
            .collect();
        for rediscovered_agino in candidates {
            let ino = fs.agino_to_ino(agno, rediscovered_agino);
            if !looks_like_inode(fs, engine, ino) {
                // Not a real inode core at this location — a stray
                // reference (e.g. a dangling directory entry) rather
                // than a missed cluster. Leave the block alone; phase 6
                // catches the dangling entry from the other end.
                continue;
            }
            progressed = true;
            match process_one_inode(ctx, fs, engine, cache, state, report, ino) {
                Ok(()) => {
                    report.bump(ErrorKind::LogicalInconsistency);
                    report.record(
                        Correction::new("inode-cluster-rediscovered", ctx.dry_run).inode(ino).ag(agno),
                    );
                }
                Err(e) if e.kind() == ErrorKind::TransientIo => transient_failures.push(ino),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.bump(e.kind());
                    report.record(Correction::new("inode-processing-error", ctx.dry_run).inode(ino).ag(agno));
                }
            }
        }

        if !progressed {
            break;
        }
    }

    for ino in transient_failures {
        report.bump(ErrorKind::TransientIo);
        report.record(Correction::new("inode-unreadable-after-retries", ctx.dry_run).inode(ino).ag(agno));
    }

    Ok(())
}

/// Cheap pre-check for a §4.5 step 3 rediscovery candidate: does the
/// inode core at `ino`'s location parse at all? Used to decide whether
/// a block a directory entry points at is worth running the full
/// Dinode Processor (and its zero_dinode fallback) over, versus a
/// stray reference into space that was never an inode chunk.
fn looks_like_inode(fs: &FsContext, engine: &Mutex<IoEngine>, ino: u64) -> bool {
    let (block_byte, within) = fs.ino_to_disk_position(ino);
    let mut eng = engine.lock().unwrap();
    let Ok(buf) = eng.read_at(block_byte, fs.block_size as usize, IoPhase::InodeChunks) else {
        return false;
    };
    let end = (within + fs.inode_size as usize).min(buf.len());
    if within >= end {
        return false;
    }
    let is_v5 = fs.version == FormatVersion::V5;
    parse_inode_core(&buf[within..end], ino, is_v5, fs.has_nrext64, fs.inode_size).is_ok()
}

fn process_one_inode(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    cache: &BufferCache,
    state: &RepairState,
    report: &mut PhaseReport,
    ino: u64,
) -> Result<(), RepairError> {
    let (block_byte, within) = fs.ino_to_disk_position(ino);
    let mut eng = engine.lock().unwrap();
    let buffer = cache.read(&mut eng, IoPhase::InodeChunks, block_byte, fs.block_size as usize, None)?;

    let outcome = buffer.with_bytes_mut(|data| {
        let end = (within + fs.inode_size as usize).min(data.len());
        if within >= end {
            return Err(RepairError::Structural("inode offset out of block bounds"));
        }
        process_dinode(ctx, fs, &mut eng, cache, state, report, &mut data[within..end], ino)
    })?;
    drop(eng);

    if outcome.bytes_dirty && !ctx.dry_run {
        cache.mark_dirty(&buffer);
    }
    cache.release(&buffer);

    if outcome.is_dir {
        state.dir_graph.set_children(ino, outcome.dir_children);
    }

    Ok(())
}

fn read_agi(fs: &FsContext, engine: &Mutex<IoEngine>, agno: u32) -> Result<AgiInfo, RepairError> {
    use crate::io::reader::IoReader;
    let mut eng = engine.lock().unwrap();
    let buf = eng.read_at(fs.agi_byte_offset(agno), AGI_READ_LEN, IoPhase::Agi)?.to_vec();
    AgiInfo::from_buf(&buf, agno, fs.version)
}

/// §4.5 step 1: clear every non-empty unlinked-list bucket (or, in
/// dry-run/read-only mode, just log that it was left for a later run).
/// This clears the bucket's head pointer only — it does not walk and
/// reconcile the deferred-inactivation chain those buckets name, which
/// is out of scope here (see DESIGN.md).
fn clear_agi_unlinked(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    agno: u32,
    agi: &AgiInfo,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    let buckets: Vec<usize> = agi.non_empty_unlinked_buckets().map(|(i, _)| i).collect();
    if buckets.is_empty() {
        return Ok(());
    }

    report.bump(ErrorKind::LogicalInconsistency);
    report.record(Correction::new("agi-unlinked-bucket-nonempty", ctx.dry_run).ag(agno));

    if ctx.dry_run {
        return Ok(());
    }

    use crate::io::reader::IoReader;
    let offset = fs.agi_byte_offset(agno);
    let mut eng = engine.lock().unwrap();
    let mut buf = eng.read_at(offset, AGI_READ_LEN, IoPhase::Agi)?.to_vec();
    for i in buckets {
        let field_off = std::mem::offset_of!(XfsAgi, agi_unlinked) + i * 4;
        if field_off + 4 > buf.len() {
            continue;
        }
        buf[field_off..field_off + 4].copy_from_slice(&crate::format::ag::NULL_AGINO.to_be_bytes());
    }
    eng.write_at(offset, &buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::superblock::tests::minimal_ctx;
    use std::mem::offset_of;

    fn write_minimal_image(path: &std::path::Path, fs: &FsContext, agno: u32) {
        use std::io::Write;
        use std::os::unix::fs::FileExt;

        let block_size = fs.block_size as usize;
        let total = fs.ag_count as u64 * fs.ag_blocks as u64 * fs.block_size as u64;
        let mut f = std::fs::File::create(path).unwrap();
        f.set_len(total).unwrap();

        // AGI: v5, one inobt leaf with a single allocated record at
        // the AG's first inode-capable block, count=1.
        let mut agi = vec![0u8; block_size];
        agi[0..4].copy_from_slice(&0x5841_4749u32.to_be_bytes());
        agi[4..8].copy_from_slice(&4u32.to_be_bytes()); // versionnum
        agi[8..12].copy_from_slice(&agno.to_be_bytes()); // seqno
        agi[12..16].copy_from_slice(&fs.ag_blocks.to_be_bytes()); // length
        agi[16..20].copy_from_slice(&1u32.to_be_bytes()); // count
        agi[20..24].copy_from_slice(&10u32.to_be_bytes()); // root (agblock 10)
        agi[24..28].copy_from_slice(&1u32.to_be_bytes()); // level
        agi[28..32].copy_from_slice(&0u32.to_be_bytes()); // freecount
        for i in 0..64 {
            let off = offset_of!(XfsAgi, agi_unlinked) + i * 4;
            agi[off..off + 4].copy_from_slice(&crate::format::ag::NULL_AGINO.to_be_bytes());
        }
        f.write_all_at(&agi, fs.agi_byte_offset(agno)).unwrap();

        // Inobt leaf block at agblock 10, level 0, one record: startino=8
        // (agblock 1, clear of the AG-header block that holds the AGI),
        // count=1, allocated bit 0 only (ir_free bit0 clear = allocated).
        let mut leaf = vec![0u8; block_size];
        leaf[0..4].copy_from_slice(&0x4941_4233u32.to_be_bytes()); // IAB3
        leaf[4..6].copy_from_slice(&0u16.to_be_bytes()); // level
        leaf[6..8].copy_from_slice(&1u16.to_be_bytes()); // numrecs
        let hdr = 56usize; // V5 short block header size
        leaf[hdr..hdr + 4].copy_from_slice(&8u32.to_be_bytes()); // ir_startino
        leaf[hdr + 4..hdr + 6].copy_from_slice(&0u16.to_be_bytes()); // holemask
        leaf[hdr + 6] = 1; // ir_count
        leaf[hdr + 7] = 63; // ir_freecount
        leaf[hdr + 8..hdr + 16].copy_from_slice(&(!1u64).to_be_bytes()); // ir_free: bit0 clear
        let leaf_offset = fs.ag_block_to_byte(agno, 10);
        f.write_all_at(&leaf, leaf_offset).unwrap();

        // The one allocated inode (agino 8) as a shortform directory.
        let ino = fs.agino_to_ino(agno, 8);
        let mut dinode = vec![0u8; fs.inode_size as usize];
        dinode[0..2].copy_from_slice(&0x494eu16.to_be_bytes());
        dinode[2..4].copy_from_slice(&crate::format::inode::S_IFDIR.to_be_bytes());
        dinode[4] = 3; // version
        dinode[5] = crate::format::inode::XFS_DINODE_FMT_LOCAL;
        let nlink_off = offset_of!(crate::format::inode::XfsDinodeCore, di_nlink);
        dinode[nlink_off..nlink_off + 4].copy_from_slice(&2u32.to_be_bytes());
        let fork_off = 176usize;
        dinode[fork_off] = 0;
        dinode[fork_off + 1] = 0;
        dinode[fork_off + 2..fork_off + 6].copy_from_slice(&ino.to_be_bytes()[4..8]);
        let tail_off = 96usize;
        let di_ino_off = tail_off + offset_of!(crate::format::inode::XfsDinodeV5Tail, di_ino);
        dinode[di_ino_off..di_ino_off + 8].copy_from_slice(&ino.to_be_bytes());
        let (block_byte, within) = fs.ino_to_disk_position(ino);
        let mut block = vec![0u8; block_size];
        block[within..within + fs.inode_size as usize].copy_from_slice(&dinode);
        f.write_all_at(&block, block_byte).unwrap();
        f.flush().unwrap();
    }

    fn ctx_for_image() -> FsContext {
        let mut fs = minimal_ctx(true);
        fs.ag_blocks = 256;
        fs.ag_blk_log = 8;
        fs.ag_count = 1;
        fs.dblocks = 256;
        fs.root_ino = fs.agino_to_ino(0, 8);
        fs
    }

    #[test]
    fn discovers_and_confirms_the_one_inode() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fs = ctx_for_image();
        write_minimal_image(tmp.path(), &fs, 0);

        let engine = Mutex::new(IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap());
        let cache = BufferCache::new();
        let state = RepairState::new(&fs, 12);
        let rc = RepairContext::default();

        let outcome = run(&rc, &fs, &engine, &cache, &state).unwrap();

        let ino = fs.agino_to_ino(0, 8);
        let agino = fs.ino_to_agino(ino);
        let slot = state.inode_trees[0].find(agino).unwrap();
        assert!(slot.confirmed);
        assert!(slot.is_dir);
        let _ = outcome;
    }

    fn write_regular_inode(f: &std::fs::File, fs: &FsContext, ino: u64) {
        use std::os::unix::fs::FileExt;

        let mut dinode = vec![0u8; fs.inode_size as usize];
        dinode[0..2].copy_from_slice(&0x494eu16.to_be_bytes());
        dinode[2..4].copy_from_slice(&crate::format::inode::S_IFREG.to_be_bytes());
        dinode[4] = 3; // version
        dinode[5] = crate::format::inode::XFS_DINODE_FMT_EXTENTS;
        let nlink_off = offset_of!(crate::format::inode::XfsDinodeCore, di_nlink);
        dinode[nlink_off..nlink_off + 4].copy_from_slice(&1u32.to_be_bytes());
        let tail_off = 96usize;
        let di_ino_off = tail_off + offset_of!(crate::format::inode::XfsDinodeV5Tail, di_ino);
        dinode[di_ino_off..di_ino_off + 8].copy_from_slice(&ino.to_be_bytes());

        let (block_byte, within) = fs.ino_to_disk_position(ino);
        let mut block = vec![0u8; fs.block_size as usize];
        f.read_exact_at(&mut block, block_byte).unwrap();
        block[within..within + fs.inode_size as usize].copy_from_slice(&dinode);
        f.write_all_at(&block, block_byte).unwrap();
    }

    /// Same image as `write_minimal_image`, but agino 8's directory
    /// also names a second child (agino 16) that the inobt leaf's
    /// allocation bitmap never marks allocated — a cluster only
    /// cross-reference-driven rediscovery can find.
    fn write_image_with_uncataloged_child(path: &std::path::Path, fs: &FsContext) {
        use std::os::unix::fs::FileExt;

        write_minimal_image(path, fs, 0);
        let f = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();

        let dir_ino = fs.agino_to_ino(0, 8);
        let child_ino = fs.agino_to_ino(0, 16);
        write_regular_inode(&f, fs, child_ino);

        let entries = vec![crate::format::dir::DirEntryRecord {
            child_ino,
            name: b"child".to_vec(),
            file_type: 1,
            block_offset: 0,
        }];
        let encoded = crate::format::dir::shortform::encode_shortform_dir(&entries, dir_ino, fs);

        let (block_byte, within) = fs.ino_to_disk_position(dir_ino);
        let mut block = vec![0u8; fs.block_size as usize];
        f.read_exact_at(&mut block, block_byte).unwrap();
        let fork_off = within + 176;
        block[fork_off..fork_off + encoded.len()].copy_from_slice(&encoded);
        f.write_all_at(&block, block_byte).unwrap();
    }

    #[test]
    fn rediscovers_an_uncataloged_inode_referenced_by_a_directory_entry() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fs = ctx_for_image();
        write_image_with_uncataloged_child(tmp.path(), &fs);

        let engine = Mutex::new(IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap());
        let cache = BufferCache::new();
        let state = RepairState::new(&fs, 12);
        let rc = RepairContext::default();

        run(&rc, &fs, &engine, &cache, &state).unwrap();

        let child_ino = fs.agino_to_ino(0, 16);
        let slot = state.inode_trees[0].find(fs.ino_to_agino(child_ino)).unwrap();
        assert!(slot.confirmed);
    }
}
