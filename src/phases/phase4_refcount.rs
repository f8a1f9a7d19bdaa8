//! Phase 4, refcount half (§4.11).
//!
//! Consumes the reverse-map slab phase 4's rmap half already froze:
//! for each AG, sweep the data-fork owner ranges to derive the
//! expected shared-block refcount runs, and diff them against the
//! on-disk refcount btree. Like the rmap half, a mismatch only marks
//! the AG for phase 5's rebuild — nothing is rewritten here.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::context::{RepairContext, RuleLabels};
use crate::diag::{Correction, PhaseReport};
use crate::error::{ErrorKind, RepairError};
use crate::format::ag::AgfInfo;
use crate::format::btree::{collect_records, REFCOUNTBT_SHAPE};
use crate::format::refcount::XfsRefcountRec;
use crate::format::superblock::FsContext;
use crate::incore::rmap_slab::RmapRecord;
use crate::io::engine::IoEngine;
use crate::io::reader::{IoPhase, IoReader};
use crate::worker_pool;

const AGF_READ_LEN: usize = 512;

pub struct Phase4RefcountOutcome {
    pub report: PhaseReport,
    /// AGs whose on-disk refcount btree disagrees with the slab-derived
    /// expectation and must be rebuilt by phase 5.
    pub ags_needing_refcount_rebuild: Vec<u32>,
}

pub fn run(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    frozen_rmap: &[RmapRecord],
) -> Result<Phase4RefcountOutcome, RepairError> {
    let mut report = PhaseReport::new("refcount");
    if !fs.has_reflink {
        return Ok(Phase4RefcountOutcome { report, ags_needing_refcount_rebuild: Vec::new() });
    }

    let agnos: Vec<u32> = (0..fs.ag_count).collect();
    let diffs = worker_pool::map(ctx, agnos, |agno| diff_ag(ctx, fs, engine, frozen_rmap, agno));

    let mut ags_needing_refcount_rebuild = Vec::new();
    for (agno, r, dirty) in diffs {
        report.merge(r);
        if dirty {
            ags_needing_refcount_rebuild.push(agno);
        }
    }

    Ok(Phase4RefcountOutcome { report, ags_needing_refcount_rebuild })
}

/// Sweep-line over every data-fork owner range in this AG, producing
/// maximal `(start, length, refcount)` runs wherever two or more
/// owners overlap. Attr-fork and bmbt-block ranges never participate
/// in reflink sharing and are excluded.
pub fn expected_refcounts(frozen: &[RmapRecord], agno: u32) -> Vec<(u32, u32, u32)> {
    let mut events: Vec<(u32, i32)> = Vec::new();
    for r in frozen.iter().filter(|r| r.agno == agno && !r.is_attr_fork && !r.is_bmbt_block) {
        if r.length == 0 {
            continue;
        }
        events.push((r.start_block, 1));
        events.push((r.start_block + r.length, -1));
    }
    events.sort_by_key(|e| e.0);

    let mut result = Vec::new();
    let mut count: i32 = 0;
    let mut prev: Option<u32> = None;
    let mut idx = 0;
    while idx < events.len() {
        let pos = events[idx].0;
        if let Some(prev_pos) = prev {
            if prev_pos != pos && count >= 2 {
                result.push((prev_pos, pos - prev_pos, count as u32));
            }
        }
        while idx < events.len() && events[idx].0 == pos {
            count += events[idx].1;
            idx += 1;
        }
        prev = Some(pos);
    }
    result
}

fn diff_ag(
    ctx: &RepairContext,
    fs: &FsContext,
    engine: &Mutex<IoEngine>,
    frozen: &[RmapRecord],
    agno: u32,
) -> (u32, PhaseReport, bool) {
    let mut report = PhaseReport::new("refcount");
    match diff_ag_inner(ctx, fs, engine, frozen, agno, &mut report) {
        Ok(dirty) => (agno, report, dirty),
        Err(e) => {
            report.bump(e.kind());
            report.record(Correction::new("ag-refcount-diff-aborted", ctx.dry_run).ag(agno));
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
        eng.read_at(fs.agf_byte_offset(agno), AGF_READ_LEN, IoPhase::Agf)?.to_vec()
    };
    let agf = AgfInfo::from_buf(&agf_buf, agno, fs.version)?;
    if agf.refcount_root == 0 {
        return Ok(false);
    }

    let ondisk: Vec<XfsRefcountRec> = {
        let mut eng = engine.lock().unwrap();
        collect_records::<IoEngine, XfsRefcountRec>(
            &mut eng,
            fs,
            agno,
            agf.refcount_root,
            agf.refcount_level,
            REFCOUNTBT_SHAPE,
        )?
    };
    let observed: HashSet<(u32, u32, u32)> = ondisk
        .iter()
        .map(|r| {
            let e = r.unpack();
            (e.start_block, e.block_count, e.refcount)
        })
        .collect();

    let expected: HashSet<(u32, u32, u32)> = expected_refcounts(frozen, agno).into_iter().collect();

    if expected != observed {
        report.bump(ErrorKind::StructuralCorruption);
        report.record(Correction::new(RuleLabels::REFCOUNT_MISMATCH, ctx.dry_run).ag(agno));
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incore::rmap_slab::OwnerKind;

    fn rec(agno: u32, start: u32, len: u32, ino: u64) -> RmapRecord {
        RmapRecord {
            agno,
            start_block: start,
            length: len,
            owner: OwnerKind::Inode(ino),
            is_attr_fork: false,
            is_bmbt_block: false,
            is_unwritten: false,
            logical_offset: 0,
        }
    }

    #[test]
    fn single_owner_produces_no_refcount_run() {
        let frozen = vec![rec(0, 100, 8, 50)];
        assert!(expected_refcounts(&frozen, 0).is_empty());
    }

    #[test]
    fn two_owners_sharing_a_range_produce_a_refcount_two_run() {
        let frozen = vec![rec(0, 100, 8, 50), rec(0, 100, 8, 60)];
        let runs = expected_refcounts(&frozen, 0);
        assert_eq!(runs, vec![(100, 8, 2)]);
    }

    #[test]
    fn partial_overlap_splits_into_distinct_runs() {
        // owner 50 covers [100,108), owner 60 covers [104,112):
        // [100,104) refcount 1 (excluded), [104,108) refcount 2, [108,112) refcount 1 (excluded).
        let frozen = vec![rec(0, 100, 8, 50), rec(0, 104, 8, 60)];
        let runs = expected_refcounts(&frozen, 0);
        assert_eq!(runs, vec![(104, 4, 2)]);
    }

    #[test]
    fn attr_fork_ranges_are_excluded_from_sharing() {
        let mut a = rec(0, 100, 8, 50);
        a.is_attr_fork = true;
        let frozen = vec![a, rec(0, 100, 8, 60)];
        assert!(expected_refcounts(&frozen, 0).is_empty());
    }

    #[test]
    fn run_skips_refcount_diff_when_filesystem_is_not_reflink_capable() {
        let fs = crate::format::superblock::tests::minimal_ctx(true);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::File::create(tmp.path())
            .unwrap()
            .set_len(fs.ag_blocks as u64 * fs.block_size as u64)
            .unwrap();
        let engine = Mutex::new(IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap());
        let ctx = RepairContext::default();

        let outcome = run(&ctx, &fs, &engine, &[]).unwrap();
        assert!(outcome.ags_needing_refcount_rebuild.is_empty());
        assert_eq!(outcome.report.total_errors(), 0);
    }
}
