//! Extent reconciliation (§4.7), shared by the dinode processor
//! (§4.6 step 6/7) and phase 4's duplicate-extent pass. Every extent a
//! fork claims is threaded through here against the per-group
//! block-state map, with the duplicate-extent set and reverse-map slab
//! updated as a side effect.

use crate::context::RepairContext;
use crate::diag::{Correction, PhaseReport};
use crate::error::ErrorKind;
use crate::incore::block_state::{BlockState, BlockStateMap};
use crate::incore::dup_extents::DupExtentSet;
use crate::incore::rmap_slab::{OwnerKind, RmapRecord, RmapSlab};
use std::sync::Mutex;

/// Which fork an extent belongs to — carried through to the reverse-map
/// record so phase 4/phase 10 can tell forks apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Data,
    Attr,
    Cow,
}

/// §4.7 runs in two passes over the lifetime of phase 3/4: the first
/// only collects duplicate ranges (so a later, authoritative decision
/// can be made about who keeps the block); the second commits the
/// `MULTI` transition and emits warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconPass {
    CollectDuplicates,
    Finalize,
}

/// What happened to the extent once reconciled. The caller (dinode
/// processor or phase 4) decides how to react — `ClearInode` means the
/// owning inode must be zapped, since it claims filesystem-reserved
/// space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconOutcome {
    Ok,
    /// Block was already claimed; recorded as a duplicate (pass 1) or
    /// transitioned to MULTI with a warning (pass 2, non-reflink).
    Duplicate,
    /// The extent claims filesystem-reserved metadata space.
    ClearInode,
}

pub struct ReconRequest {
    pub owner_ino: u64,
    pub fork: ForkKind,
    pub logical_offset: u64,
    pub is_unwritten: bool,
    /// Whether the filesystem is reflink-capable — suppresses the
    /// duplicate warning for *written* shared extents (unwritten
    /// shared extents are always illegal, reflink or not).
    pub reflink_capable: bool,
    /// True when the dinode processor is actively zapping a metadata
    /// inode — transitions UNKNOWN/INUSE1 to METADATA instead of INUSE.
    pub zapping_metadata: bool,
}

/// Reconcile one extent — `[ag_block, ag_block+length)` within group
/// `agno` — against the incore block-state map, per §4.7. Iterates the
/// extent in state-map run-sized chunks since a single extent may span
/// multiple existing runs.
#[allow(clippy::too_many_arguments)]
pub fn reconcile_extent(
    ctx: &RepairContext,
    report: &mut PhaseReport,
    block_state: &Mutex<BlockStateMap>,
    dup_extents: &DupExtentSet,
    rmap_slab: Option<&RmapSlab>,
    agno: u32,
    ag_block: u32,
    length: u64,
    req: &ReconRequest,
    pass: ReconPass,
) -> Result<ReconOutcome, crate::error::RepairError> {
    if length == 0 {
        return Ok(ReconOutcome::Ok);
    }

    let mut outcome = ReconOutcome::Ok;
    let mut cursor = ag_block as u64;
    let end = ag_block as u64 + length;
    let mut logical = req.logical_offset;

    while cursor < end {
        let remaining = end - cursor;
        let (state, run_len) = {
            let map = block_state.lock().unwrap();
            map.get(cursor, remaining)?
        };
        let run_len = run_len.max(1).min(remaining);

        match state {
            BlockState::Unknown | BlockState::Inuse1 | BlockState::Free | BlockState::Free1 => {
                let new_state =
                    if req.zapping_metadata { BlockState::Metadata } else { BlockState::Inuse };
                block_state.lock().unwrap().set(cursor, run_len, new_state);
            }
            BlockState::Inuse | BlockState::Multi => match pass {
                ReconPass::CollectDuplicates => {
                    dup_extents.add_range(agno, cursor as u32, run_len as u32);
                    outcome = ReconOutcome::Duplicate;
                }
                ReconPass::Finalize => {
                    let suppress_warning =
                        req.reflink_capable && !req.is_unwritten && state != BlockState::Multi;
                    if !suppress_warning {
                        report.bump(ErrorKind::StructuralCorruption);
                        report.record(
                            Correction::new(crate::context::RuleLabels::DUP_EXTENT, ctx.dry_run)
                                .inode(req.owner_ino)
                                .ag(agno),
                        );
                    }
                    block_state.lock().unwrap().set(cursor, run_len, BlockState::Multi);
                    outcome = ReconOutcome::Duplicate;
                }
            },
            s if s.is_reserved() => {
                report.bump(ErrorKind::UnrecoverableInode);
                report.record(
                    Correction::new(crate::context::RuleLabels::RESERVED_BLOCK_CLAIM, ctx.dry_run)
                        .inode(req.owner_ino)
                        .ag(agno),
                );
                return Ok(ReconOutcome::ClearInode);
            }
            BlockState::BadState => unreachable!("BlockStateMap::get returns Err for BAD_STATE"),
            BlockState::Metadata | BlockState::Cow => {
                // already METADATA/COW from a prior pass of the same
                // zapped-metadata inode or CoW staging owner; leave as-is.
            }
        }

        if let Some(slab) = rmap_slab {
            slab.push(RmapRecord {
                agno,
                start_block: cursor as u32,
                length: run_len as u32,
                owner: OwnerKind::Inode(req.owner_ino),
                is_attr_fork: req.fork == ForkKind::Attr,
                is_bmbt_block: false,
                is_unwritten: req.is_unwritten,
                logical_offset: logical,
            });
        }

        cursor += run_len;
        logical += run_len;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RepairContext;

    fn req() -> ReconRequest {
        ReconRequest {
            owner_ino: 200,
            fork: ForkKind::Data,
            logical_offset: 0,
            is_unwritten: false,
            reflink_capable: false,
            zapping_metadata: false,
        }
    }

    #[test]
    fn unknown_transitions_to_inuse() {
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        let dup = DupExtentSet::new();
        let rc = RepairContext::default();
        let mut report = PhaseReport::new("test");
        let outcome =
            reconcile_extent(&rc, &mut report, &map, &dup, None, 0, 100, 8, &req(), ReconPass::Finalize)
                .unwrap();
        assert_eq!(outcome, ReconOutcome::Ok);
        assert_eq!(map.lock().unwrap().get(100, 8).unwrap().0, BlockState::Inuse);
    }

    #[test]
    fn second_claim_collects_duplicate_then_finalizes_multi() {
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        let dup = DupExtentSet::new();
        let rc = RepairContext::default();
        let mut report = PhaseReport::new("test");
        reconcile_extent(&rc, &mut report, &map, &dup, None, 0, 100, 8, &req(), ReconPass::Finalize)
            .unwrap();

        let mut report2 = PhaseReport::new("test");
        let outcome = reconcile_extent(
            &rc,
            &mut report2,
            &map,
            &dup,
            None,
            0,
            100,
            8,
            &req(),
            ReconPass::CollectDuplicates,
        )
        .unwrap();
        assert_eq!(outcome, ReconOutcome::Duplicate);
        assert!(dup.overlaps(0, 100, 8));

        let mut report3 = PhaseReport::new("test");
        reconcile_extent(&rc, &mut report3, &map, &dup, None, 0, 100, 8, &req(), ReconPass::Finalize)
            .unwrap();
        assert_eq!(map.lock().unwrap().get(100, 8).unwrap().0, BlockState::Multi);
        assert!(report3.total_errors() > 0);
    }

    #[test]
    fn reserved_state_clears_inode() {
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        map.lock().unwrap().set(4, 10, BlockState::Ino);
        let dup = DupExtentSet::new();
        let rc = RepairContext::default();
        let mut report = PhaseReport::new("test");
        let outcome =
            reconcile_extent(&rc, &mut report, &map, &dup, None, 0, 4, 10, &req(), ReconPass::Finalize)
                .unwrap();
        assert_eq!(outcome, ReconOutcome::ClearInode);
    }

    #[test]
    fn reflink_capable_written_share_suppresses_warning() {
        let map = Mutex::new(BlockStateMap::new_ag(0, 1000, 4));
        let dup = DupExtentSet::new();
        let rc = RepairContext::default();
        let mut report = PhaseReport::new("test");
        reconcile_extent(&rc, &mut report, &map, &dup, None, 0, 100, 8, &req(), ReconPass::Finalize)
            .unwrap();

        let mut r = req();
        r.reflink_capable = true;
        let mut report2 = PhaseReport::new("test");
        reconcile_extent(&rc, &mut report2, &map, &dup, None, 0, 100, 8, &r, ReconPass::Finalize)
            .unwrap();
        assert_eq!(report2.total_errors(), 0);
    }
}
