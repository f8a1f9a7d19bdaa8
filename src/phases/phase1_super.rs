//! Phase 1: superblock verification (§4.1).
//!
//! Parses the primary superblock into an [`FsContext`], then reads every
//! AG's secondary superblock copy and runs a majority vote over the
//! fields that must agree everywhere ([`GeometryFields`]) — a disagreeing
//! secondary is a correction, not a parse failure, since the primary
//! (or the majority) is trusted to win. Finally computes any
//! user-requested feature-bit upgrade as a [`PendingFeatureUpgrade`]:
//! per §4.3 the upgrade is staged here but not committed to disk until
//! the orchestrator has seen phase 5 report no space shortfall and
//! phase 2 report no root-inode reconstruction — see
//! [`commit_feature_upgrade`].
//!
//! `XfsDsb` only derives `FromBytes`/`KnownLayout`/`Immutable` — it has
//! no encode path, on purpose (the Format Library stays read-only/
//! zerocopy-only). The one place that needs to mutate superblock bytes
//! computes the field's offset with `std::mem::offset_of!` and
//! read-modify-writes the big-endian word directly, keeping that one
//! write-path special case confined to this module.

use std::collections::HashMap;

use crate::context::RepairContext;
use crate::diag::{Correction, PhaseReport};
use crate::error::{ErrorKind, RepairError};
use crate::format::superblock::{feat_incompat, FsContext, GeometryFields, XfsDsb};
use crate::io::engine::IoEngine;
use crate::io::reader::{IoPhase, IoReader};

const SB_READ_LEN: usize = 512;

pub struct Phase1Outcome {
    pub fs: FsContext,
    pub report: PhaseReport,
    /// Feature-bit upgrade computed from `ctx.feature_upgrade`, staged
    /// in memory only — see [`commit_feature_upgrade`].
    pub pending_feature_upgrade: PendingFeatureUpgrade,
}

/// A feature-bit upgrade computed by phase 1 but not yet written to
/// disk (§4.3): each field is `Some(new_word)` only when the requested
/// upgrade actually changes that superblock word.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingFeatureUpgrade {
    pub incompat: Option<u32>,
    pub ro_compat: Option<u32>,
}

impl PendingFeatureUpgrade {
    pub fn is_empty(&self) -> bool {
        self.incompat.is_none() && self.ro_compat.is_none()
    }
}

/// Read and parse the primary superblock, majority-vote AG geometry
/// against every secondary copy, and stage any requested feature
/// upgrade. Returns the [`FsContext`] every later phase is built from.
pub fn run(ctx: &RepairContext, engine: &mut IoEngine) -> Result<Phase1Outcome, RepairError> {
    let mut report = PhaseReport::new("superblock");

    let primary_buf = engine.read_at(0, SB_READ_LEN, IoPhase::Superblock)?.to_vec();
    let fs = FsContext::from_superblock(&primary_buf)?;
    let primary_geometry = GeometryFields::from(&fs);

    let mut votes: HashMap<GeometryFields, u32> = HashMap::new();
    *votes.entry(primary_geometry).or_insert(0) += 1;

    for agno in 1..fs.ag_count {
        let offset = fs.ag_start_byte(agno);
        let buf = match engine.read_at(offset, SB_READ_LEN, IoPhase::Superblock) {
            Ok(b) => b.to_vec(),
            Err(e) => {
                report.bump(e.kind());
                report.record(Correction::new("secondary-superblock-unreadable", ctx.dry_run).ag(agno));
                continue;
            }
        };
        match FsContext::from_superblock(&buf) {
            Ok(secondary) => {
                *votes.entry(GeometryFields::from(&secondary)).or_insert(0) += 1;
            }
            Err(e) => {
                report.bump(e.kind());
                report.record(Correction::new("secondary-superblock-bad-magic", ctx.dry_run).ag(agno));
            }
        }
    }

    if let Some((&winner, _)) = votes.iter().max_by_key(|(_, &count)| count) {
        if winner != primary_geometry {
            report.bump(ErrorKind::StructuralCorruption);
            report.record(Correction::new("primary-geometry-outvoted", ctx.dry_run));
            // The primary superblock's geometry fields disagree with the
            // AG-secondary majority; later phases still proceed with the
            // primary-derived `fs`, since rewriting the primary's geometry
            // words themselves is out of scope (§1 non-goal: no
            // geometry-changing repair, only feature/needsrepair bits).
        }
    }

    let pending_feature_upgrade = if ctx.feature_upgrade.any() {
        compute_pending_feature_upgrade(ctx, &fs, &mut report)
    } else {
        PendingFeatureUpgrade::default()
    };

    Ok(Phase1Outcome { fs, report, pending_feature_upgrade })
}

/// Compute the feature-bit upgrade `ctx.feature_upgrade` requests,
/// against the as-parsed primary superblock, without writing anything.
/// Each changed word is recorded as a "staged" (dry-run-styled)
/// correction regardless of `ctx.dry_run`, since nothing commits here
/// either way — see [`commit_feature_upgrade`] for the actual write.
fn compute_pending_feature_upgrade(
    ctx: &RepairContext,
    fs: &FsContext,
    report: &mut PhaseReport,
) -> PendingFeatureUpgrade {
    let mut incompat = fs.incompat;
    if ctx.feature_upgrade.extent_counts_64 {
        incompat |= feat_incompat::NREXT64;
    }
    if ctx.feature_upgrade.large_timestamps {
        incompat |= feat_incompat::BIGTIME;
    }
    if ctx.feature_upgrade.file_content_exchange {
        incompat |= feat_incompat::EXCHRANGE;
    }

    let mut pending = PendingFeatureUpgrade::default();

    if incompat != fs.incompat {
        pending.incompat = Some(incompat);
        report.record(Correction::new("incompat-feature-bit-staged", true));
    }

    if ctx.feature_upgrade.inode_btree_counts {
        let ro_compat = fs.ro_compat | crate::format::superblock::feat_ro_compat::INOBTCNT;
        if ro_compat != fs.ro_compat {
            pending.ro_compat = Some(ro_compat);
            report.record(Correction::new("ro-compat-feature-bit-staged", true));
        }
    }

    pending
}

/// Commit a feature-bit upgrade phase 1 staged, once the orchestrator
/// has confirmed phase 5 found no space shortfall and phase 2 found no
/// root-inode reconstruction needed (§4.3). Called at most once per
/// run, after phase 6, and never in dry-run mode.
pub fn commit_feature_upgrade(
    engine: &mut IoEngine,
    pending: &PendingFeatureUpgrade,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    if let Some(incompat) = pending.incompat {
        patch_be32_field(engine, std::mem::offset_of!(XfsDsb, sb_features_incompat), incompat)?;
        report.record(Correction::new("incompat-feature-bit-committed", false));
    }

    if let Some(ro_compat) = pending.ro_compat {
        patch_be32_field(engine, std::mem::offset_of!(XfsDsb, sb_features_ro_compat), ro_compat)?;
        report.record(Correction::new("ro-compat-feature-bit-committed", false));
    }

    Ok(())
}

/// Read-modify-write a single big-endian `u32` field of the primary
/// superblock at the given byte offset, computed by the caller via
/// `std::mem::offset_of!(XfsDsb, ...)`.
fn patch_be32_field(engine: &mut IoEngine, field_offset: usize, value: u32) -> Result<(), RepairError> {
    let mut buf = engine.read_at(0, SB_READ_LEN, IoPhase::Superblock)?.to_vec();
    if field_offset + 4 > buf.len() {
        return Err(RepairError::Structural("superblock field offset out of bounds"));
    }
    buf[field_offset..field_offset + 4].copy_from_slice(&value.to_be_bytes());
    engine.write_at(0, &buf)
}

/// Set or clear the NEEDSREPAIR incompat bit on the primary superblock.
/// Used by the orchestrator at the start of a write-mode run (set) and,
/// if the run completes cleanly, at the end (clear) — shares the same
/// raw-offset patch helper as feature-upgrade staging.
pub fn set_needsrepair(engine: &mut IoEngine, fs: &FsContext, set: bool) -> Result<(), RepairError> {
    let incompat = if set {
        fs.incompat | feat_incompat::NEEDSREPAIR
    } else {
        fs.incompat & !feat_incompat::NEEDSREPAIR
    };
    patch_be32_field(engine, std::mem::offset_of!(XfsDsb, sb_features_incompat), incompat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal_fs_image(path: &std::path::Path, ag_count: u32) {
        let block_size: u32 = 4096;
        let ag_blocks: u32 = 64;
        let mut sb = vec![0u8; block_size as usize];
        sb[0..4].copy_from_slice(&0x5846_5342u32.to_be_bytes()); // "XFSB"
        sb[4..8].copy_from_slice(&block_size.to_be_bytes());
        sb[8..16].copy_from_slice(&((ag_blocks as u64) * ag_count as u64).to_be_bytes()); // dblocks
        sb[56..60].copy_from_slice(&ag_blocks.to_be_bytes()); // sb_agblocks
        sb[60..64].copy_from_slice(&ag_count.to_be_bytes()); // sb_agcount
        sb[100..102].copy_from_slice(&5u16.to_be_bytes()); // sb_versionnum: V5 nibble
        sb[102..104].copy_from_slice(&512u16.to_be_bytes()); // sb_sectsize
        sb[104..106].copy_from_slice(&512u16.to_be_bytes()); // sb_inodesize
        sb[106..108].copy_from_slice(&8u16.to_be_bytes()); // sb_inopblock
        sb[124] = 12; // sb_blocklog
        sb[125] = 9; // sb_sectlog
        sb[126] = 9; // sb_inodelog
        sb[127] = 3; // sb_inopblog
        sb[128] = 6; // sb_agblklog (64 = 2^6)

        let mut f = std::fs::File::create(path).unwrap();
        // Primary superblock at offset 0.
        f.write_all(&sb).unwrap();
        // Secondary copies at every AG start, identical geometry.
        for agno in 1..ag_count {
            let offset = (agno as u64) * (ag_blocks as u64) * (block_size as u64);
            f.set_len(offset + block_size as u64).unwrap();
            use std::os::unix::fs::FileExt;
            f.write_all_at(&sb, offset).unwrap();
        }
        f.set_len((ag_count as u64) * (ag_blocks as u64) * (block_size as u64)).unwrap();
    }

    #[test]
    fn parses_primary_and_agrees_with_secondaries() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        write_minimal_fs_image(tmp.path(), 4);
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let rc = RepairContext::default();
        let outcome = run(&rc, &mut engine).unwrap();
        assert_eq!(outcome.fs.ag_count, 4);
        assert_eq!(outcome.fs.block_size, 4096);
        assert!(outcome.report.corrections.iter().all(|c| c.rule != "primary-geometry-outvoted"));
    }

    #[test]
    fn feature_upgrade_is_staged_in_memory_without_writing_to_disk() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        write_minimal_fs_image(tmp.path(), 1);
        let before = std::fs::read(tmp.path()).unwrap();

        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let mut rc = RepairContext::default();
        rc.feature_upgrade.extent_counts_64 = true;
        let outcome = run(&rc, &mut engine).unwrap();

        assert!(outcome
            .report
            .corrections
            .iter()
            .any(|c| c.rule == "incompat-feature-bit-staged"));
        assert!(outcome.pending_feature_upgrade.incompat.is_some());

        let after = std::fs::read(tmp.path()).unwrap();
        assert_eq!(before, after, "phase 1 must not write the staged upgrade to disk");

        let refreshed = FsContext::from_superblock(&after[..SB_READ_LEN]).unwrap();
        assert!(!refreshed.has_nrext64, "the on-disk bit must still be unset until committed");
    }

    #[test]
    fn commit_feature_upgrade_writes_the_staged_incompat_word() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        write_minimal_fs_image(tmp.path(), 1);
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let mut rc = RepairContext::default();
        rc.feature_upgrade.extent_counts_64 = true;
        let outcome = run(&rc, &mut engine).unwrap();
        assert!(!outcome.pending_feature_upgrade.is_empty());

        let mut commit_report = PhaseReport::new("feature-upgrade-commit");
        commit_feature_upgrade(&mut engine, &outcome.pending_feature_upgrade, &mut commit_report).unwrap();
        assert!(commit_report.corrections.iter().any(|c| c.rule == "incompat-feature-bit-committed"));

        let reread = engine.read_at(0, SB_READ_LEN, IoPhase::Superblock).unwrap().to_vec();
        let refreshed = FsContext::from_superblock(&reread).unwrap();
        assert!(refreshed.has_nrext64);
    }
}
