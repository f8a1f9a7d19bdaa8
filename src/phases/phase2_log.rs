//! Phase 2: log handling and metadata-root location (§4.4).
//!
//! Either the journal is clean (head == tail) and nothing happens, or
//! it is dirty and the run must either replay it (out of scope: replay
//! of log item content is left to the kernel/mount path, per the
//! Non-goals) or destroy it outright when `-L` is passed. A dirty log
//! with no destroy flag is a hard abort — there is no safe way to
//! continue scanning an image whose on-disk state doesn't match its
//! journal.
//!
//! The second half of this phase just resolves the well-known
//! metadata inumbers the superblock already carries (root, quota,
//! realtime bitmap/summary) and flags any that are unexpectedly zero
//! so phase 6 can reconstruct them.

use crate::context::RepairContext;
use crate::diag::{Correction, PhaseReport};
use crate::error::{ErrorKind, RepairError};
use crate::format::extent::fsblock_to_byte;
use crate::format::journal::{encode_clean_log_header, parse_log_header};
use crate::format::quota::dqflags;
use crate::format::superblock::FsContext;
use crate::io::engine::IoEngine;
use crate::io::reader::{IoPhase, IoReader};

const LOG_HEADER_READ_LEN: usize = 512;

pub struct Phase2Outcome {
    pub report: PhaseReport,
    /// Well-known metadata inumbers phase 6 must confirm are reachable
    /// (and, if zero here, must reconstruct from scratch).
    pub expected_metadata_inodes: Vec<u64>,
}

/// Decide the journal's fate and resolve well-known metadata inumbers.
pub fn run(ctx: &RepairContext, engine: &mut IoEngine, fs: &FsContext) -> Result<Phase2Outcome, RepairError> {
    let mut report = PhaseReport::new("log");

    handle_log(ctx, engine, fs, &mut report)?;

    let mut expected_metadata_inodes = Vec::new();
    if fs.root_ino != 0 {
        expected_metadata_inodes.push(fs.root_ino);
    } else {
        report.bump(ErrorKind::StructuralCorruption);
        report.record(Correction::new("missing-root-inode", ctx.dry_run));
    }

    for (ino, present_rule, absent_rule) in [
        (fs.rbm_ino, "rt-bitmap-inode-located", "missing-rt-bitmap-inode"),
        (fs.rsum_ino, "rt-summary-inode-located", "missing-rt-summary-inode"),
    ] {
        if ino != 0 {
            expected_metadata_inodes.push(ino);
            report.record(Correction::new(present_rule, true));
        } else if fs.rextents != 0 {
            // A realtime device is configured but its bookkeeping
            // inode is unresolved — phase 6 must rebuild it.
            report.bump(ErrorKind::StructuralCorruption);
            report.record(Correction::new(absent_rule, ctx.dry_run));
        }
    }

    if fs.uquota_ino != 0 {
        expected_metadata_inodes.push(fs.uquota_ino);
    } else if fs.qflags & (dqflags::USER as u16) != 0 {
        report.bump(ErrorKind::StructuralCorruption);
        report.record(Correction::new("missing-user-quota-inode", ctx.dry_run));
    }
    if fs.gquota_ino != 0 {
        expected_metadata_inodes.push(fs.gquota_ino);
    } else if fs.qflags & ((dqflags::GROUP | dqflags::PROJ) as u16) != 0 {
        report.bump(ErrorKind::StructuralCorruption);
        report.record(Correction::new("missing-group-or-project-quota-inode", ctx.dry_run));
    }

    Ok(Phase2Outcome { report, expected_metadata_inodes })
}

fn handle_log(
    ctx: &RepairContext,
    engine: &mut IoEngine,
    fs: &FsContext,
    report: &mut PhaseReport,
) -> Result<(), RepairError> {
    if fs.log_blocks == 0 {
        // External log device: out of scope for this crate's
        // single-device `IoEngine` (§1 non-goal).
        report.record(Correction::new("external-log-not-inspected", true));
        return Ok(());
    }

    let offset = fsblock_to_byte(fs, fs.log_start);
    let buf = engine.read_at(offset, LOG_HEADER_READ_LEN, IoPhase::Journal)?.to_vec();

    let dirty = match parse_log_header(&buf) {
        Ok(state) => !state.is_clean,
        Err(_) => true,
    };

    if !dirty {
        report.record(Correction::new("log-clean", true));
        return Ok(());
    }

    if !ctx.destroy_log {
        report.bump(ErrorKind::StructuralCorruption);
        return Err(RepairError::DirtyLogNoDestroy);
    }

    report.bump(ErrorKind::StructuralCorruption);
    if ctx.dry_run {
        report.record(Correction::new("log-destroy", true));
        return Ok(());
    }

    let version = match fs.version {
        crate::format::superblock::FormatVersion::V5 => 2,
        crate::format::superblock::FormatVersion::V4 => 1,
    };
    let clean = encode_clean_log_header(version, fs.log_sunit, fs.sect_size as usize);
    engine.write_at(offset, &clean)?;
    report.record(Correction::new("log-destroyed", false));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::superblock::tests::minimal_ctx;

    fn fs_image_size(fs: &FsContext) -> u64 {
        fs.ag_count as u64 * fs.ag_blocks as u64 * fs.block_size as u64
    }

    fn write_clean_log(path: &std::path::Path, fs: &FsContext) {
        use std::io::Write;
        use std::os::unix::fs::FileExt;
        let mut f = std::fs::File::create(path).unwrap();
        f.set_len(fs_image_size(fs)).unwrap();
        let hdr = crate::format::journal::format_clean_log_header(2, fs.log_sunit);
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&hdr.h_magicno.get().to_be_bytes());
        buf[4..8].copy_from_slice(&hdr.h_cycle.get().to_be_bytes());
        buf[8..12].copy_from_slice(&hdr.h_version.get().to_be_bytes());
        buf[12..16].copy_from_slice(&hdr.h_len.get().to_be_bytes());
        buf[16..24].copy_from_slice(&hdr.h_lsn.get().to_be_bytes());
        buf[24..32].copy_from_slice(&hdr.h_tail_lsn.get().to_be_bytes());
        buf[32..36].copy_from_slice(&hdr.h_size.get().to_be_bytes());
        let offset = fsblock_to_byte(fs, fs.log_start);
        f.write_all_at(&buf, offset).unwrap();
        f.flush().unwrap();
    }

    fn write_dirty_log(path: &std::path::Path, fs: &FsContext) {
        use std::os::unix::fs::FileExt;
        let mut f = std::fs::File::create(path).unwrap();
        f.set_len(fs_image_size(fs)).unwrap();
        let mut buf = vec![0u8; 512];
        buf[0..4].copy_from_slice(&0xfeed_babeu32.to_be_bytes());
        buf[4..8].copy_from_slice(&7u32.to_be_bytes()); // cycle
        buf[8..12].copy_from_slice(&2u32.to_be_bytes()); // version
        buf[16..24].copy_from_slice(&100u64.to_be_bytes()); // head lsn
        buf[24..32].copy_from_slice(&40u64.to_be_bytes()); // tail lsn != head
        let offset = fsblock_to_byte(fs, fs.log_start);
        f.write_all_at(&buf, offset).unwrap();
    }

    fn logged_ctx() -> FsContext {
        let mut fs = minimal_ctx(true);
        fs.log_start = 2048; // inside AG 2, clear of the header
        fs.log_blocks = 64;
        fs.root_ino = 128;
        fs
    }

    #[test]
    fn clean_log_is_left_alone() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fs = logged_ctx();
        write_clean_log(tmp.path(), &fs);
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let rc = RepairContext::default();
        let outcome = run(&rc, &mut engine, &fs).unwrap();
        assert!(outcome.report.corrections.iter().any(|c| c.rule == "log-clean"));
        assert_eq!(outcome.report.total_errors(), 0);
    }

    #[test]
    fn dirty_log_without_destroy_flag_aborts() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fs = logged_ctx();
        write_dirty_log(tmp.path(), &fs);
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let rc = RepairContext::default();
        let err = run(&rc, &mut engine, &fs).unwrap_err();
        assert!(matches!(err, RepairError::DirtyLogNoDestroy));
        assert!(err.is_fatal());
    }

    #[test]
    fn dirty_log_with_destroy_flag_is_reformatted() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut fs = logged_ctx();
        fs.log_sunit = 4096;
        write_dirty_log(tmp.path(), &fs);
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let mut rc = RepairContext::default();
        rc.destroy_log = true;
        let outcome = run(&rc, &mut engine, &fs).unwrap();
        assert!(outcome.report.corrections.iter().any(|c| c.rule == "log-destroyed"));

        let offset = fsblock_to_byte(&fs, fs.log_start);
        let reread = engine.read_at(offset, LOG_HEADER_READ_LEN, IoPhase::Journal).unwrap().to_vec();
        let state = parse_log_header(&reread).unwrap();
        assert!(state.is_clean);

        let hdr = crate::format::journal::XlogRecHeader::ref_from_prefix(&reread).unwrap().0;
        assert_eq!(hdr.h_size.get(), fs.log_sunit, "reformat must stamp the current log stripe unit");
    }

    #[test]
    fn external_log_is_skipped() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut fs = logged_ctx();
        fs.log_blocks = 0;
        std::fs::File::create(tmp.path()).unwrap().set_len(fs_image_size(&fs)).unwrap();
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let rc = RepairContext::default();
        let outcome = run(&rc, &mut engine, &fs).unwrap();
        assert!(outcome.report.corrections.iter().any(|c| c.rule == "external-log-not-inspected"));
    }

    #[test]
    fn missing_root_inode_is_flagged() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut fs = logged_ctx();
        fs.root_ino = 0;
        write_clean_log(tmp.path(), &fs);
        let mut engine = IoEngine::open(tmp.path().to_str().unwrap(), true).unwrap();
        let rc = RepairContext::default();
        let outcome = run(&rc, &mut engine, &fs).unwrap();
        assert!(outcome.report.corrections.iter().any(|c| c.rule == "missing-root-inode"));
        assert!(!outcome.expected_metadata_inodes.contains(&0));
    }
}
