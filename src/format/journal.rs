//! Journal (log) header: head/tail cycle numbers only — phase 2 either
//! replays (out of scope: replay itself is left to the kernel/mount
//! path) or destroys the log, it never interprets log item content.

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

pub const XLOG_HEADER_MAGIC_NUM: u32 = 0xfeed_babe;

/// First sector of the log: cycle number, head/tail block offsets, and
/// (reduced from the real on-disk header, which also carries a
/// checksum, prior-block pointer and per-cycle data array this crate
/// never inspects) the log stripe unit stamped into `h_size` so a
/// later mount/recovery pass knows the record size this reformat used.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XlogRecHeader {
    pub h_magicno: U32,
    pub h_cycle: U32,
    pub h_version: U32,
    pub h_len: U32,
    pub h_lsn: U64,
    pub h_tail_lsn: U64,
    pub h_size: U32,
}

pub struct LogState {
    pub cycle: u32,
    pub head_lsn: u64,
    pub tail_lsn: u64,
    pub is_clean: bool,
}

/// Parse the log's first record header and report whether head and
/// tail agree (a "clean" log — nothing to replay).
pub fn parse_log_header(buf: &[u8]) -> Result<LogState, RepairError> {
    let hdr = XlogRecHeader::ref_from_prefix(buf)
        .map_err(|_| RepairError::Parse("buffer too small for log header"))?
        .0;

    if hdr.h_magicno.get() != XLOG_HEADER_MAGIC_NUM {
        return Err(RepairError::BadMagic("log header"));
    }

    let head_lsn = hdr.h_lsn.get();
    let tail_lsn = hdr.h_tail_lsn.get();

    Ok(LogState { cycle: hdr.h_cycle.get(), head_lsn, tail_lsn, is_clean: head_lsn == tail_lsn })
}

/// Build a zeroed, reformatted log header for a freshly-destroyed log
/// (phase 2, `-L` / `destroy_log`): fresh cycle number 1, head == tail,
/// stamped with the filesystem's current log stripe unit (§4.4: the log
/// is reformatted "with the current format version, stripe unit, and
/// cycle seed").
pub fn format_clean_log_header(version: u32, log_sunit: u32) -> XlogRecHeader {
    XlogRecHeader {
        h_magicno: U32::new(XLOG_HEADER_MAGIC_NUM),
        h_cycle: U32::new(1),
        h_version: U32::new(version),
        h_len: U32::new(0),
        h_lsn: U64::new(0),
        h_tail_lsn: U64::new(0),
        h_size: U32::new(log_sunit),
    }
}

/// Serialize a clean log header into a zeroed `sector_size`-byte
/// sector, ready to write over the log's first sector.
pub fn encode_clean_log_header(version: u32, log_sunit: u32, sector_size: usize) -> Vec<u8> {
    let hdr = format_clean_log_header(version, log_sunit);
    let mut buf = vec![0u8; sector_size.max(36)];
    buf[0..4].copy_from_slice(&hdr.h_magicno.get().to_be_bytes());
    buf[4..8].copy_from_slice(&hdr.h_cycle.get().to_be_bytes());
    buf[8..12].copy_from_slice(&hdr.h_version.get().to_be_bytes());
    buf[12..16].copy_from_slice(&hdr.h_len.get().to_be_bytes());
    buf[16..24].copy_from_slice(&hdr.h_lsn.get().to_be_bytes());
    buf[24..32].copy_from_slice(&hdr.h_tail_lsn.get().to_be_bytes());
    buf[32..36].copy_from_slice(&hdr.h_size.get().to_be_bytes());
    buf
}
