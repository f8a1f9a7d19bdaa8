//! Quota file block layout (§4.6 step 8, §4.14). Quota files are
//! regular files whose data fork holds fixed-size `xfs_disk_dquot`
//! records, one per block's worth of dquots, each individually CRC'd
//! on V5.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

const XFS_DQUOT_MAGIC: u16 = 0x4451; // "DQ"
pub const DQUOT_VERSION: u8 = 1;

pub mod dqflags {
    pub const USER: u8 = 1 << 0;
    pub const PROJ: u8 = 1 << 1;
    pub const GROUP: u8 = 1 << 2;
    pub const BIGTIME: u8 = 1 << 7;
}

/// On-disk dquot core (V4; V5 appends a CRC/UUID/LSN tail).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDiskDquot {
    pub d_magic: U16,
    pub d_version: u8,
    pub d_flags: u8,
    pub d_id: U32,
    pub d_blk_hardlimit: U64,
    pub d_blk_softlimit: U64,
    pub d_ino_hardlimit: U64,
    pub d_ino_softlimit: U64,
    pub d_bcount: U64,
    pub d_icount: U64,
    pub d_itimer: U32,
    pub d_btimer: U32,
    pub d_iwarns: U16,
    pub d_bwarns: U16,
    pub d_pad0: U32,
    pub d_rtb_hardlimit: U64,
    pub d_rtb_softlimit: U64,
    pub d_rtbcount: U64,
    pub d_rtbtimer: U32,
    pub d_rtbwarns: U16,
    pub d_pad: U16,
}

/// V5 dquot tail: CRC, client-facing LSN, inode-side LSN, UUID.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDquotV5Tail {
    pub d_crc: U32,
    pub d_lsn: U64,
    pub d_pad2: U64,
    pub d_uuid: [u8; 16],
}

pub const DQUOT_V4_SIZE: usize = std::mem::size_of::<XfsDiskDquot>();
pub const DQUOT_V5_SIZE: usize = DQUOT_V4_SIZE + std::mem::size_of::<XfsDquotV5Tail>();

pub struct DquotRecord {
    pub id: u32,
    pub flags: u8,
    pub bcount: u64,
    pub icount: u64,
    pub rtbcount: u64,
    pub magic_ok: bool,
    pub version_ok: bool,
}

/// Parse one dquot record at `buf`'s start (caller indexes into the
/// owning block by record size).
pub fn parse_dquot(buf: &[u8]) -> Result<DquotRecord, RepairError> {
    let core = XfsDiskDquot::ref_from_prefix(buf)
        .map_err(|_| RepairError::Parse("buffer too small for dquot"))?
        .0;

    Ok(DquotRecord {
        id: core.d_id.get(),
        flags: core.d_flags,
        bcount: core.d_bcount.get(),
        icount: core.d_icount.get(),
        rtbcount: core.d_rtbcount.get(),
        magic_ok: core.d_magic.get() == XFS_DQUOT_MAGIC,
        version_ok: core.d_version == DQUOT_VERSION,
    })
}

/// Per-record CRC check on V5 (the dquot's own CRC field, computed
/// over the record with the CRC field itself zeroed).
pub fn dquot_crc_valid(buf: &[u8], record_size: usize) -> bool {
    if buf.len() < record_size || record_size < DQUOT_V5_SIZE {
        return false;
    }
    let Some(tail) = XfsDquotV5Tail::ref_from_prefix(&buf[DQUOT_V4_SIZE..]).ok().map(|(t, _)| t) else {
        return false;
    };
    let stored = tail.d_crc.get();

    let mut scratch = buf[..record_size].to_vec();
    let crc_offset = DQUOT_V4_SIZE;
    scratch[crc_offset..crc_offset + 4].copy_from_slice(&[0, 0, 0, 0]);
    crc32c::crc32c(&scratch) == stored
}
