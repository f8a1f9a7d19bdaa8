//! Attribute-fork on-disk layout. Shares the bmbt/extent-list fork
//! formats with the data fork (§4.6 step 7); the only attribute-fork
//! specific shape is the leaf block holding name/value entries.

use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

const XFS_ATTR_LEAF_MAGIC: u16 = 0xfbee; // V4
const XFS_ATTR3_LEAF_MAGIC: u16 = 0x3bee; // V5

/// Short-form attribute list header (embedded in the inode fork).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAttrSfHdr {
    pub totsize: U16,
    pub count: u8,
}

/// One short-form attribute entry (variable length; fixed prefix only).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAttrSfEntryHdr {
    pub namelen: u8,
    pub valuelen: u8,
    pub flags: u8,
}

/// Attribute-entry namespace/flag bits.
pub mod flags {
    pub const LOCAL: u8 = 1 << 0;
    pub const ROOT: u8 = 1 << 1;
    pub const SECURE: u8 = 1 << 2;
    pub const INCOMPLETE: u8 = 1 << 7;
}

pub struct SfAttrEntry {
    pub name: Vec<u8>,
    pub value_len: u8,
    pub flags: u8,
}

/// Parse a short-form attribute fork, returning each entry's name and
/// declared value length (the value bytes themselves are skipped —
/// the repair engine never needs to interpret attribute *values*,
/// only validate structural bounds).
pub fn parse_shortform_attrs(fork_buf: &[u8]) -> Result<Vec<SfAttrEntry>, RepairError> {
    let hdr = XfsAttrSfHdr::ref_from_prefix(fork_buf)
        .map_err(|_| RepairError::Parse("attr shortform header too small"))?
        .0;
    let count = hdr.count as usize;

    let mut entries = Vec::with_capacity(count);
    let mut offset = 3usize; // totsize(2) + count(1)

    for _ in 0..count {
        if offset + 3 > fork_buf.len() {
            return Err(RepairError::Parse("attr shortform entry header out of bounds"));
        }
        let namelen = fork_buf[offset] as usize;
        let valuelen = fork_buf[offset + 1];
        let eflags = fork_buf[offset + 2];

        let name_start = offset + 3;
        let name_end = name_start + namelen;
        if name_end > fork_buf.len() {
            return Err(RepairError::Parse("attr shortform name out of bounds"));
        }

        entries.push(SfAttrEntry { name: fork_buf[name_start..name_end].to_vec(), value_len: valuelen, flags: eflags });
        offset = name_end + valuelen as usize;
    }

    Ok(entries)
}

/// V4 attribute leaf block header (32 bytes of `xfs_da_blkinfo` + count fields).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAttrLeafHdrV4 {
    pub forw: U32,
    pub back: U32,
    pub magic: U16,
    pub count: U16,
    pub usedbytes: U16,
    pub firstused: U16,
    pub holes: u8,
    pub pad1: u8,
}

pub fn leaf_magic_valid(buf: &[u8], is_v5: bool) -> bool {
    if buf.len() < 10 {
        return false;
    }
    let magic = u16::from_be_bytes([buf[8], buf[9]]);
    if is_v5 {
        magic == XFS_ATTR3_LEAF_MAGIC
    } else {
        magic == XFS_ATTR_LEAF_MAGIC
    }
}
