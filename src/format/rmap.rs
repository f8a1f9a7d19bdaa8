//! Reverse-map btree record shape (V5 only). One record per physical
//! extent: which owner (inode, or a well-known static-metadata owner)
//! claims it, at what logical offset, in which fork.

use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

/// Well-known owners for AG-structural metadata (not inode-backed).
pub mod owner {
    pub const NULL: u64 = 0;
    pub const SB: u64 = 1;
    pub const BNOBT: u64 = 2;
    pub const CNTBT: u64 = 3;
    pub const INOBT: u64 = 4;
    pub const INODES: u64 = 5;
    pub const REFC: u64 = 6;
    pub const COW: u64 = 7;
    pub const FS: u64 = 8; // log, AG headers
}

pub mod flags {
    pub const ATTR_FORK: u64 = 1 << 0;
    pub const BMBT_BLOCK: u64 = 1 << 1;
    pub const UNWRITTEN: u64 = 1 << 2;
}

/// On-disk rmap btree record (24 bytes): startblock, blockcount, owner,
/// offset-and-flags packed into one 64-bit word (bit 63 = attr fork,
/// bit 62 = bmbt block, bit 61 = unwritten, low 54 bits = logical offset).
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsRmapRec {
    pub rm_startblock: U32,
    pub rm_blockcount: U32,
    pub rm_owner: U64,
    pub rm_offset: U64,
}

#[derive(Debug, Clone, Copy)]
pub struct RmapEntry {
    pub start_block: u32,
    pub block_count: u32,
    pub owner: u64,
    pub logical_offset: u64,
    pub is_attr_fork: bool,
    pub is_bmbt_block: bool,
    pub is_unwritten: bool,
}

impl XfsRmapRec {
    pub fn unpack(&self) -> RmapEntry {
        let raw = self.rm_offset.get();
        RmapEntry {
            start_block: self.rm_startblock.get(),
            block_count: self.rm_blockcount.get(),
            owner: self.rm_owner.get(),
            logical_offset: raw & 0x003F_FFFF_FFFF_FFFF,
            is_attr_fork: raw & (flags::ATTR_FORK) != 0,
            is_bmbt_block: raw & (flags::BMBT_BLOCK) != 0,
            is_unwritten: raw & (flags::UNWRITTEN) != 0,
        }
    }

    pub fn pack(e: &RmapEntry) -> Self {
        let mut raw = e.logical_offset & 0x003F_FFFF_FFFF_FFFF;
        if e.is_attr_fork {
            raw |= flags::ATTR_FORK;
        }
        if e.is_bmbt_block {
            raw |= flags::BMBT_BLOCK;
        }
        if e.is_unwritten {
            raw |= flags::UNWRITTEN;
        }
        XfsRmapRec {
            rm_startblock: U32::new(e.start_block),
            rm_blockcount: U32::new(e.block_count),
            rm_owner: U64::new(e.owner),
            rm_offset: U64::new(raw),
        }
    }
}

pub fn parse_rmap_record(buf: &[u8]) -> Result<RmapEntry, RepairError> {
    let rec = XfsRmapRec::ref_from_prefix(buf)
        .map_err(|_| RepairError::Parse("buffer too small for rmap record"))?
        .0;
    Ok(rec.unpack())
}
