//! On-disk extent record (bmbt record) packing/unpacking, and fsblock
//! <-> (AG, AG-block) conversions shared by every fork walker.

use zerocopy::byteorder::big_endian::U64;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;
use crate::format::superblock::FsContext;

/// On-disk XFS extent record (packed 128-bit / 16-byte).
///
/// Bit layout (big-endian, 128 bits total):
/// - Bit 127:        extent flag (1 = unwritten)
/// - Bits 126..73:   logical file offset (54 bits)
/// - Bits 72..21:    absolute filesystem block number (52 bits)
/// - Bits 20..0:     block count (21 bits)
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsBmbtRec {
    pub l0: U64,
    pub l1: U64,
}

/// Unpacked extent with decomposed AG information.
#[derive(Debug, Clone, Copy)]
pub struct Extent {
    pub logical_offset: u64,
    pub ag_number: u32,
    pub ag_block: u32,
    pub block_count: u64,
    pub is_unwritten: bool,
}

impl XfsBmbtRec {
    pub fn unpack_with_context(&self, ctx: &FsContext) -> Extent {
        let l0 = self.l0.get();
        let l1 = self.l1.get();

        let is_unwritten = (l0 >> 63) != 0;
        let logical_offset = (l0 >> 9) & 0x003F_FFFF_FFFF_FFFF;
        let fsblock = ((l0 & 0x1FF) << 43) | (l1 >> 21);
        let block_count = l1 & 0x001F_FFFF;

        let (ag_number, ag_block) = fsblock_to_ag(ctx, fsblock);

        Extent { logical_offset, ag_number, ag_block, block_count, is_unwritten }
    }

    /// Pack an extent back into on-disk form (phase 5 directory rebuild,
    /// phase 3 zapped-extent placeholders).
    pub fn pack(ctx: &FsContext, e: &Extent) -> Self {
        let fsblock = ctx.ag_block_to_fsblock(e.ag_number, e.ag_block);
        let unwritten_bit: u64 = if e.is_unwritten { 1 } else { 0 };
        let l0 = (unwritten_bit << 63) | ((e.logical_offset & 0x003F_FFFF_FFFF_FFFF) << 9) | (fsblock >> 43);
        let l1 = ((fsblock & 0x7FF_FFFF_FFFF) << 21) | (e.block_count & 0x001F_FFFF);
        XfsBmbtRec { l0: U64::new(l0), l1: U64::new(l1) }
    }
}

pub const EXTENT_RECORD_SIZE: usize = std::mem::size_of::<XfsBmbtRec>();

/// Extract extent list from a data-fork buffer in FMT_EXTENTS format.
pub fn parse_extent_list(
    fork_buf: &[u8],
    nextents: u32,
    ctx: &FsContext,
) -> Result<Vec<Extent>, RepairError> {
    let mut extents = Vec::with_capacity(nextents as usize);

    for i in 0..nextents as usize {
        let start = i * EXTENT_RECORD_SIZE;
        if start + EXTENT_RECORD_SIZE > fork_buf.len() {
            return Err(RepairError::Parse("extent record out of bounds"));
        }
        let rec = XfsBmbtRec::ref_from_prefix(&fork_buf[start..])
            .map_err(|_| RepairError::Parse("failed to parse extent record"))?
            .0;
        extents.push(rec.unpack_with_context(ctx));
    }

    Ok(extents)
}

impl Extent {
    pub fn start_byte(&self, ctx: &FsContext) -> u64 {
        ctx.ag_block_to_byte(self.ag_number, self.ag_block)
    }

    /// Whether `other` overlaps this extent's logical range — used by
    /// the dinode processor's in-fork overlap check (§4.6 step 7).
    pub fn overlaps_logical(&self, other: &Extent) -> bool {
        let a_end = self.logical_offset + self.block_count;
        let b_end = other.logical_offset + other.block_count;
        self.logical_offset < b_end && other.logical_offset < a_end
    }
}

/// Convert an absolute filesystem block number to a byte offset on disk.
pub fn fsblock_to_byte(ctx: &FsContext, fsblock: u64) -> u64 {
    let (agno, agblock) = fsblock_to_ag(ctx, fsblock);
    ctx.ag_block_to_byte(agno, agblock)
}

/// Convert an absolute filesystem block number to (agno, agblock).
pub fn fsblock_to_ag(ctx: &FsContext, fsblock: u64) -> (u32, u32) {
    let agno = (fsblock >> ctx.ag_blk_log as u64) as u32;
    let agblock = (fsblock & ((1u64 << ctx.ag_blk_log as u64) - 1)) as u32;
    (agno, agblock)
}
