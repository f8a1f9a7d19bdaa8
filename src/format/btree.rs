//! Generic short-form AG B-tree traversal (inobt, finobt, bnobt, cntbt,
//! rmapbt, refcountbt all share this on-disk block shape). Each caller
//! supplies its record type and magic numbers; the walk itself —
//! level-by-level sorted batch reads — is common.
//!
//! Returns a materialized `Vec` rather than a callback, per the
//! traversal style used elsewhere in this crate: callers iterate the
//! result, they don't get called back mid-walk.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;
use crate::format::superblock::{FormatVersion, FsContext};
use crate::io::reader::{IoPhase, IoReader};

/// V4 short-form B-tree block header (16 bytes).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsBtreeShortBlockV4 {
    pub bb_magic: U32,
    pub bb_level: U16,
    pub bb_numrecs: U16,
    pub bb_leftsib: U32,
    pub bb_rightsib: U32,
}

/// V5 short-form B-tree block header (56 bytes).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsBtreeShortBlockV5 {
    pub bb_magic: U32,
    pub bb_level: U16,
    pub bb_numrecs: U16,
    pub bb_leftsib: U32,
    pub bb_rightsib: U32,
    pub bb_blkno: U64,
    pub bb_lsn: U64,
    pub bb_uuid: [u8; 16],
    pub bb_owner: U32,
    pub bb_crc: U32,
}

fn btree_header_size(version: FormatVersion) -> usize {
    match version {
        FormatVersion::V4 => std::mem::size_of::<XfsBtreeShortBlockV4>(),
        FormatVersion::V5 => std::mem::size_of::<XfsBtreeShortBlockV5>(),
    }
}

/// Public alias of [`btree_header_size`] for callers that write leaf
/// blocks (phase 5) rather than only walk them.
pub fn leaf_header_size(version: FormatVersion) -> usize {
    btree_header_size(version)
}

/// Write a leaf-level (level 0) short-form btree block header at the
/// start of `buf`. Phase 5 only ever rebuilds single-level trees (see
/// DESIGN.md), so `bb_leftsib`/`bb_rightsib` are always NULL and the
/// V5 tail (blkno/lsn/uuid/owner/crc) is left zeroed — this engine
/// never verifies those fields on read.
pub fn write_leaf_header(buf: &mut [u8], version: FormatVersion, magic: u32, numrecs: u16) {
    buf[0..4].copy_from_slice(&magic.to_be_bytes());
    buf[4..6].copy_from_slice(&0u16.to_be_bytes());
    buf[6..8].copy_from_slice(&numrecs.to_be_bytes());
    buf[8..12].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    buf[12..16].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    let _ = version;
}

fn parse_btree_header(
    buf: &[u8],
    version: FormatVersion,
    magic_v4: u32,
    magic_v5: u32,
    what: &'static str,
) -> Result<(u16, u16), RepairError> {
    match version {
        FormatVersion::V4 => {
            let hdr = XfsBtreeShortBlockV4::ref_from_prefix(buf)
                .map_err(|_| RepairError::Parse("buffer too small for V4 btree header"))?
                .0;
            if hdr.bb_magic.get() != magic_v4 {
                return Err(RepairError::BadMagic(what));
            }
            Ok((hdr.bb_level.get(), hdr.bb_numrecs.get()))
        }
        FormatVersion::V5 => {
            let hdr = XfsBtreeShortBlockV5::ref_from_prefix(buf)
                .map_err(|_| RepairError::Parse("buffer too small for V5 btree header"))?
                .0;
            if hdr.bb_magic.get() != magic_v5 {
                return Err(RepairError::BadMagic(what));
            }
            Ok((hdr.bb_level.get(), hdr.bb_numrecs.get()))
        }
    }
}

/// Magic numbers and key size identifying one AG btree type.
#[derive(Clone, Copy)]
pub struct BtreeShape {
    pub magic_v4: u32,
    pub magic_v5: u32,
    pub key_size: usize,
    pub what: &'static str,
}

pub const INOBT_SHAPE: BtreeShape =
    BtreeShape { magic_v4: 0x4941_4254, magic_v5: 0x4941_4233, key_size: 4, what: "inobt block" };
pub const FINOBT_SHAPE: BtreeShape =
    BtreeShape { magic_v4: 0x4649_4254, magic_v5: 0x4649_4233, key_size: 4, what: "finobt block" };
pub const BNOBT_SHAPE: BtreeShape =
    BtreeShape { magic_v4: 0x4142_544e, magic_v5: 0x4142_3342, key_size: 4, what: "bnobt block" };
pub const CNTBT_SHAPE: BtreeShape =
    BtreeShape { magic_v4: 0x4142_5443, magic_v5: 0x4142_3343, key_size: 4, what: "cntbt block" };
pub const RMAPBT_SHAPE: BtreeShape =
    BtreeShape { magic_v4: 0, magic_v5: 0x524d_4233, key_size: 20, what: "rmapbt block" };
pub const REFCOUNTBT_SHAPE: BtreeShape =
    BtreeShape { magic_v4: 0, magic_v5: 0x5246_3342, key_size: 4, what: "refcountbt block" };

/// Walk a short-form AG btree rooted at `root_block` (AG-relative),
/// `level` being the AGI/AGF-recorded tree height, and collect every
/// leaf record as `Rec`.
pub fn collect_records<R, Rec>(
    engine: &mut R,
    ctx: &FsContext,
    agno: u32,
    root_block: u32,
    level: u32,
    shape: BtreeShape,
) -> Result<Vec<Rec>, RepairError>
where
    R: IoReader,
    Rec: FromBytes + KnownLayout + Immutable + Copy,
{
    let root_level = level.saturating_sub(1);
    let hdr_size = btree_header_size(ctx.version);
    let block_size = ctx.block_size as usize;
    let rec_size = std::mem::size_of::<Rec>();

    let offset = ctx.ag_block_to_byte(agno, root_block);
    let buf = engine.read_at(offset, block_size, IoPhase::BtreeWalk)?;
    let (blk_level, numrecs) =
        parse_btree_header(buf, ctx.version, shape.magic_v4, shape.magic_v5, shape.what)?;
    if blk_level as u32 != root_level {
        return Err(RepairError::Structural("btree level mismatch"));
    }

    if root_level == 0 {
        return parse_leaf(buf, hdr_size, numrecs, rec_size, shape.what);
    }

    let mut current_blocks = extract_children(buf, hdr_size, numrecs, block_size, shape.key_size)?;

    for current_level in (0..root_level).rev() {
        current_blocks.sort_unstable();

        let requests: Vec<(u64, usize, usize)> = current_blocks
            .iter()
            .enumerate()
            .map(|(idx, &block)| (ctx.ag_block_to_byte(agno, block), block_size, idx))
            .collect();

        if current_level == 0 {
            let mut records = Vec::new();
            engine.coalesced_read_batch(
                &requests,
                |buf, _idx| {
                    let (_lvl, numrecs) =
                        parse_btree_header(buf, ctx.version, shape.magic_v4, shape.magic_v5, shape.what)?;
                    records.extend(parse_leaf(buf, hdr_size, numrecs, rec_size, shape.what)?);
                    Ok(())
                },
                IoPhase::BtreeWalk,
            )?;
            return Ok(records);
        }

        let mut next_blocks = Vec::new();
        engine.coalesced_read_batch(
            &requests,
            |buf, _idx| {
                let (blk_level, numrecs) =
                    parse_btree_header(buf, ctx.version, shape.magic_v4, shape.magic_v5, shape.what)?;
                if blk_level as u32 != current_level {
                    return Err(RepairError::Structural("btree level mismatch"));
                }
                next_blocks.extend(extract_children(buf, hdr_size, numrecs, block_size, shape.key_size)?);
                Ok(())
            },
            IoPhase::BtreeWalk,
        )?;
        current_blocks = next_blocks;
    }

    unreachable!("loop always returns at leaf level")
}

fn parse_leaf<Rec>(
    buf: &[u8],
    hdr_size: usize,
    numrecs: u16,
    rec_size: usize,
    what: &'static str,
) -> Result<Vec<Rec>, RepairError>
where
    Rec: FromBytes + KnownLayout + Immutable + Copy,
{
    let mut records = Vec::with_capacity(numrecs as usize);
    for i in 0..numrecs as usize {
        let start = hdr_size + i * rec_size;
        let end = start + rec_size;
        if end > buf.len() {
            return Err(RepairError::Parse("leaf record out of bounds"));
        }
        let rec = Rec::ref_from_prefix(&buf[start..])
            .map_err(|_| RepairError::Parse(what))?
            .0;
        records.push(*rec);
    }
    Ok(records)
}

/// Extract child AG-block pointers from an interior node. XFS lays out
/// keys and pointers based on `maxrecs` (how many fit in the block),
/// not the current `numrecs`.
fn extract_children(
    buf: &[u8],
    hdr_size: usize,
    numrecs: u16,
    block_size: usize,
    key_size: usize,
) -> Result<Vec<u32>, RepairError> {
    let ptr_size = 4usize;
    let maxrecs = (block_size - hdr_size) / (key_size + ptr_size);
    let ptr_offset = hdr_size + maxrecs * key_size;

    let mut children = Vec::with_capacity(numrecs as usize);
    for i in 0..numrecs as usize {
        let start = ptr_offset + i * ptr_size;
        let ptr = U32::ref_from_prefix(
            buf.get(start..).ok_or(RepairError::Parse("btree ptr out of bounds"))?,
        )
        .map_err(|_| RepairError::Parse("btree ptr out of bounds"))?
        .0;
        children.push(ptr.get());
    }
    Ok(children)
}

/// Inode B-tree record (16 bytes), shared by inobt and finobt.
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsInobtRec {
    pub ir_startino: U32,
    pub ir_holemask: U16,
    pub ir_count: u8,
    pub ir_freecount: u8,
    pub ir_free: U64,
}

impl XfsInobtRec {
    pub fn is_allocated(&self, i: u32) -> bool {
        (self.ir_free.get() & (1u64 << i)) == 0
    }

    pub fn start_ino(&self) -> u32 {
        self.ir_startino.get()
    }
}

/// Free-space B-tree record (8 bytes), shared by bnobt and cntbt.
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsAllocRec {
    pub ar_startblock: U32,
    pub ar_blockcount: U32,
}
