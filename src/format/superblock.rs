//! Typed superblock accessors — the Format Library's entry point.
//!
//! [`XfsDsb`] is the raw, byte-exact on-disk layout (all multi-byte
//! fields big-endian, via `zerocopy::byteorder`). [`FsContext`] is the
//! derived, host-endian view every other module works against; it is
//! built once in phase 1 and threaded by reference everywhere else.

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

const SB_MAGIC: u32 = 0x5846_5342; // "XFSB"

/// Incompat feature bits (superblock byte offset 216 on V5).
pub mod feat_incompat {
    pub const FTYPE: u32 = 1 << 0;
    pub const SPINODES: u32 = 1 << 1;
    pub const META_UUID: u32 = 1 << 2;
    pub const BIGTIME: u32 = 1 << 3;
    pub const NEEDSREPAIR: u32 = 1 << 4;
    pub const NREXT64: u32 = 1 << 5;
    pub const EXCHRANGE: u32 = 1 << 6;
}

/// Ro-compat feature bits (superblock byte offset 220 on V5).
pub mod feat_ro_compat {
    pub const FINOBT: u32 = 1 << 0;
    pub const RMAPBT: u32 = 1 << 1;
    pub const REFLINK: u32 = 1 << 2;
    pub const INOBTCNT: u32 = 1 << 3;
}

/// Legacy V4 `sb_features2` bits.
mod features2 {
    pub const FTYPE: u32 = 0x0200;
}

/// On-disk superblock, V4 portion (first 160 bytes) plus the V5 tail we
/// need (CRC, feature words, metadata UUID, log sequence number).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDsb {
    pub sb_magicnum: U32,
    pub sb_blocksize: U32,
    pub sb_dblocks: U64,
    pub sb_rblocks: U64,
    pub sb_rextents: U64,
    pub sb_uuid: [u8; 16],
    pub sb_logstart: U64,
    pub sb_rootino: U64,
    pub sb_rbmino: U64,
    pub sb_rsumino: U64,
    pub sb_rextsize: U32,
    pub sb_agblocks: U32,
    pub sb_agcount: U32,
    pub sb_rbmblocks: U32,
    pub sb_logblocks: U32,
    pub sb_versionnum: U16,
    pub sb_sectsize: U16,
    pub sb_inodesize: U16,
    pub sb_inopblock: U16,
    pub sb_fname: [u8; 12],
    pub sb_blocklog: u8,
    pub sb_sectlog: u8,
    pub sb_inodelog: u8,
    pub sb_inopblog: u8,
    pub sb_agblklog: u8,
    pub sb_rextslog: u8,
    pub sb_inprogress: u8,
    pub sb_imax_pct: u8,
    pub sb_icount: U64,
    pub sb_ifree: U64,
    pub sb_fdblocks: U64,
    pub sb_frextents: U64,
    pub sb_uquotino: U64,
    pub sb_gquotino: U64,
    pub sb_qflags: U16,
    pub sb_flags: u8,
    pub sb_shared_vn: u8,
    pub sb_inoalignmt: U32,
    pub sb_unit: U32,
    pub sb_width: U32,
    pub sb_dirblklog: u8,
    pub sb_logsectlog: u8,
    pub sb_logsectsize: U16,
    pub sb_logsunit: U32,
    pub sb_features2: U32,
    pub sb_bad_features2: U32,
    // ---- V5 tail ----
    pub sb_features_compat: U32,
    pub sb_features_ro_compat: U32,
    pub sb_features_incompat: U32,
    pub sb_features_log_incompat: U32,
    pub sb_crc: U32,
    pub sb_spino_align: U32,
    pub sb_pquotino: U64,
    pub sb_lsn: U64,
    pub sb_meta_uuid: [u8; 16],
}

/// Which on-disk format generation we're dealing with. V5 adds CRCs,
/// the metadata UUID, and the incompat/ro-compat/compat feature words;
/// V4 has neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V4,
    V5,
}

/// Derived, host-endian filesystem geometry. Built once by
/// [`FsContext::from_superblock`] in phase 1 and passed by reference
/// into every subsequent phase and worker.
#[derive(Debug, Clone)]
pub struct FsContext {
    pub version: FormatVersion,
    pub block_size: u32,
    pub block_log: u8,
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub ag_blk_log: u8,
    pub inode_size: u16,
    pub inodes_per_block: u16,
    pub inode_log: u8,
    pub inop_blog: u8,
    pub dir_blk_log: u8,
    pub root_ino: u64,
    pub sect_size: u16,
    pub rbm_ino: u64,
    pub rsum_ino: u64,
    pub uquota_ino: u64,
    pub gquota_ino: u64,
    pub qflags: u16,
    pub rextsize: u32,
    pub rextents: u64,
    pub dblocks: u64,
    /// Starting filesystem block of an internal log, 0 when the log is
    /// external (phase 2 locates an external log by device, out of
    /// scope for this crate's single-device `IoEngine`).
    pub log_start: u64,
    pub log_blocks: u32,
    /// Log stripe unit in bytes (`sb_logsunit`), stamped into a
    /// reformatted log header's `h_size` field (§4.4) so recovery knows
    /// the record size this reformat used.
    pub log_sunit: u32,
    /// The UUID inode/btree self-identity checks compare against: the
    /// meta-UUID when META_UUID is set, otherwise the plain superblock
    /// UUID (§4.6 step 1).
    pub uuid: [u8; 16],
    /// Does the filesystem store ftype in directory entries?
    pub has_ftype: bool,
    /// NREXT64: extent counts stored as 64-bit at inode offset 24.
    pub has_nrext64: bool,
    pub has_reflink: bool,
    pub has_rmapbt: bool,
    pub has_finobt: bool,
    pub has_bigtime: bool,
    pub has_needsrepair: bool,
    pub incompat: u32,
    pub ro_compat: u32,
}

impl FsContext {
    /// Parse the superblock from `buf` and build an [`FsContext`]. `buf`
    /// must hold at least the V4 portion; V5 fields are read only when
    /// the version nibble indicates V5 and the buffer is long enough.
    pub fn from_superblock(buf: &[u8]) -> Result<Self, RepairError> {
        let sb = XfsDsb::ref_from_prefix(buf)
            .map_err(|_| RepairError::Parse("buffer too small for superblock"))?
            .0;

        if sb.sb_magicnum.get() != SB_MAGIC {
            return Err(RepairError::BadMagic("superblock"));
        }

        let versionnum = sb.sb_versionnum.get();
        let version = if (versionnum & 0x000f) >= 5 {
            FormatVersion::V5
        } else {
            FormatVersion::V4
        };

        let features2 = sb.sb_features2.get();
        let has_ftype_v4 = (features2 & features2::FTYPE) != 0;

        let (incompat, ro_compat) = if version == FormatVersion::V5 {
            (sb.sb_features_incompat.get(), sb.sb_features_ro_compat.get())
        } else {
            (0, 0)
        };

        let has_ftype = version == FormatVersion::V5 || has_ftype_v4;
        let has_nrext64 = incompat & feat_incompat::NREXT64 != 0;
        let has_bigtime = incompat & feat_incompat::BIGTIME != 0;
        let has_needsrepair = incompat & feat_incompat::NEEDSREPAIR != 0;
        let has_reflink = ro_compat & feat_ro_compat::REFLINK != 0;
        let has_rmapbt = ro_compat & feat_ro_compat::RMAPBT != 0;
        let has_finobt = ro_compat & feat_ro_compat::FINOBT != 0;
        let has_meta_uuid = incompat & feat_incompat::META_UUID != 0;
        let uuid = if has_meta_uuid { sb.sb_meta_uuid } else { sb.sb_uuid };

        Ok(FsContext {
            version,
            block_size: sb.sb_blocksize.get(),
            block_log: sb.sb_blocklog,
            ag_count: sb.sb_agcount.get(),
            ag_blocks: sb.sb_agblocks.get(),
            ag_blk_log: sb.sb_agblklog,
            inode_size: sb.sb_inodesize.get(),
            inodes_per_block: sb.sb_inopblock.get(),
            inode_log: sb.sb_inodelog,
            inop_blog: sb.sb_inopblog,
            dir_blk_log: sb.sb_dirblklog,
            root_ino: sb.sb_rootino.get(),
            sect_size: sb.sb_sectsize.get(),
            rbm_ino: sb.sb_rbmino.get(),
            rsum_ino: sb.sb_rsumino.get(),
            uquota_ino: sb.sb_uquotino.get(),
            gquota_ino: sb.sb_gquotino.get(),
            qflags: sb.sb_qflags.get(),
            rextsize: sb.sb_rextsize.get(),
            rextents: sb.sb_rextents.get(),
            dblocks: sb.sb_dblocks.get(),
            log_start: sb.sb_logstart.get(),
            log_blocks: sb.sb_logblocks.get(),
            log_sunit: sb.sb_logsunit.get(),
            uuid,
            has_ftype,
            has_nrext64,
            has_reflink,
            has_rmapbt,
            has_finobt,
            has_bigtime,
            has_needsrepair,
            incompat,
            ro_compat,
        })
    }

    /// Convert an absolute inode number to (ag_number, ag_relative_inode).
    pub fn ino_to_agno(&self, ino: u64) -> u32 {
        (ino >> (self.inop_blog as u64 + self.ag_blk_log as u64)) as u32
    }

    pub fn ino_to_agino(&self, ino: u64) -> u32 {
        let mask = (1u64 << (self.inop_blog as u64 + self.ag_blk_log as u64)) - 1;
        (ino & mask) as u32
    }

    /// Convert AG-relative inode to absolute inode number.
    pub fn agino_to_ino(&self, agno: u32, agino: u32) -> u64 {
        ((agno as u64) << (self.inop_blog as u64 + self.ag_blk_log as u64)) | (agino as u64)
    }

    /// Byte offset of an AG-relative block within the filesystem.
    pub fn ag_block_to_byte(&self, agno: u32, agblock: u32) -> u64 {
        let abs_block = (agno as u64) * (self.ag_blocks as u64) + (agblock as u64);
        abs_block << self.block_log as u64
    }

    /// Absolute filesystem block number for an (AG, AG-block) pair.
    pub fn ag_block_to_fsblock(&self, agno: u32, agblock: u32) -> u64 {
        (agno as u64) * (self.ag_blocks as u64) + (agblock as u64)
    }

    /// Byte offset of the start of an AG.
    pub fn ag_start_byte(&self, agno: u32) -> u64 {
        (agno as u64) * (self.ag_blocks as u64) * (self.block_size as u64)
    }

    /// Byte offset of the AGI header for a given AG (disk-address sector 2).
    pub fn agi_byte_offset(&self, agno: u32) -> u64 {
        self.ag_start_byte(agno) + 2 * self.sect_size as u64
    }

    /// Byte offset of the AGF header for a given AG (disk-address sector 1).
    pub fn agf_byte_offset(&self, agno: u32) -> u64 {
        self.ag_start_byte(agno) + self.sect_size as u64
    }

    /// Byte offset of the AGFL for a given AG (disk-address sector 3).
    pub fn agfl_byte_offset(&self, agno: u32) -> u64 {
        self.ag_start_byte(agno) + 3 * self.sect_size as u64
    }

    /// Number of blocks in the last AG, which may be shorter than `ag_blocks`.
    pub fn ag_size(&self, agno: u32) -> u32 {
        if agno + 1 == self.ag_count {
            let full = self.ag_blocks as u64 * agno as u64;
            (self.dblocks - full) as u32
        } else {
            self.ag_blocks
        }
    }

    /// Number of filesystem blocks in a directory block.
    pub fn dir_blk_fsblocks(&self) -> u32 {
        1u32 << self.dir_blk_log
    }

    /// Size of a directory block in bytes.
    pub fn dir_blk_size(&self) -> u32 {
        self.block_size * self.dir_blk_fsblocks()
    }

    /// Byte offset of the block containing `ino`, and the inode's byte
    /// offset within that block.
    pub fn ino_to_disk_position(&self, ino: u64) -> (u64, usize) {
        let agno = self.ino_to_agno(ino);
        let agino = self.ino_to_agino(ino);
        let ag_block = agino >> self.inop_blog;
        let block_byte = self.ag_block_to_byte(agno, ag_block);
        let within = (agino & ((1u32 << self.inop_blog) - 1)) as usize * self.inode_size as usize;
        (block_byte, within)
    }

    /// Whether `ino` is one of the well-known realtime/quota metadata
    /// inumbers recorded in the superblock (phase 2 uses this to decide
    /// what counts as "missing known-inumber inode").
    pub fn is_metadata_ino(&self, ino: u64) -> bool {
        ino != 0
            && (ino == self.rbm_ino
                || ino == self.rsum_ino
                || ino == self.uquota_ino
                || ino == self.gquota_ino)
    }
}

/// Fields a geometry majority-vote (phase 1) cares about: a fixed,
/// small set compared between the primary superblock and every AG's
/// secondary copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryFields {
    pub block_size: u32,
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub inode_size: u16,
    pub sect_size: u16,
}

impl From<&FsContext> for GeometryFields {
    fn from(ctx: &FsContext) -> Self {
        GeometryFields {
            block_size: ctx.block_size,
            ag_blocks: ctx.ag_blocks,
            ag_count: ctx.ag_count,
            inode_size: ctx.inode_size,
            sect_size: ctx.sect_size,
        }
    }
}

/// Small hand-built fixtures shared by unit tests across the `format`
/// and `dir` modules, since none of this crate's tests drive a real
/// filesystem image (§8 test-tooling notes).
#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn minimal_ctx(has_ftype: bool) -> FsContext {
        FsContext {
            version: FormatVersion::V5,
            block_size: 4096,
            block_log: 12,
            ag_count: 4,
            ag_blocks: 1024,
            ag_blk_log: 10,
            inode_size: 512,
            inodes_per_block: 8,
            inode_log: 9,
            inop_blog: 3,
            dir_blk_log: 0,
            root_ino: 128,
            sect_size: 512,
            rbm_ino: 0,
            rsum_ino: 0,
            uquota_ino: 0,
            gquota_ino: 0,
            qflags: 0,
            rextsize: 0,
            rextents: 0,
            dblocks: 4096,
            log_start: 0,
            log_blocks: 0,
            log_sunit: 0,
            uuid: [0u8; 16],
            has_ftype,
            has_nrext64: false,
            has_reflink: false,
            has_rmapbt: false,
            has_finobt: false,
            has_bigtime: false,
            has_needsrepair: false,
            incompat: 0,
            ro_compat: 0,
        }
    }
}
