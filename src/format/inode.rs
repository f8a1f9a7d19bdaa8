//! Dinode core accessors: header layout for both on-disk core
//! generations, the mode/format compatibility table (§4.6 step 2), and
//! the flushiter/cowextsize union (design notes: modeled as an explicit
//! sum type rather than a raw union).

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

const DINODE_MAGIC: u16 = 0x494e; // "IN"

pub const XFS_DINODE_FMT_DEV: u8 = 0;
pub const XFS_DINODE_FMT_LOCAL: u8 = 1;
pub const XFS_DINODE_FMT_EXTENTS: u8 = 2;
pub const XFS_DINODE_FMT_BTREE: u8 = 3;
pub const XFS_DINODE_FMT_UUID: u8 = 4;
/// Metadata-btree root (realtime rmap/refcount metadata inodes), V5 only.
pub const XFS_DINODE_FMT_META_BTREE: u8 = 5;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFSOCK: u16 = 0o140000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFIFO: u16 = 0o010000;

/// `di_flags` bits.
pub mod flags {
    pub const REALTIME: u16 = 1 << 0;
    pub const PREALLOC: u16 = 1 << 1;
    pub const NEWRTBM: u16 = 1 << 2;
    pub const IMMUTABLE: u16 = 1 << 3;
    pub const APPEND: u16 = 1 << 4;
    pub const SYNC: u16 = 1 << 5;
    pub const NOATIME: u16 = 1 << 6;
    pub const NODUMP: u16 = 1 << 7;
    pub const RTINHERIT: u16 = 1 << 8;
    pub const PROJINHERIT: u16 = 1 << 9;
    pub const NOSYMLINKS: u16 = 1 << 10;
    pub const EXTSZINHERIT: u16 = 1 << 11;
    pub const NODEFRAG: u16 = 1 << 12;
    pub const FILESTREAM: u16 = 1 << 13;
}

/// `di_flags2` bits (V5 only).
pub mod flags2 {
    pub const DAX: u32 = 1 << 0;
    pub const REFLINK: u32 = 1 << 1;
    pub const COWEXTSIZE: u32 = 1 << 2;
    pub const BIGTIME: u32 = 1 << 3;
    pub const NREXT64: u32 = 1 << 4;
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsTimestamp {
    pub t_sec: U32,
    pub t_nsec: U32,
}

/// V4 dinode core (96 bytes). `di_flushiter`/`di_pad` at byte offset 24
/// are overlaid in V5 either by the NREXT64 extent count or by a
/// `di_used_blocks`/`di_cowextsize` pair — see [`InodeVersionFields`].
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDinodeCore {
    pub di_magic: U16,
    pub di_mode: U16,
    pub di_version: u8,
    pub di_format: u8,
    pub di_onlink: U16,
    pub di_uid: U32,
    pub di_gid: U32,
    pub di_nlink: U32,
    pub di_projid: U16,
    pub di_projid_hi: U16,
    pub di_pad: [u8; 6],
    pub di_flushiter: U16,
    pub di_atime: XfsTimestamp,
    pub di_mtime: XfsTimestamp,
    pub di_ctime: XfsTimestamp,
    pub di_size: U64,
    pub di_nblocks: U64,
    pub di_extsize: U32,
    pub di_nextents: U32,
    pub di_anextents: U16,
    pub di_forkoff: u8,
    pub di_aformat: u8,
    pub di_dmevmask: U32,
    pub di_dmstate: U16,
    pub di_flags: U16,
    pub di_gen: U32,
}

/// V5 tail (bytes 96..176): CRC, change count, LSN, self-identifying
/// UUID/inumber, crtime, flags2, cowextsize, padding.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDinodeV5Tail {
    pub di_crc: U32,
    pub di_changecount: U64,
    pub di_lsn: U64,
    pub di_flags2: U32,
    pub di_cowextsize: U32,
    pub di_pad2: [u8; 12],
    pub di_crtime: XfsTimestamp,
    pub di_ino: U64,
    pub di_uuid: [u8; 16],
}

pub const V4_CORE_SIZE: usize = 96;
pub const V5_CORE_SIZE: usize = 176;

/// The byte-offset-24 overlay, resolved into an explicit sum type
/// rather than read as a raw union (design notes).
#[derive(Debug, Clone, Copy)]
pub enum FlushiterOverlay {
    /// Pre-NREXT64 legacy inode: the field is a flush-iteration counter
    /// we don't need and di_pad is truly padding.
    Legacy { flushiter: u16 },
    /// NREXT64 inode: the full 64-bit word holds the data-fork extent
    /// count in its low 48 bits.
    Nrext64 { data_nextents: u32 },
}

/// Parsed, host-endian inode metadata used by every phase-3/4 consumer.
pub struct InodeInfo {
    pub ino: u64,
    pub mode: u16,
    pub version: u8,
    pub format: u8,
    pub aformat: u8,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub projid: u32,
    pub nextents: u32,
    pub anextents: u16,
    pub forkoff: u8,
    pub flags: u16,
    pub flags2: u32,
    pub extsize: u32,
    pub cowextsize: u32,
    pub gen: u32,
    pub mtime_sec: u32,
    pub mtime_nsec: u32,
    pub atime_sec: u32,
    pub atime_nsec: u32,
    pub ctime_sec: u32,
    pub ctime_nsec: u32,
    pub nblocks: u64,
    pub overlay: FlushiterOverlay,
    /// Byte offset of the data fork within the on-disk inode.
    pub data_fork_offset: usize,
    /// Byte size available to the data fork (attr-fork-aware).
    pub data_fork_size: usize,
}

impl InodeInfo {
    pub fn is_dir(&self) -> bool {
        (self.mode & S_IFMT) == S_IFDIR
    }
    pub fn is_regular(&self) -> bool {
        (self.mode & S_IFMT) == S_IFREG
    }
    pub fn is_symlink(&self) -> bool {
        (self.mode & S_IFMT) == S_IFLNK
    }
    pub fn is_device(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFBLK | S_IFCHR)
    }
    pub fn is_special(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFBLK | S_IFCHR | S_IFIFO | S_IFSOCK)
    }
    pub fn has_attr_fork(&self) -> bool {
        self.forkoff != 0
    }
    /// Byte offset of the attribute fork, or `None` if there is none.
    pub fn attr_fork_offset(&self) -> Option<usize> {
        if self.forkoff == 0 {
            None
        } else {
            Some(self.data_fork_offset + self.forkoff as usize * 8)
        }
    }
    pub fn has_flag(&self, bit: u16) -> bool {
        self.flags & bit != 0
    }
    pub fn has_flag2(&self, bit: u32) -> bool {
        self.flags2 & bit != 0
    }
}

/// Mode/format compatibility table (§4.6 step 2). Returns `true` when
/// `fmt` is a legal data-fork format for a file of kind `mode & S_IFMT`.
pub fn mode_format_compatible(mode: u16, format: u8) -> bool {
    match mode & S_IFMT {
        S_IFDIR => matches!(
            format,
            XFS_DINODE_FMT_LOCAL | XFS_DINODE_FMT_EXTENTS | XFS_DINODE_FMT_BTREE
        ),
        S_IFREG => matches!(
            format,
            XFS_DINODE_FMT_EXTENTS | XFS_DINODE_FMT_BTREE | XFS_DINODE_FMT_META_BTREE
        ),
        S_IFLNK => matches!(format, XFS_DINODE_FMT_LOCAL | XFS_DINODE_FMT_EXTENTS),
        S_IFBLK | S_IFCHR => format == XFS_DINODE_FMT_DEV,
        S_IFIFO | S_IFSOCK => format == XFS_DINODE_FMT_DEV || format == XFS_DINODE_FMT_LOCAL,
        _ => false,
    }
}

/// §4.6 step 5: a nanosecond field ≥ 10^9 is always invalid.
pub fn nsec_valid(nsec: u32) -> bool {
    nsec < 1_000_000_000
}

/// Parse a dinode core (and, on V5, its tail) from `buf` at offset 0.
///
/// `ino` is the absolute inode number this buffer is expected to hold
/// (the caller cross-checks it against `di_ino` on V5 separately, since
/// that's a structural self-identity check rather than a parse step).
/// `has_nrext64` comes from the superblock incompat bits.
pub fn parse_inode_core(
    buf: &[u8],
    ino: u64,
    is_v5: bool,
    has_nrext64: bool,
    inode_size: u16,
) -> Result<InodeInfo, RepairError> {
    let core = XfsDinodeCore::ref_from_prefix(buf)
        .map_err(|_| RepairError::Parse("buffer too small for dinode core"))?
        .0;

    if core.di_magic.get() != DINODE_MAGIC {
        return Err(RepairError::BadMagic("dinode"));
    }

    let data_fork_offset = if is_v5 { V5_CORE_SIZE } else { V4_CORE_SIZE };

    let overlay = if has_nrext64 {
        if buf.len() < 32 {
            return Err(RepairError::Parse("buffer too small for nrext64 extent count"));
        }
        let big = u64::from_be_bytes(buf[24..32].try_into().unwrap());
        FlushiterOverlay::Nrext64 { data_nextents: (big & 0x0000_FFFF_FFFF_FFFF) as u32 }
    } else {
        FlushiterOverlay::Legacy { flushiter: core.di_flushiter.get() }
    };

    let nextents = match overlay {
        FlushiterOverlay::Nrext64 { data_nextents } => data_nextents,
        FlushiterOverlay::Legacy { .. } => core.di_nextents.get(),
    };

    let (flags2, cowextsize) = if is_v5 && buf.len() >= V5_CORE_SIZE + 16 {
        let tail = XfsDinodeV5Tail::ref_from_prefix(&buf[V4_CORE_SIZE..])
            .map_err(|_| RepairError::Parse("buffer too small for dinode v5 tail"))?
            .0;
        (tail.di_flags2.get(), tail.di_cowextsize.get())
    } else {
        (0, 0)
    };

    let projid = (core.di_projid_hi.get() as u32) << 16 | core.di_projid.get() as u32;
    let data_fork_size = inode_size as usize - data_fork_offset;

    Ok(InodeInfo {
        ino,
        mode: core.di_mode.get(),
        version: core.di_version,
        format: core.di_format,
        aformat: core.di_aformat,
        size: core.di_size.get(),
        uid: core.di_uid.get(),
        gid: core.di_gid.get(),
        nlink: core.di_nlink.get(),
        projid,
        nextents,
        anextents: core.di_anextents.get(),
        forkoff: core.di_forkoff,
        flags: core.di_flags.get(),
        flags2,
        extsize: core.di_extsize.get(),
        cowextsize,
        gen: core.di_gen.get(),
        mtime_sec: core.di_mtime.t_sec.get(),
        mtime_nsec: core.di_mtime.t_nsec.get(),
        atime_sec: core.di_atime.t_sec.get(),
        atime_nsec: core.di_atime.t_nsec.get(),
        ctime_sec: core.di_ctime.t_sec.get(),
        ctime_nsec: core.di_ctime.t_nsec.get(),
        nblocks: core.di_nblocks.get(),
        overlay,
        data_fork_offset,
        data_fork_size: if core.di_forkoff != 0 {
            core.di_forkoff as usize * 8
        } else {
            data_fork_size
        },
    })
}

/// Verify the V5 self-identity fields (inumber + UUID) against the
/// expected values. Non-CRC filesystems skip this (no tail to check).
pub fn verify_v5_identity(buf: &[u8], expected_ino: u64, expected_uuid: &[u8; 16]) -> bool {
    let Some(tail) = XfsDinodeV5Tail::ref_from_prefix(&buf[V4_CORE_SIZE..]).ok().map(|(t, _)| t)
    else {
        return false;
    };
    tail.di_ino.get() == expected_ino && &tail.di_uuid == expected_uuid
}
