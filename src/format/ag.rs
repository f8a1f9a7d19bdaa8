//! AG header accessors: AGI (inode allocation) and AGF (free space).

use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;
use crate::format::superblock::FormatVersion;

const AGI_MAGIC: u32 = 0x5841_4749; // "XAGI"
const AGF_MAGIC: u32 = 0x5841_4746; // "XAGF"

/// Number of unlinked-inode hash buckets in the AGI.
pub const AGI_UNLINKED_BUCKETS: usize = 64;
/// Sentinel meaning "bucket empty" / "no next in chain".
pub const NULL_AGINO: u32 = 0xffff_ffff;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAgi {
    pub agi_magicnum: U32,
    pub agi_versionnum: U32,
    pub agi_seqno: U32,
    pub agi_length: U32,
    pub agi_count: U32,
    pub agi_root: U32,
    pub agi_level: U32,
    pub agi_freecount: U32,
    pub agi_newino: U32,
    pub agi_dirino: U32,
    pub agi_unlinked: [U32; AGI_UNLINKED_BUCKETS],
    // V5 adds: uuid, crc, pad, lsn, free-inode btree root/level.
    pub agi_free_root: U32,
    pub agi_free_level: U32,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAgf {
    pub agf_magicnum: U32,
    pub agf_versionnum: U32,
    pub agf_seqno: U32,
    pub agf_length: U32,
    pub agf_roots: [U32; 2], // bnobt (by-block), cntbt (by-length)
    pub agf_spare0: U32,
    pub agf_levels: [U32; 2],
    pub agf_spare1: U32,
    pub agf_flfirst: U32,
    pub agf_fllast: U32,
    pub agf_flcount: U32,
    pub agf_freeblks: U32,
    pub agf_longest: U32,
    pub agf_btreeblks: U32,
    // V5 adds: uuid, rmap root/level, refcount root/level, crc, lsn.
    pub agf_rmap_root: U32,
    pub agf_rmap_level: U32,
    pub agf_refcount_root: U32,
    pub agf_refcount_level: U32,
}

/// Parsed AGI fields needed for inode-btree traversal and unlinked-list
/// handling (phase 3 step 1).
pub struct AgiInfo {
    pub ag_number: u32,
    pub inobt_root: u32,
    pub inobt_level: u32,
    pub finobt_root: u32,
    pub finobt_level: u32,
    pub count: u32,
    pub freecount: u32,
    pub unlinked: [u32; AGI_UNLINKED_BUCKETS],
}

impl AgiInfo {
    pub fn from_buf(buf: &[u8], agno: u32, version: FormatVersion) -> Result<Self, RepairError> {
        let agi = XfsAgi::ref_from_prefix(buf)
            .map_err(|_| RepairError::Parse("buffer too small for AGI"))?
            .0;

        if agi.agi_magicnum.get() != AGI_MAGIC {
            return Err(RepairError::BadMagic("AGI header"));
        }
        if agi.agi_seqno.get() != agno {
            return Err(RepairError::Structural("AGI sequence number mismatch"));
        }

        let (finobt_root, finobt_level) = match version {
            FormatVersion::V5 => (agi.agi_free_root.get(), agi.agi_free_level.get()),
            FormatVersion::V4 => (0, 0),
        };

        let mut unlinked = [0u32; AGI_UNLINKED_BUCKETS];
        for (i, slot) in unlinked.iter_mut().enumerate() {
            *slot = agi.agi_unlinked[i].get();
        }

        Ok(AgiInfo {
            ag_number: agno,
            inobt_root: agi.agi_root.get(),
            inobt_level: agi.agi_level.get(),
            finobt_root,
            finobt_level,
            count: agi.agi_count.get(),
            freecount: agi.agi_freecount.get(),
            unlinked,
        })
    }

    /// Buckets that are non-empty — candidates the orchestrator must
    /// clear (or preserve, read-only) before phase 3 inode processing.
    pub fn non_empty_unlinked_buckets(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.unlinked
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != NULL_AGINO && v != 0)
            .map(|(i, &v)| (i, v))
    }
}

/// Parsed AGF fields needed for free-space bookkeeping and refcount /
/// reverse-map btree traversal (phase 1, phase 4, phase 5).
pub struct AgfInfo {
    pub ag_number: u32,
    pub length: u32,
    pub bnobt_root: u32,
    pub cntbt_root: u32,
    pub bnobt_level: u32,
    pub cntbt_level: u32,
    pub freeblks: u32,
    pub longest: u32,
    pub rmap_root: u32,
    pub rmap_level: u32,
    pub refcount_root: u32,
    pub refcount_level: u32,
}

impl AgfInfo {
    pub fn from_buf(buf: &[u8], agno: u32, version: FormatVersion) -> Result<Self, RepairError> {
        let agf = XfsAgf::ref_from_prefix(buf)
            .map_err(|_| RepairError::Parse("buffer too small for AGF"))?
            .0;

        if agf.agf_magicnum.get() != AGF_MAGIC {
            return Err(RepairError::BadMagic("AGF header"));
        }
        if agf.agf_seqno.get() != agno {
            return Err(RepairError::Structural("AGF sequence number mismatch"));
        }

        let (rmap_root, rmap_level, refcount_root, refcount_level) = match version {
            FormatVersion::V5 => (
                agf.agf_rmap_root.get(),
                agf.agf_rmap_level.get(),
                agf.agf_refcount_root.get(),
                agf.agf_refcount_level.get(),
            ),
            FormatVersion::V4 => (0, 0, 0, 0),
        };

        Ok(AgfInfo {
            ag_number: agno,
            length: agf.agf_length.get(),
            bnobt_root: agf.agf_roots[0].get(),
            cntbt_root: agf.agf_roots[1].get(),
            bnobt_level: agf.agf_levels[0].get(),
            cntbt_level: agf.agf_levels[1].get(),
            freeblks: agf.agf_freeblks.get(),
            longest: agf.agf_longest.get(),
            rmap_root,
            rmap_level,
            refcount_root,
            refcount_level,
        })
    }
}
