//! Reference-count btree record shape (V5 only, reflink filesystems).
//! One record per physical extent run sharing the same reference count.

use zerocopy::byteorder::big_endian::U32;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;

/// On-disk refcount btree record (12 bytes): startblock, blockcount,
/// and the shared-reference count for that run.
#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct XfsRefcountRec {
    pub rc_startblock: U32,
    pub rc_blockcount: U32,
    pub rc_refcount: U32,
}

#[derive(Debug, Clone, Copy)]
pub struct RefcountEntry {
    pub start_block: u32,
    pub block_count: u32,
    pub refcount: u32,
}

impl XfsRefcountRec {
    pub fn unpack(&self) -> RefcountEntry {
        RefcountEntry {
            start_block: self.rc_startblock.get(),
            block_count: self.rc_blockcount.get(),
            refcount: self.rc_refcount.get(),
        }
    }

    pub fn pack(e: &RefcountEntry) -> Self {
        XfsRefcountRec {
            rc_startblock: U32::new(e.start_block),
            rc_blockcount: U32::new(e.block_count),
            rc_refcount: U32::new(e.refcount),
        }
    }
}

pub fn parse_refcount_record(buf: &[u8]) -> Result<RefcountEntry, RepairError> {
    let rec = XfsRefcountRec::ref_from_prefix(buf)
        .map_err(|_| RepairError::Parse("buffer too small for refcount record"))?
        .0;
    Ok(rec.unpack())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let entry = RefcountEntry { start_block: 100, block_count: 8, refcount: 3 };
        let rec = XfsRefcountRec::pack(&entry);
        let back = rec.unpack();
        assert_eq!(back.start_block, 100);
        assert_eq!(back.block_count, 8);
        assert_eq!(back.refcount, 3);
    }
}
