use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;
use crate::format::dir::DirEntryRecord;
use crate::format::superblock::FsContext;

/// Shortform directory header (when parent inode fits in 4 bytes).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDirSfHdr4 {
    pub count: u8,
    pub i8count: u8,
    pub parent: U32,
}

/// Shortform directory header (when parent inode needs 8 bytes).
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDirSfHdr8 {
    pub count: u8,
    pub i8count: u8,
    pub parent: U64,
}

/// Parse a shortform directory out of the inode's data fork, including
/// the synthesized "." and ".." entries (shortform stores the parent
/// inumber in the header, not as a real entry).
pub fn parse_shortform_dir(
    fork_buf: &[u8],
    parent_ino: u64,
    ctx: &FsContext,
) -> Result<Vec<DirEntryRecord>, RepairError> {
    if fork_buf.len() < 6 {
        return Err(RepairError::Parse("shortform dir too small"));
    }

    let i8count = fork_buf[1];
    let use_8byte = i8count > 0;

    let (entry_count, hdr_parent_ino, hdr_size) = if use_8byte {
        let hdr = XfsDirSfHdr8::ref_from_prefix(fork_buf)
            .map_err(|_| RepairError::Parse("shortform hdr8 parse failed"))?
            .0;
        (hdr.i8count as usize, hdr.parent.get(), 10usize)
    } else {
        let hdr = XfsDirSfHdr4::ref_from_prefix(fork_buf)
            .map_err(|_| RepairError::Parse("shortform hdr4 parse failed"))?
            .0;
        (hdr.count as usize, hdr.parent.get() as u64, 6usize)
    };

    let mut entries = Vec::with_capacity(entry_count + 2);
    entries.push(DirEntryRecord { child_ino: parent_ino, name: b".".to_vec(), file_type: 0, block_offset: 0 });
    entries.push(DirEntryRecord { child_ino: hdr_parent_ino, name: b"..".to_vec(), file_type: 0, block_offset: 0 });

    let ino_size: usize = if use_8byte { 8 } else { 4 };
    let mut offset = hdr_size;

    for _ in 0..entry_count {
        if offset >= fork_buf.len() {
            return Err(RepairError::Parse("shortform entry past end"));
        }

        let namelen = fork_buf[offset] as usize;
        let name_start = offset + 1 + 2;
        let name_end = name_start + namelen;

        if name_end > fork_buf.len() {
            return Err(RepairError::Parse("shortform entry name out of bounds"));
        }

        let name = fork_buf[name_start..name_end].to_vec();

        let ftype_size = if ctx.has_ftype { 1 } else { 0 };
        let ftype = if ctx.has_ftype { fork_buf[name_end] } else { 0 };

        let ino_start = name_end + ftype_size;
        let child_ino = if use_8byte {
            if ino_start + 8 > fork_buf.len() {
                return Err(RepairError::Parse("shortform 8-byte ino out of bounds"));
            }
            u64::from_be_bytes(fork_buf[ino_start..ino_start + 8].try_into().unwrap())
        } else {
            if ino_start + 4 > fork_buf.len() {
                return Err(RepairError::Parse("shortform 4-byte ino out of bounds"));
            }
            u32::from_be_bytes(fork_buf[ino_start..ino_start + 4].try_into().unwrap()) as u64
        };

        entries.push(DirEntryRecord { child_ino, name, file_type: ftype, block_offset: offset as u32 });

        offset = ino_start + ino_size;
    }

    Ok(entries)
}

/// Byte size a shortform directory holding `entries` (excluding the
/// synthesized "." and ".." entries, which shortform never stores)
/// would occupy, used by directory rebuild (§4.8 step 6) to decide
/// whether the surviving entry set still fits embedded in the inode.
pub fn shortform_size(entries: &[DirEntryRecord], parent_ino: u64, ctx: &FsContext) -> usize {
    let use_8byte = parent_ino > u32::MAX as u64 || entries.iter().any(|e| e.child_ino > u32::MAX as u64);
    let hdr_size = if use_8byte { 10 } else { 6 };
    let ino_size = if use_8byte { 8 } else { 4 };
    let ftype_size = if ctx.has_ftype { 1 } else { 0 };

    let mut size = hdr_size;
    for e in entries {
        if e.is_dot() || e.is_dotdot() {
            continue;
        }
        size += 1 + 2 + e.name.len() + ftype_size + ino_size;
    }
    size
}

/// Re-encode a shortform directory fork from the surviving entry set
/// (the "re-initialize" step of directory rebuild, §4.8 step 6). "."
/// and ".." are dropped from `entries` since shortform synthesizes
/// them from `parent_ino`/the owning inumber instead of storing them.
pub fn encode_shortform_dir(entries: &[DirEntryRecord], parent_ino: u64, ctx: &FsContext) -> Vec<u8> {
    let use_8byte = parent_ino > u32::MAX as u64 || entries.iter().any(|e| e.child_ino > u32::MAX as u64);
    let real_entries: Vec<&DirEntryRecord> =
        entries.iter().filter(|e| !e.is_dot() && !e.is_dotdot()).collect();

    let mut buf = Vec::with_capacity(shortform_size(entries, parent_ino, ctx));
    buf.push(real_entries.len().min(255) as u8);
    buf.push(if use_8byte { real_entries.len().min(255) as u8 } else { 0 });
    if use_8byte {
        buf.extend_from_slice(&parent_ino.to_be_bytes());
    } else {
        buf.extend_from_slice(&(parent_ino as u32).to_be_bytes());
    }

    for e in &real_entries {
        buf.push(e.name.len() as u8);
        // Offset tag: unused by shortform lookups, kept zero.
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&e.name);
        if ctx.has_ftype {
            buf.push(e.file_type);
        }
        if use_8byte {
            buf.extend_from_slice(&e.child_ino.to_be_bytes());
        } else {
            buf.extend_from_slice(&(e.child_ino as u32).to_be_bytes());
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> FsContext {
        crate::format::superblock::tests::minimal_ctx(true)
    }

    #[test]
    fn round_trips_entries_through_encode_and_parse() {
        let ctx = test_ctx();
        let entries = vec![
            DirEntryRecord { child_ino: 10, name: b"alpha".to_vec(), file_type: 1, block_offset: 0 },
            DirEntryRecord { child_ino: 11, name: b"beta".to_vec(), file_type: 1, block_offset: 0 },
        ];
        let encoded = encode_shortform_dir(&entries, 128, &ctx);
        let parsed = parse_shortform_dir(&encoded, 128, &ctx).unwrap();
        let names: Vec<_> = parsed.iter().filter(|e| !e.is_dot() && !e.is_dotdot()).collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].name, b"alpha");
        assert_eq!(names[0].child_ino, 10);
        assert_eq!(names[1].child_ino, 11);
    }
}
