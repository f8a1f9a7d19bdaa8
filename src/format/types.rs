//! Narrow on-disk numeric types, named the way the on-disk format
//! documents them so phase code reads like the spec it implements.

/// Absolute inode number.
pub type XfsIno = u64;

/// Allocation-group number.
pub type XfsAgnumber = u32;

/// AG-relative block number.
pub type XfsAgblock = u32;

/// AG-relative inode number (within the AG).
pub type XfsAgino = u32;

/// Absolute filesystem block number.
pub type XfsFsblock = u64;

/// File offset in filesystem blocks.
pub type XfsFileoff = u64;

/// Block count.
pub type XfsFilblks = u64;

/// Realtime-group number.
pub type XfsRtgnumber = u32;

/// Realtime-group-relative extent number.
pub type XfsRtxnum = u64;
