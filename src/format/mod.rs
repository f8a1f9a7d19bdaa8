//! Format Library (§4): byte-exact, zerocopy-typed on-disk structures,
//! kept free of any I/O or incore bookkeeping so it can be unit tested
//! against hand-built buffers alone.

pub mod ag;
pub mod attr;
pub mod bmbt;
pub mod btree;
pub mod dir;
pub mod extent;
pub mod inode;
pub mod journal;
pub mod quota;
pub mod refcount;
pub mod rmap;
pub mod superblock;
pub mod types;
