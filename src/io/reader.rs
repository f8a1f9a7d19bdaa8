//! The `IoReader` trait is the seam between the Format Library /
//! phases and the Buffer Service (`engine::IoEngine`). Phase code reads
//! through this trait so unit tests can supply an in-memory reader
//! instead of opening a device.

use std::fmt;
use std::io::Write;

use crate::error::RepairError;

/// I/O phase labels for analytics and diagnostics.
#[derive(Debug, Clone, Copy)]
pub enum IoPhase {
    Superblock,
    Agi,
    Agf,
    Agfl,
    InobtWalk,
    BtreeWalk,
    InodeChunks,
    BmbtWalk,
    DirExtents,
    RmapWalk,
    RefcountWalk,
    RtBitmap,
    Quota,
    Journal,
    TransactionWrite,
}

impl fmt::Display for IoPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superblock => write!(f, "superblock"),
            Self::Agi => write!(f, "agi"),
            Self::Agf => write!(f, "agf"),
            Self::Agfl => write!(f, "agfl"),
            Self::InobtWalk => write!(f, "inobt_walk"),
            Self::BtreeWalk => write!(f, "btree_walk"),
            Self::InodeChunks => write!(f, "inode_chunks"),
            Self::BmbtWalk => write!(f, "bmbt_walk"),
            Self::DirExtents => write!(f, "dir_extents"),
            Self::RmapWalk => write!(f, "rmap_walk"),
            Self::RefcountWalk => write!(f, "refcount_walk"),
            Self::RtBitmap => write!(f, "rt_bitmap"),
            Self::Quota => write!(f, "quota"),
            Self::Journal => write!(f, "journal"),
            Self::TransactionWrite => write!(f, "transaction_write"),
        }
    }
}

/// Trait for reading raw bytes from a block device or image file.
///
/// Implementations must provide `read_at`. The default
/// `coalesced_read_batch` falls back to sequential `read_at` calls;
/// override for performance (e.g. io_uring with coalescing).
pub trait IoReader {
    /// Read `len` bytes at byte offset `offset`.
    /// Returns a slice borrowed from the engine's internal buffer.
    fn read_at(&mut self, offset: u64, len: usize, phase: IoPhase) -> Result<&[u8], RepairError>;

    /// Batch-read with coalescing. `requests` must be sorted by offset.
    ///
    /// Default implementation calls `read_at` sequentially (no coalescing).
    fn coalesced_read_batch<T: Copy, F>(
        &mut self,
        requests: &[(u64, usize, T)],
        mut on_complete: F,
        phase: IoPhase,
    ) -> Result<(), RepairError>
    where
        F: FnMut(&[u8], T) -> Result<(), RepairError>,
    {
        for &(offset, len, tag) in requests {
            let buf = self.read_at(offset, len, phase)?;
            on_complete(buf, tag)?;
        }
        Ok(())
    }
}

/// A decorator that wraps any [`IoReader`] and logs I/O operations to a CSV file.
pub struct InstrumentedReader<R> {
    inner: R,
    io_log: std::io::BufWriter<std::fs::File>,
    remaining: usize,
}

impl<R> InstrumentedReader<R> {
    /// Wrap `inner` with CSV logging to the given file path.
    pub fn new(inner: R, log_path: &str, limit: usize) -> Result<Self, RepairError> {
        let f = std::fs::File::create(log_path).map_err(RepairError::Io)?;
        let mut w = std::io::BufWriter::new(f);
        writeln!(w, "phase,offset,len").map_err(RepairError::Io)?;
        Ok(Self { inner, io_log: w, remaining: limit })
    }

    fn log_read(&mut self, phase: IoPhase, offset: u64, len: usize) {
        if self.remaining == 0 {
            return;
        }
        let _ = writeln!(self.io_log, "{},{},{}", phase, offset, len);
        self.remaining -= 1;
    }
}

impl<R: IoReader> IoReader for InstrumentedReader<R> {
    fn read_at(&mut self, offset: u64, len: usize, phase: IoPhase) -> Result<&[u8], RepairError> {
        self.log_read(phase, offset, len);
        self.inner.read_at(offset, len, phase)
    }

    fn coalesced_read_batch<T: Copy, F>(
        &mut self,
        requests: &[(u64, usize, T)],
        on_complete: F,
        phase: IoPhase,
    ) -> Result<(), RepairError>
    where
        F: FnMut(&[u8], T) -> Result<(), RepairError>,
    {
        for &(offset, len, _) in requests {
            self.log_read(phase, offset, len);
        }
        self.inner.coalesced_read_batch(requests, on_complete, phase)
    }
}

/// Runtime choice between a bare reader and an instrumented one.
///
/// Avoids dynamic dispatch while allowing the decision to be made at
/// runtime (e.g. based on environment variables).
pub enum MaybeInstrumented<R> {
    Bare(R),
    Instrumented(InstrumentedReader<R>),
}

impl<R> MaybeInstrumented<R> {
    /// Construct from environment variables.
    ///
    /// If `XFS_REPAIR_IO_LOG` is set, wraps `inner` with CSV logging.
    /// `XFS_REPAIR_IO_LOG_LIMIT` optionally caps the number of logged operations.
    pub fn from_env(inner: R) -> Result<Self, RepairError> {
        if let Ok(path) = std::env::var("XFS_REPAIR_IO_LOG") {
            let limit = std::env::var("XFS_REPAIR_IO_LOG_LIMIT")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(usize::MAX);
            Ok(Self::Instrumented(InstrumentedReader::new(inner, &path, limit)?))
        } else {
            Ok(Self::Bare(inner))
        }
    }
}

impl<R: IoReader> IoReader for MaybeInstrumented<R> {
    fn read_at(&mut self, offset: u64, len: usize, phase: IoPhase) -> Result<&[u8], RepairError> {
        match self {
            Self::Bare(r) => r.read_at(offset, len, phase),
            Self::Instrumented(r) => r.read_at(offset, len, phase),
        }
    }

    fn coalesced_read_batch<T: Copy, F>(
        &mut self,
        requests: &[(u64, usize, T)],
        on_complete: F,
        phase: IoPhase,
    ) -> Result<(), RepairError>
    where
        F: FnMut(&[u8], T) -> Result<(), RepairError>,
    {
        match self {
            Self::Bare(r) => r.coalesced_read_batch(requests, on_complete, phase),
            Self::Instrumented(r) => r.coalesced_read_batch(requests, on_complete, phase),
        }
    }
}
