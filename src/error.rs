use thiserror::Error;

/// The six error kinds the repair engine distinguishes. The orchestrator
/// keeps one counter per kind and aborts the run once any counter
/// crosses its configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device EIO, short read; retried once at the buffer layer.
    TransientIo,
    /// Bad magic, impossible extent, duplicate block claim.
    StructuralCorruption,
    /// nextents mismatch, file-type mismatch, etc.
    LogicalInconsistency,
    /// Cascade of corruption forcing the inode to be zapped.
    UnrecoverableInode,
    /// Allocation failure or similar — always fatal.
    ResourceExhaustion,
    /// Write mode required but dry-run is set.
    UserProhibition,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::TransientIo,
        ErrorKind::StructuralCorruption,
        ErrorKind::LogicalInconsistency,
        ErrorKind::UnrecoverableInode,
        ErrorKind::ResourceExhaustion,
        ErrorKind::UserProhibition,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Error, Debug)]
pub enum RepairError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number in {0}")]
    BadMagic(&'static str),

    #[error("CRC mismatch in {0}")]
    CrcMismatch(&'static str),

    #[error("parse error: {0}")]
    Parse(&'static str),

    #[error("structural corruption: {0}")]
    Structural(&'static str),

    #[error("logical inconsistency: {0}")]
    Logical(&'static str),

    #[error("inode {ino} unrecoverable: {reason}")]
    UnrecoverableInode { ino: u64, reason: &'static str },

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(&'static str),

    #[error("write mode required but dry-run is set: {0}")]
    DryRunProhibited(&'static str),

    #[error("block {block} in AG {ag} reached BAD_STATE")]
    BadBlockState { ag: u32, block: u32 },

    #[error("dirty journal with no destroy-log flag set: head != tail")]
    DirtyLogNoDestroy,

    #[error("repair aborted: {0}")]
    Aborted(&'static str),
}

impl RepairError {
    /// Classify this error into one of the six policy kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepairError::Io(_) => ErrorKind::TransientIo,
            RepairError::BadMagic(_)
            | RepairError::CrcMismatch(_)
            | RepairError::Structural(_)
            | RepairError::BadBlockState { .. }
            | RepairError::DirtyLogNoDestroy => ErrorKind::StructuralCorruption,
            RepairError::Parse(_) | RepairError::Logical(_) => ErrorKind::LogicalInconsistency,
            RepairError::UnrecoverableInode { .. } => ErrorKind::UnrecoverableInode,
            RepairError::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            RepairError::DryRunProhibited(_) => ErrorKind::UserProhibition,
            RepairError::Aborted(_) => ErrorKind::ResourceExhaustion,
        }
    }

    /// Whether this error, on its own, must stop the whole run rather
    /// than just the current AG/inode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RepairError::ResourceExhaustion(_)
                | RepairError::DirtyLogNoDestroy
                | RepairError::Aborted(_)
                | RepairError::BadBlockState { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RepairError>;
