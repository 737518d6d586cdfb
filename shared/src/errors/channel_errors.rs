use thiserror::Error;

/// Flow-control outcomes of the ring primitives. These are expected
/// conditions, reported to the caller and never logged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring is empty")]
    Empty,

    #[error("ring is full")]
    Full,

    #[error("not enough space: need {needed} bytes, have {available}")]
    NoSpace { needed: u32, available: u32 },
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("invalid channel: missing or corrupt magic")]
    InvalidContext,

    #[error("region too small: need at least {needed} bytes, got {got}")]
    RegionTooSmall { needed: usize, got: usize },

    #[error("region already carries a live channel")]
    AlreadyInitialized,

    #[error("channel state corrupted")]
    Corrupted,

    #[error("timed out waiting for the busy flag to clear")]
    LockTimeout,

    #[error("host path does not fit the descriptor")]
    PathTooLong,

    #[error("timed out waiting for the monitor to acknowledge a chunk")]
    AckTimeout,

    #[error("chunk sequence mismatch: expected {expected}, got {got}")]
    ChunkMismatch { expected: u32, got: u32 },

    #[error("host reported transfer error {0}")]
    HostStatus(i32),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[cfg(feature = "std")]
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}
