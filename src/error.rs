//! Error type shared by every component of the programmer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrutzelError {
    /// Read or write failure on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device did not answer within the read timeout.
    #[error("Timed out waiting for the device")]
    Timeout,

    /// The transport reported end of stream.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device answered with something the command does not expect.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Out of memory: {requested} bytes requested, {available} bytes free")]
    OutOfMemory { requested: u32, available: u32 },

    /// Enough memory is free in total but no single gap is large enough.
    /// Defragment and retry.
    #[error("Memory fragmented: no gap of {requested} bytes")]
    Fragmented { requested: u32 },

    #[error("Not enough free partitions: {requested} requested, {available} free")]
    CapacityExceeded { requested: usize, available: usize },

    #[error("Partition {0} is already in use")]
    PartitionInUse(u8),

    #[error("Partition {0} is not in use")]
    PartitionNotInUse(u8),

    #[error("Partition {0} does not exist")]
    UnknownPartition(u8),

    #[error("Offset {offset:#x} is not aligned to {alignment:#x}")]
    Misaligned { offset: u32, alignment: u32 },

    #[error("Range {offset:#x}+{size:#x} exceeds {limit:#x}")]
    OutOfBounds { offset: u32, size: u32, limit: u32 },

    #[error("Offset {0:#x} overlaps an existing allocation")]
    AlreadyReserved(u32),

    #[error("No allocation at offset {0:#x}")]
    NoSuchItem(u32),

    /// The bytes do not contain a valid DragonFS image.
    #[error("Not a valid filesystem image: {0}")]
    InvalidImage(String),

    #[error("Sectors not reachable from the root: {0:x?}")]
    OrphanSectors(Vec<u32>),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("File too large: {0} bytes")]
    FileTooLarge(usize),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl BrutzelError {
    /// True for conditions the caller is expected to resolve and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BrutzelError::Fragmented { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrutzelError>;
