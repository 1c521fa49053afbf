//! Filesystem layer.
//!
//! Defines the block-device contract the ATA layer satisfies and the
//! error surface of the FAT32 driver; `fat32` holds the filesystem
//! itself.

pub mod fat32;

use core::fmt;

/// Error from a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The underlying command failed (transport or device error).
    Io,
    /// LBA range or buffer size rejected before issue.
    BadParameter,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::Io => write!(f, "I/O error"),
            BlockError::BadParameter => write!(f, "bad parameter"),
        }
    }
}

/// Block-level access at sector granularity.
///
/// This is the only surface the FAT32 layer sees.
pub trait BlockDevice {
    /// Total addressable sectors, if known (0 when unknown).
    fn sector_count(&self) -> u64;

    /// Read `count` sectors starting at `lba` into `buf`.
    fn block_read(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write `count` sectors starting at `lba` from `buf`.
    fn block_write(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn block_read(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<(), BlockError> {
        (**self).block_read(lba, count, buf)
    }

    fn block_write(&mut self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
        (**self).block_write(lba, count, buf)
    }
}

/// Outcome of a FAT32 operation.
///
/// Warnings (FAT mirror failures, advisory FSInfo problems, truncated
/// reads) go to the log sink and accompany a successful return; these
/// variants cover the fatal cases only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A block read or write failed underneath the filesystem.
    Io,
    /// On-disk metadata failed validation (boot sector, FAT chain, ...).
    CorruptMetadata,
    /// Full scan of the FAT found no free cluster.
    NoSpace,
    /// Directory scan reached the terminator without a match.
    NotFound,
    /// A live entry with the same normalized name already exists.
    AlreadyExists,
    /// The caller's buffer cannot hold the requested data.
    BufferTooSmall,
    /// Cluster number, name, or buffer rejected before any disk access.
    BadParameter,
}

impl FsError {
    /// Stable negative code for each kind, for callers that want a
    /// C-style integer-return surface.
    pub fn code(self) -> i32 {
        match self {
            FsError::Io => -1,
            FsError::CorruptMetadata => -2,
            FsError::NoSpace => -3,
            FsError::NotFound => -4,
            FsError::AlreadyExists => -5,
            FsError::BufferTooSmall => -6,
            FsError::BadParameter => -7,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Io => write!(f, "I/O error"),
            FsError::CorruptMetadata => write!(f, "corrupt metadata"),
            FsError::NoSpace => write!(f, "no free clusters"),
            FsError::NotFound => write!(f, "not found"),
            FsError::AlreadyExists => write!(f, "already exists"),
            FsError::BufferTooSmall => write!(f, "buffer too small"),
            FsError::BadParameter => write!(f, "bad parameter"),
        }
    }
}

impl From<BlockError> for FsError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Io => FsError::Io,
            BlockError::BadParameter => FsError::BadParameter,
        }
    }
}
