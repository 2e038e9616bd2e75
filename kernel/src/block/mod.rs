//! Block devices
//!
//! Devices are consumed through the [`BlockDevice`] trait; the buffer cache is
//! the only caller. Devices are named by a [`DeviceId`] (major/minor pair).

use core::fmt;

pub mod cache;
pub mod ramdisk;

pub use ramdisk::RamDisk;

/// Major/minor device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    pub major: u8,
    pub minor: u8,
}

impl DeviceId {
    pub const fn new(major: u8, minor: u8) -> Self {
        DeviceId { major, minor }
    }

    /// Packed 16-bit form, major in the high byte.
    pub const fn as_u16(self) -> u16 {
        ((self.major as u16) << 8) | self.minor as u16
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// A device the buffer cache can move whole blocks to and from.
///
/// Transfers are always exactly `block_size()` bytes, and a device
/// registered with the cache must use the cache's block size. Methods take
/// `&self` so a device can be shared between the cache and whoever created
/// it; implementations keep their own interior locking.
pub trait BlockDevice: Send + Sync {
    /// Fill `buf` with block `block_num`. Fails with `OutOfBounds` past the
    /// end of the device and `IoError` when the medium reports a failure.
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Store `buf` as block `block_num`. Same failure modes as reads.
    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<(), BlockError>;

    fn block_size(&self) -> usize;

    fn num_blocks(&self) -> u64;

    /// Push out anything the device buffers internally
    fn flush(&self) -> Result<(), BlockError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The medium failed the transfer
    IoError,
    /// Block number past the end of the device
    OutOfBounds,
    DeviceNotReady,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoError => write!(f, "I/O error"),
            BlockError::OutOfBounds => write!(f, "block number out of bounds"),
            BlockError::DeviceNotReady => write!(f, "device not ready"),
        }
    }
}
