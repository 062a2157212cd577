//! Block device trait definitions for ufsalloc

use std::io;
use thiserror::Error;

/// Device sector size in bytes; every offset and length is a multiple of this
pub const DEV_BSIZE: u64 = 512;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Access beyond end of device: offset {offset}, length {len}")]
    OutOfRange { offset: u64, len: u64 },
    #[error("Unaligned access: offset {offset}, length {len} (sector size {DEV_BSIZE})")]
    Unaligned { offset: u64, len: u64 },
    #[error("Device is read-only")]
    ReadOnly,
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device operations
///
/// Offsets are in bytes from the start of the device. Writes issued through
/// [`BlockDevice::write_barrier_at`] reach stable storage before any write
/// issued after them.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes starting at `offset`
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `offset`
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Write `data` and order it before every later write
    async fn write_barrier_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_at(offset, data).await?;
        self.sync().await
    }

    /// Tell the device that `[offset, offset + len)` no longer holds live data
    async fn unmap(&self, offset: u64, len: u64) -> Result<()> {
        check_access(self.size(), offset, len)?;
        Ok(())
    }

    /// Get the device size in bytes
    fn size(&self) -> u64;

    /// Sync any pending writes to the device
    async fn sync(&self) -> Result<()>;

    /// Close the device
    async fn close(&mut self) -> Result<()>;

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Reject accesses that are unaligned or run past the end of the device
pub fn check_access(size: u64, offset: u64, len: u64) -> Result<()> {
    if offset % DEV_BSIZE != 0 || len % DEV_BSIZE != 0 {
        return Err(BlockDeviceError::Unaligned { offset, len });
    }
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockDeviceError::OutOfRange { offset, len }),
    }
}
