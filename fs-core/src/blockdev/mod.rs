//! Block device I/O operations for ufsalloc

mod blockdev_trait;
mod mem;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

// Re-export the block device trait and related types
pub use self::blockdev_trait::{check_access, BlockDevice, BlockDeviceError, Result, DEV_BSIZE};
pub use self::mem::{DeviceEvent, MemBlockDevice};

/// A block device that is backed by a file or a raw disk
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create (or truncate) an image file of `size` bytes
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let size = size - size % DEV_BSIZE;
        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            read_only: false,
        })
    }

    /// Open an existing image file or block device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        // Handles both regular files and block devices
        let size = Self::device_size(&path)?;
        let size = size - size % DEV_BSIZE;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            read_only,
        })
    }

    /// Path this device was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn device_size(path: &Path) -> Result<u64> {
        use std::fs::File as StdFile;
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = StdFile::open(path)?;
        let fd = file.as_raw_fd();

        // BLKGETSIZE64 = 0x80081272 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }
        Ok(size)
    }

    #[cfg(not(unix))]
    fn device_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    async fn zero_fill(file: &mut File, offset: u64, len: u64) -> Result<()> {
        const CHUNK: u64 = 64 * 1024;
        let zeros = vec![0u8; CHUNK as usize];
        file.seek(SeekFrom::Start(offset)).await?;
        let mut left = len;
        while left > 0 {
            let n = left.min(CHUNK);
            file.write_all(&zeros[..n as usize]).await?;
            left -= n;
        }
        file.flush().await?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(file: &File, offset: u64, len: u64) -> std::io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                mode,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(_file: &File, _offset: u64, _len: u64) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_access(self.size, offset, buf.len() as u64)?;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_access(self.size, offset, data.len() as u64)?;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_barrier_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_access(self.size, offset, data.len() as u64)?;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            // Everything queued so far must be durable before this write lands
            file.sync_data().await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
            file.sync_data().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn unmap(&self, offset: u64, len: u64) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_access(self.size, offset, len)?;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            if let Err(e) = Self::punch_hole(file, offset, len) {
                log::debug!(
                    "BLOCKDEV: hole punch unavailable on {:?} ({}), zero-filling",
                    self.path,
                    e
                );
                Self::zero_fill(file, offset, len).await?;
            }
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if file_guard.take().is_some() {
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
