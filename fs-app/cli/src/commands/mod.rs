pub mod check;
pub mod format;
pub mod info;

use anyhow::{Context, Result};
use std::path::Path;

use ufsalloc::blockdev::FileBackedBlockDevice;

/// Open a device or image for reading only
pub async fn open_read_only(path: &Path) -> Result<FileBackedBlockDevice> {
    FileBackedBlockDevice::open(path, true)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}
