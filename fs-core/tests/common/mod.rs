//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use ufsalloc::blockdev::MemBlockDevice;
use ufsalloc::format::format_device;
use ufsalloc::superblock::Superblock;
use ufsalloc::{Filesystem, FormatOptions, MountConfig};

/// 16 MiB device
pub const DEVICE_SIZE: u64 = 16 << 20;

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Four groups of 1024 fragments, 256 inodes each
pub fn small_options() -> FormatOptions {
    FormatOptions {
        frags_per_group: 1024,
        ..Default::default()
    }
}

pub async fn formatted(opts: &FormatOptions) -> (Arc<MemBlockDevice>, Superblock) {
    init_logging();
    let dev = Arc::new(MemBlockDevice::new(DEVICE_SIZE));
    let sb = format_device(&*dev, opts)
        .await
        .expect("format failed");
    (dev, sb)
}

/// A freshly formatted small filesystem, mounted
pub async fn mounted(config: MountConfig) -> (Arc<MemBlockDevice>, Filesystem) {
    mounted_with(&small_options(), config).await
}

pub async fn mounted_with(
    opts: &FormatOptions,
    config: MountConfig,
) -> (Arc<MemBlockDevice>, Filesystem) {
    let (dev, _) = formatted(opts).await;
    let fs = Filesystem::mount(dev.clone(), config)
        .await
        .expect("mount failed");
    (dev, fs)
}

/// Mount configuration with discards switched on
pub fn trim_config() -> MountConfig {
    MountConfig {
        trim: Some(true),
        ..Default::default()
    }
}

/// Free fragments counting whole blocks
pub fn free_frags(fs: &Filesystem) -> i64 {
    let stats = fs.stats();
    stats.free_blocks * (stats.block_size / stats.fragment_size) as i64 + stats.free_frags
}
