//! Mount and format configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FsError, Result};
use crate::superblock::{CK_CYLGRP, CK_INODE, CK_SUPERBLOCK, FS_OPTTIME};

/// Options applied when mounting a filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Read the superblock from this byte offset instead of searching
    pub superblock_location: Option<u64>,
    /// Accept a superblock with a bad check-hash and mark it as needing fsck
    pub ignore_hash_failures: bool,
    /// Reject cylinder groups whose check-hash does not match
    pub verify_cg_hashes: bool,
    /// Issue discards for freed blocks; `None` follows the superblock flag
    pub trim: Option<bool>,
    /// Clean cylinder groups kept in memory
    pub cg_cache_capacity: usize,
    /// Minimum time between "filesystem is full" style messages
    pub full_message_interval_ms: u64,
    /// Consecutive I/O failures on one group before the filesystem detaches
    pub io_failure_limit: u32,
    /// Initialise inode blocks with a barrier write instead of a synchronous one
    pub async_inode_init: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            superblock_location: None,
            ignore_hash_failures: false,
            verify_cg_hashes: true,
            trim: None,
            cg_cache_capacity: 64,
            full_message_interval_ms: 1000,
            io_failure_limit: 3,
            async_inode_init: true,
        }
    }
}

impl MountConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&text)
            .map_err(|e| FsError::validation("mount configuration", e.to_string()))
    }
}

/// Parameters for laying out a new filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Filesystem size in bytes; `0` uses the whole device
    pub size: u64,
    pub block_size: u32,
    pub fragment_size: u32,
    /// Bytes of data space per inode
    pub density: u32,
    /// Fragments per cylinder group; `0` picks the largest the block can map
    pub frags_per_group: u32,
    /// Percentage of space held back from unprivileged allocation
    pub minfree: u8,
    /// `FS_OPTTIME` or `FS_OPTSPACE`
    pub optim: i32,
    /// Longest cluster tracked in the cluster summary; `0` disables clusters
    pub max_cluster: u32,
    /// `CK_*` bits of metadata to protect with check-hashes
    pub metackhash: u32,
    /// Mark the filesystem as wanting discards
    pub trim: bool,
    pub volume_name: String,
    /// Inodes at the start of group 0 that are marked used
    pub reserved_inodes: u32,
    /// Expected average file size, used by directory placement
    pub avg_file_size: u32,
    /// Expected files per directory, used by directory placement
    pub avg_files_per_dir: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            size: 0,
            block_size: 32768,
            fragment_size: 4096,
            density: 16384,
            frags_per_group: 0,
            minfree: 8,
            optim: FS_OPTTIME,
            max_cluster: 16,
            metackhash: CK_SUPERBLOCK | CK_CYLGRP | CK_INODE,
            trim: false,
            volume_name: String::new(),
            reserved_inodes: 2,
            avg_file_size: 16384,
            avg_files_per_dir: 64,
        }
    }
}
