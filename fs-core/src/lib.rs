//! ufsalloc core - space and inode allocation for the Berkeley Fast File System
//!
//! This crate implements the allocation layer of UFS1/UFS2: the superblock
//! and cylinder-group codecs, the block, fragment, cluster and inode
//! allocators, deallocation with deferred discards, plus a filesystem
//! creator and a consistency checker built on the same code.
//!
//! Everything runs on tokio. A [`Filesystem`] is mounted on any
//! [`blockdev::BlockDevice`]; [`blockdev::MemBlockDevice`] serves tests.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod blockdev;
pub mod cache;
pub mod cg;
pub mod check;
pub mod config;
pub mod error;
pub mod format;
pub mod fs;
pub mod hooks;
pub mod ialloc;
pub mod superblock;
pub mod trim;

mod alloc;
mod free;

pub use config::{FormatOptions, MountConfig};
pub use error::{FsError, Result};
pub use fs::{BlockRequest, Filesystem, FsStats, ReallocRequest};
pub use trim::{DiscardStats, TrimKey};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::{BlockDevice, FileBackedBlockDevice, MemBlockDevice};
    pub use crate::error::{FsError, Result};
    pub use crate::fs::{BlockRequest, Filesystem, ReallocRequest};
    pub use crate::hooks::{DependencyHooks, Reclaimer};
    pub use crate::trim::TrimKey;
}
