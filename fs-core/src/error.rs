//! Error taxonomy for the allocator
//!
//! Four kinds of failure surface from this crate:
//!
//! * exhaustion ([`FsError::NoSpace`], [`FsError::NoInodes`]) after the full
//!   search policy has run;
//! * device I/O failure ([`FsError::Device`]);
//! * validation failure of untrusted on-disk input ([`FsError::Validation`],
//!   [`FsError::StaleSuperblock`], [`FsError::NoSuperblock`],
//!   [`FsError::InvalidGeometry`]);
//! * structural corruption found by an internal consistency check
//!   ([`FsError::Corruption`]). This one is fatal: the caller must take the
//!   filesystem offline and never retry.

use std::io;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// Library-wide error type
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Block device error: {0}")]
    Device(#[from] BlockDeviceError),
    #[error("Invalid {what}: {detail}")]
    Validation { what: &'static str, detail: String },
    #[error("Superblock check-hash failed (stored {stored:#010x}, computed {computed:#010x})")]
    StaleSuperblock { stored: u32, computed: u32 },
    #[error("No valid superblock found")]
    NoSuperblock,
    #[error("Unsupported geometry: {0}")]
    InvalidGeometry(String),
    #[error("Filesystem is full")]
    NoSpace,
    #[error("Out of inodes")]
    NoInodes,
    #[error("Corrupted cylinder group {cg}: {detail}")]
    Corruption { cg: u32, detail: String },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Filesystem has been forced offline")]
    Detached,
}

impl FsError {
    /// Whether the filesystem must be taken offline after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, FsError::Corruption { .. })
    }

    /// Whether this error reports running out of blocks or inodes
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, FsError::NoSpace | FsError::NoInodes)
    }

    pub(crate) fn corruption(cg: u32, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        log::error!("CG: group {} corrupted: {}", cg, detail);
        FsError::Corruption { cg, detail }
    }

    pub(crate) fn validation(what: &'static str, detail: impl Into<String>) -> Self {
        FsError::Validation {
            what,
            detail: detail.into(),
        }
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        FsError::Device(BlockDeviceError::Io(err))
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, FsError>;
