//! Collaborator hooks
//!
//! A crash-consistency layer (soft updates, a journal) observes every claim
//! and release through [`DependencyHooks`]. The allocator only calls the
//! hooks; it never depends on what they do. [`Reclaimer`] is asked once to
//! release deferred work when an allocation first comes up empty.

use async_trait::async_trait;

/// Notifications issued while a cylinder group is held
///
/// Implementations must not block and must not call back into the
/// filesystem.
pub trait DependencyHooks: Send + Sync + 'static {
    /// Fragments `[bno, bno + frags)` were claimed for inode `ino`
    fn block_claimed(&self, _cg: u32, _bno: u64, _frags: u64, _ino: u64) {}

    /// Fragments `[bno, bno + frags)` of inode `ino` returned to the free map
    fn block_freed(&self, _cg: u32, _bno: u64, _frags: u64, _ino: u64) {}

    /// Inode `ino` was claimed
    fn inode_claimed(&self, _cg: u32, _ino: u64, _is_dir: bool) {}

    /// Inode `ino` returned to the free map
    fn inode_freed(&self, _cg: u32, _ino: u64, _is_dir: bool) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

impl DependencyHooks for NoDependencies {}

/// Source of space held by deferred work
#[async_trait]
pub trait Reclaimer: Send + Sync + 'static {
    /// Release what can be released. Returns whether anything was freed.
    async fn reclaim(&self) -> bool;
}

/// Reclaimer with nothing to reclaim
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReclaim;

#[async_trait]
impl Reclaimer for NoReclaim {
    async fn reclaim(&self) -> bool {
        false
    }
}
