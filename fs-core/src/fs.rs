//! Mounted filesystem
//!
//! [`Filesystem`] is the public face of the allocator. It owns an
//! [`FsInner`] shared with the discard worker: immutable geometry, the
//! cylinder-group store, and the live counters behind one short-held mutex.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::blockdev::{BlockDevice, BlockDeviceError};
use crate::cache::{CgBuf, CgStore, CgStoreConfig};
use crate::config::MountConfig;
use crate::error::{FsError, Result};
use crate::hooks::{DependencyHooks, NoDependencies, NoReclaim, Reclaimer};
use crate::superblock::{
    read_superblock, write_superblock, Csum, Geometry, SbReadOptions, Superblock, CK_CYLGRP,
    FS_METACKHASH, FS_NEEDSFSCK, FS_OPTSPACE, FS_OPTTIME, FS_TRIM, FS_UNCLEAN,
};
use crate::trim::{self, DiscardStats, TrimKey, TrimState};

/// Signed change to one group's summary counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CsumDelta {
    pub ndir: i64,
    pub nbfree: i64,
    pub nifree: i64,
    pub nffree: i64,
}

impl CsumDelta {
    /// Apply to a cylinder-group header
    pub(crate) fn apply_to(&self, cs: &mut Csum) {
        cs.ndir += self.ndir as i32;
        cs.nbfree += self.nbfree as i32;
        cs.nifree += self.nifree as i32;
        cs.nffree += self.nffree as i32;
    }
}

/// Live filesystem-wide state
///
/// `sb.cstotal` always equals the sum of `csums` outside a critical section
/// of this lock. `maxcluster[c]` never understates the longest free cluster
/// of group `c`. `contigdirs[c]` counts directories created in a row in
/// group `c` without an intervening file.
pub(crate) struct FsState {
    pub sb: Superblock,
    pub csums: Vec<Csum>,
    pub maxcluster: Vec<i32>,
    pub contigdirs: Vec<u8>,
}

impl FsState {
    /// Record a change in group `c` in both the summary and the totals
    pub(crate) fn apply(&mut self, c: u32, delta: CsumDelta, maxcluster: Option<i32>) {
        delta.apply_to(&mut self.csums[c as usize]);
        let t = &mut self.sb.cstotal;
        t.ndir += delta.ndir;
        t.nbfree += delta.nbfree;
        t.nifree += delta.nifree;
        t.nffree += delta.nffree;
        if let (Some(max), Some(slot)) = (maxcluster, self.maxcluster.get_mut(c as usize)) {
            *slot = max;
        }
        self.sb.fmod = 1;
    }

    /// Fragments available to an allocation that honours a `minfree` reserve
    pub(crate) fn freespace(&self, geom: &Geometry, minfree: i64) -> i64 {
        let t = &self.sb.cstotal;
        geom.blkstofrags(t.nbfree.max(0) as u64) as i64 + t.nffree
            - (geom.dsize as i64 * minfree / 100)
    }
}

/// At most one message per interval
#[derive(Debug)]
pub(crate) struct RateLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a message may be emitted now
    pub(crate) fn check(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Shared core of a mounted filesystem
pub(crate) struct FsInner {
    pub device: Arc<dyn BlockDevice>,
    pub geom: Geometry,
    pub config: MountConfig,
    pub cgs: CgStore,
    pub state: Mutex<FsState>,
    pub hooks: Arc<dyn DependencyHooks>,
    pub reclaimer: Arc<dyn Reclaimer>,
    /// Serialises lazy initialisation of inode blocks per group
    pub init_locks: Vec<Arc<AsyncMutex<()>>>,
    pub trim: TrimState,
    pub detached: AtomicBool,
    pub read_only: bool,
    full_msg: Mutex<RateLimiter>,
}

impl FsInner {
    /// Run `f` under the state lock
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut FsState) -> R) -> R {
        let mut st = self.state.lock();
        f(&mut st)
    }

    pub(crate) fn group_csum(&self, c: u32) -> Csum {
        self.with_state(|st| st.csums[c as usize])
    }

    /// Fetch a group, recording accepted hash failures and forced detach
    pub(crate) async fn getcg(&self, c: u32) -> Result<CgBuf> {
        match self.cgs.fetch(c).await {
            Ok(buf) => {
                if buf.needs_check() {
                    self.with_state(|st| {
                        st.sb.flags |= FS_NEEDSFSCK;
                        st.sb.fmod = 1;
                    });
                }
                Ok(buf)
            }
            Err(e) => {
                if self.cgs.detach_requested() {
                    self.detach();
                }
                Err(e)
            }
        }
    }

    /// Take the filesystem offline
    pub(crate) fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.with_state(|st| {
                st.sb.flags |= FS_NEEDSFSCK;
                st.sb.fmod = 1;
            });
            log::error!("SUPERBLOCK: filesystem forced offline");
        }
    }

    /// Flag the superblock on disk as needing fsck, leaving everything else
    /// as it was last written
    ///
    /// Groups and counters changed since the last sync are not trusted after
    /// a detach, so only the flag is persisted.
    pub(crate) async fn persist_needs_fsck(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let opts = SbReadOptions {
            location: Some(self.with_state(|st| st.sb.sblockloc as u64)),
            ignore_hash_failures: true,
        };
        let mut on_disk = read_superblock(&*self.device, &opts).await?;
        on_disk.sb.flags |= FS_NEEDSFSCK;
        on_disk.sb.clean = 0;
        on_disk.sb.fmod = 0;
        write_superblock(&*self.device, &mut on_disk.sb, &on_disk.csums).await?;
        self.device.sync().await?;
        log::warn!("SUPERBLOCK: detached filesystem marked as needing fsck");
        Ok(())
    }

    /// Emit a rate-limited exhaustion message
    pub(crate) fn report_full(&self, what: &str, ino: u64) {
        if self.full_msg.lock().check() {
            let mnt = self.with_state(|st| st.sb.mount_point());
            log::warn!("ALLOC: {}: {} (inode {})", mnt, what, ino);
        }
    }

    /// Write the summaries and superblock from a snapshot of the live state
    pub(crate) async fn write_sb(&self) -> Result<()> {
        let (mut sb, csums) = self.with_state(|st| {
            st.sb.fmod = 0;
            st.sb.time = chrono::Utc::now().timestamp();
            (st.sb.clone(), st.csums.clone())
        });
        write_superblock(&*self.device, &mut sb, &csums).await?;
        self.with_state(|st| st.sb.ckhash = sb.ckhash);
        Ok(())
    }

    /// Reject work on a detached or read-only filesystem
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(FsError::Detached);
        }
        if self.read_only {
            return Err(FsError::Device(BlockDeviceError::ReadOnly));
        }
        Ok(())
    }
}

/// Request for new space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRequest {
    /// Inode the space is for
    pub ino: u64,
    /// Preferred fragment address, `0` for none
    pub bpref: u64,
    /// Bytes wanted: a fragment multiple no larger than a block
    pub size: u64,
    /// May dip into the `minfree` reserve
    pub privileged: bool,
}

/// Request to grow a file's last fragment run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReallocRequest {
    pub ino: u64,
    /// Current address of the run
    pub bprev: u64,
    /// Preferred address if the run has to move
    pub bpref: u64,
    /// Current size in bytes
    pub osize: u64,
    /// New size in bytes
    pub nsize: u64,
    pub privileged: bool,
}

/// Snapshot of the filesystem counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub ncg: u32,
    pub block_size: u64,
    pub fragment_size: u64,
    pub data_frags: u64,
    pub free_blocks: i64,
    pub free_frags: i64,
    pub free_inodes: i64,
    pub directories: i64,
    pub optim: String,
    pub needs_fsck: bool,
}

/// A mounted filesystem
pub struct Filesystem {
    inner: Arc<FsInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Filesystem {
    /// Mount with no dependency tracking and nothing to reclaim
    pub async fn mount(device: Arc<dyn BlockDevice>, config: MountConfig) -> Result<Self> {
        Self::mount_with(device, config, Arc::new(NoDependencies), Arc::new(NoReclaim)).await
    }

    /// Mount with explicit collaborators
    pub async fn mount_with(
        device: Arc<dyn BlockDevice>,
        config: MountConfig,
        hooks: Arc<dyn DependencyHooks>,
        reclaimer: Arc<dyn Reclaimer>,
    ) -> Result<Self> {
        let opts = SbReadOptions {
            location: config.superblock_location,
            ignore_hash_failures: config.ignore_hash_failures,
        };
        let loaded = read_superblock(&*device, &opts).await?;
        let mut sb = loaded.sb;
        let geom = Geometry::new(&sb)?;
        if sb.optim != FS_OPTTIME && sb.optim != FS_OPTSPACE {
            return Err(FsError::validation(
                "superblock",
                format!("unknown optimisation mode {}", sb.optim),
            ));
        }
        // Hashes switched off elsewhere stay off until turned back on
        if sb.flags & FS_METACKHASH == 0 {
            sb.metackhash = 0;
        }

        let read_only = device.is_read_only();
        let trim_enabled = !read_only && config.trim.unwrap_or(sb.flags & FS_TRIM != 0);
        let cgs = CgStore::new(
            device.clone(),
            geom,
            CgStoreConfig {
                capacity: config.cg_cache_capacity,
                hash_groups: sb.metackhash & CK_CYLGRP != 0,
                verify_hashes: config.verify_cg_hashes,
                io_failure_limit: config.io_failure_limit,
            },
        );
        let ncg = geom.ncg as usize;
        let (tx, rx) = mpsc::unbounded_channel();
        let interval = Duration::from_millis(config.full_message_interval_ms);

        let inner = Arc::new(FsInner {
            device: device.clone(),
            geom,
            cgs,
            state: Mutex::new(FsState {
                sb,
                csums: loaded.csums,
                maxcluster: loaded.maxcluster,
                contigdirs: vec![0; ncg],
            }),
            hooks,
            reclaimer,
            init_locks: (0..ncg).map(|_| Arc::new(AsyncMutex::new(()))).collect(),
            trim: TrimState::new(trim_enabled, geom.fsize, tx),
            detached: AtomicBool::new(false),
            read_only,
            full_msg: Mutex::new(RateLimiter::new(interval)),
            config,
        });
        let worker = tokio::spawn(trim::run_worker(Arc::downgrade(&inner), rx));

        if !read_only {
            inner.with_state(|st| {
                st.sb.clean = 0;
                st.sb.fmod = 1;
            });
            inner.write_sb().await?;
        }
        log::info!(
            "SUPERBLOCK: mounted {} groups of {} fragments{}{}",
            geom.ncg,
            geom.fpg,
            if read_only { ", read-only" } else { "" },
            if trim_enabled { ", discards enabled" } else { "" }
        );
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Filesystem geometry
    pub fn geometry(&self) -> Geometry {
        self.inner.geom
    }

    /// Copy of the in-memory superblock
    pub fn superblock(&self) -> Superblock {
        self.inner.with_state(|st| st.sb.clone())
    }

    /// Summary counters of group `c`
    pub fn group_summary(&self, c: u32) -> Option<Csum> {
        self.inner.with_state(|st| st.csums.get(c as usize).copied())
    }

    /// Cached upper bound on the longest free cluster in group `c`
    pub fn cluster_hint(&self, c: u32) -> Option<i32> {
        self.inner
            .with_state(|st| st.maxcluster.get(c as usize).copied())
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    /// Current counters
    pub fn stats(&self) -> FsStats {
        let geom = self.inner.geom;
        self.inner.with_state(|st| FsStats {
            ncg: geom.ncg,
            block_size: geom.bsize,
            fragment_size: geom.fsize,
            data_frags: geom.dsize,
            free_blocks: st.sb.cstotal.nbfree,
            free_frags: st.sb.cstotal.nffree,
            free_inodes: st.sb.cstotal.nifree,
            directories: st.sb.cstotal.ndir,
            optim: if st.sb.optim == FS_OPTSPACE {
                "space".into()
            } else {
                "time".into()
            },
            needs_fsck: st.sb.flags & FS_NEEDSFSCK != 0,
        })
    }

    /// Discard bookkeeping
    pub fn discard_stats(&self) -> DiscardStats {
        self.inner.trim.stats()
    }

    /// Mark detached on fatal errors and on requested detach
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() || self.inner.cgs.detach_requested() {
                self.inner.detach();
            }
        }
        result
    }

    /// Allocate a block or a run of fragments
    pub async fn alloc_block(&self, req: BlockRequest) -> Result<u64> {
        self.inner.check_writable()?;
        let result = self.inner.alloc(&req).await;
        self.observe(result)
    }

    /// Try to allocate in group `c` only
    ///
    /// Returns `Ok(None)` when the group cannot satisfy the request; no
    /// counter changes in that case.
    pub async fn alloc_in_group(
        &self,
        c: u32,
        bpref: u64,
        size: u64,
        ino: u64,
    ) -> Result<Option<u64>> {
        self.inner.check_writable()?;
        self.inner.check_size(size)?;
        if c >= self.inner.geom.ncg {
            return Err(FsError::BadRequest(format!("no cylinder group {}", c)));
        }
        let result = self.inner.alloccg(c, bpref, size, size, ino).await;
        self.observe(result)
    }

    /// Grow the fragment run at `bprev`, in place when possible
    pub async fn realloc_fragments(&self, req: ReallocRequest) -> Result<u64> {
        self.inner.check_writable()?;
        let result = self.inner.realloccg(&req).await;
        self.observe(result)
    }

    /// Allocate `len` contiguous full blocks
    pub async fn alloc_cluster(&self, ino: u64, bpref: u64, len: u64) -> Result<u64> {
        self.inner.check_writable()?;
        let result = self.inner.alloc_cluster(ino, bpref, len).await;
        self.observe(result)
    }

    /// Allocate an inode near `parent`
    ///
    /// `parent_is_root` spreads first-level directories across groups.
    pub async fn alloc_inode(&self, parent: u64, parent_is_root: bool, is_dir: bool) -> Result<u64> {
        self.inner.check_writable()?;
        let result = self.inner.valloc(parent, parent_is_root, is_dir).await;
        self.observe(result)
    }

    /// Release `size` bytes at `bno`, possibly after a discard
    pub async fn free_blocks(&self, bno: u64, size: u64, ino: u64, key: TrimKey) -> Result<()> {
        self.inner.check_writable()?;
        let result = self.inner.blkfree(bno, size, ino, key).await;
        self.observe(result)
    }

    /// Release an inode
    pub async fn free_inode(&self, ino: u64, is_dir: bool) -> Result<()> {
        self.inner.check_writable()?;
        let result = self.inner.freefile(ino, is_dir).await;
        self.observe(result)
    }

    /// Start a batch of frees whose discards may be merged
    pub fn begin_trim_batch(&self) -> TrimKey {
        self.inner.trim.begin_batch()
    }

    /// Issue whatever discard is still pending under `key`
    pub fn end_trim_batch(&self, key: TrimKey) {
        self.inner.trim.end_batch(&self.inner.device, key);
    }

    /// Wait until every issued discard has completed and its frees landed
    pub async fn drain_discards(&self) {
        self.inner.trim.wait_drained().await;
    }

    /// Write dirty groups, then the summaries and the superblock
    ///
    /// A detached filesystem writes nothing but the needs-fsck flag and
    /// fails with [`FsError::Detached`].
    pub async fn sync(&self) -> Result<()> {
        if self.is_detached() {
            self.inner.persist_needs_fsck().await?;
            return Err(FsError::Detached);
        }
        if self.inner.read_only {
            return Ok(());
        }
        let written = self.inner.cgs.flush().await?;
        self.inner.write_sb().await?;
        self.inner.device.sync().await?;
        log::info!("SUPERBLOCK: synced ({} groups written)", written);
        Ok(())
    }

    /// Finish outstanding discards, mark the filesystem clean and sync
    ///
    /// A detached filesystem is left unclean with its needs-fsck flag set.
    pub async fn unmount(self) -> Result<()> {
        self.inner.trim.flush_all(&self.inner.device);
        self.inner.trim.wait_drained().await;
        self.inner.trim.shutdown();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::warn!("TRIM: worker ended abnormally: {}", e);
            }
        }
        if self.is_detached() {
            self.inner.persist_needs_fsck().await?;
            return Err(FsError::Detached);
        }
        if self.inner.read_only {
            return Ok(());
        }
        self.inner.with_state(|st| {
            st.sb.clean = if st.sb.flags & (FS_UNCLEAN | FS_NEEDSFSCK) != 0 {
                0
            } else {
                1
            };
        });
        self.sync().await?;
        log::info!("SUPERBLOCK: unmounted");
        Ok(())
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}
