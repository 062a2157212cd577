//! Cylinder-group cache
//!
//! Every group has its own slot behind an async mutex. Holding a [`CgBuf`]
//! means holding that mutex, so all allocation and free activity on a group
//! is serialised by ownership of the buffer. Clean groups beyond the cache
//! capacity are dropped in least-recently-used order; dirty groups stay
//! until they are written.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};

use crate::blockdev::{BlockDevice, DEV_BSIZE};
use crate::cg::{cg_image_hash, cg_stored_hash, CylinderGroup};
use crate::error::{FsError, Result};
use crate::superblock::Geometry;

/// A resident cylinder group and whether it differs from the disk copy
#[derive(Debug)]
pub struct LoadedCg {
    cg: CylinderGroup,
    dirty: bool,
}

type Slot = Option<LoadedCg>;

/// Exclusive handle on one cylinder group
///
/// Dropping the handle releases the group. Changes made through it are only
/// persisted if [`CgBuf::mark_dirty`] or [`CgStore::write_now`] is used.
pub struct CgBuf {
    guard: OwnedMappedMutexGuard<Slot, LoadedCg>,
    cgx: u32,
    needs_check: bool,
}

impl CgBuf {
    /// Group number
    pub fn cgx(&self) -> u32 {
        self.cgx
    }

    /// Schedule a delayed write of this group
    pub fn mark_dirty(&mut self) {
        self.guard.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }

    /// The group was read with a bad check-hash that was accepted anyway
    pub fn needs_check(&self) -> bool {
        self.needs_check
    }
}

impl Deref for CgBuf {
    type Target = CylinderGroup;

    fn deref(&self) -> &CylinderGroup {
        &self.guard.cg
    }
}

impl DerefMut for CgBuf {
    fn deref_mut(&mut self) -> &mut CylinderGroup {
        &mut self.guard.cg
    }
}

/// Cache settings
#[derive(Debug, Clone, Copy)]
pub struct CgStoreConfig {
    /// Clean groups kept resident
    pub capacity: usize,
    /// Compute and write cylinder-group check-hashes
    pub hash_groups: bool,
    /// Reject groups whose check-hash does not match
    pub verify_hashes: bool,
    /// Consecutive I/O failures on one group before asking for detach
    pub io_failure_limit: u32,
}

/// Owner of every cylinder group of a mounted filesystem
pub struct CgStore {
    device: Arc<dyn BlockDevice>,
    geom: Geometry,
    config: CgStoreConfig,
    slots: Vec<Arc<AsyncMutex<Slot>>>,
    resident: Mutex<LruCache<u32, ()>>,
    io_failures: Vec<AtomicU32>,
    detach_requested: AtomicBool,
}

impl CgStore {
    pub fn new(device: Arc<dyn BlockDevice>, geom: Geometry, config: CgStoreConfig) -> Self {
        let ncg = geom.ncg as usize;
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            geom,
            config,
            slots: (0..ncg).map(|_| Arc::new(AsyncMutex::new(None))).collect(),
            resident: Mutex::new(LruCache::new(capacity)),
            io_failures: (0..ncg).map(|_| AtomicU32::new(0)).collect(),
            detach_requested: AtomicBool::new(false),
        }
    }

    /// Byte offset of group `c`'s block on the device
    fn offset(&self, c: u32) -> u64 {
        self.geom.fsb_offset(self.geom.cgtod(c))
    }

    fn io_len(&self) -> usize {
        (self.geom.cgsize as u64).div_ceil(DEV_BSIZE) as usize * DEV_BSIZE as usize
    }

    /// Take exclusive ownership of group `c`, reading it if it is not resident
    ///
    /// A group read from the device is checked for magic and group index,
    /// and for its check-hash when the filesystem keeps them. A group that
    /// fails is not cached.
    pub async fn fetch(&self, c: u32) -> Result<CgBuf> {
        let slot = self
            .slots
            .get(c as usize)
            .ok_or_else(|| FsError::BadRequest(format!("cylinder group {} does not exist", c)))?
            .clone();
        let mut guard: OwnedMutexGuard<Slot> = slot.lock_owned().await;

        let mut needs_check = false;
        if guard.is_none() {
            let (cg, mismatch) = self.read_group(c).await?;
            *guard = Some(LoadedCg { cg, dirty: false });
            needs_check = mismatch;
        }
        self.note_resident(c);

        match OwnedMutexGuard::try_map(guard, |slot| slot.as_mut()) {
            Ok(guard) => Ok(CgBuf {
                guard,
                cgx: c,
                needs_check,
            }),
            Err(_) => Err(FsError::corruption(c, "group vanished from the cache")),
        }
    }

    async fn read_group(&self, c: u32) -> Result<(CylinderGroup, bool)> {
        let mut buf = vec![0u8; self.io_len()];
        if let Err(e) = self.device.read_at(self.offset(c), &mut buf).await {
            self.note_io_failure(c);
            return Err(e.into());
        }
        self.io_failures[c as usize].store(0, Ordering::Relaxed);

        let image = &buf[..self.geom.cgsize];
        let mut mismatch = false;
        if self.config.hash_groups {
            let stored = cg_stored_hash(image);
            let computed = cg_image_hash(image);
            if stored != computed {
                if self.config.verify_hashes {
                    log::warn!(
                        "CG: group {} check-hash failed: stored {:#010x}, computed {:#010x}",
                        c,
                        stored,
                        computed
                    );
                    return Err(FsError::validation(
                        "cylinder group",
                        format!("group {} check-hash mismatch", c),
                    ));
                }
                log::warn!("CG: group {} check-hash failed, accepted; needs fsck", c);
                mismatch = true;
            }
        }
        let cg = CylinderGroup::decode(&self.geom, c, image)?;
        log::debug!("CG: read group {}", c);
        Ok((cg, mismatch))
    }

    fn note_io_failure(&self, c: u32) {
        let n = self.io_failures[c as usize].fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.config.io_failure_limit.max(1) && !self.detach_requested.swap(true, Ordering::SeqCst)
        {
            log::error!(
                "CG: {} consecutive I/O failures on group {}, requesting forced detach",
                n,
                c
            );
        }
    }

    /// Whether repeated I/O failures asked for the filesystem to go offline
    pub fn detach_requested(&self) -> bool {
        self.detach_requested.load(Ordering::SeqCst)
    }

    fn note_resident(&self, c: u32) {
        let evicted = self.resident.lock().push(c, ());
        if let Some((old, ())) = evicted {
            if old != c {
                self.try_evict(old);
            }
        }
    }

    fn try_evict(&self, c: u32) {
        if let Ok(mut slot) = self.slots[c as usize].try_lock() {
            if matches!(&*slot, Some(loaded) if !loaded.dirty) {
                *slot = None;
                log::trace!("CG: evicted group {}", c);
            }
        }
    }

    async fn write_loaded(&self, c: u32, loaded: &mut LoadedCg) -> Result<()> {
        let len = self.io_len();
        let image = loaded.cg.encode(self.config.hash_groups)?;
        let result = if image.len() == len {
            self.device.write_at(self.offset(c), image).await
        } else {
            let mut padded = vec![0u8; len];
            padded[..image.len()].copy_from_slice(image);
            self.device.write_at(self.offset(c), &padded).await
        };
        if let Err(e) = result {
            self.note_io_failure(c);
            return Err(e.into());
        }
        loaded.dirty = false;
        Ok(())
    }

    /// Write a held group synchronously
    pub async fn write_now(&self, buf: &mut CgBuf) -> Result<()> {
        let c = buf.cgx;
        self.write_loaded(c, &mut buf.guard).await
    }

    /// Write every dirty group, then drop clean groups the LRU no longer tracks
    pub async fn flush(&self) -> Result<usize> {
        let mut written = 0;
        for (c, slot) in self.slots.iter().enumerate() {
            let mut guard = slot.lock().await;
            if let Some(loaded) = guard.as_mut() {
                if loaded.dirty {
                    self.write_loaded(c as u32, loaded).await?;
                    written += 1;
                }
            }
        }
        let tracked: Vec<u32> = self.resident.lock().iter().map(|(c, _)| *c).collect();
        for c in 0..self.geom.ncg {
            if !tracked.contains(&c) {
                self.try_evict(c);
            }
        }
        Ok(written)
    }

    /// Groups currently held in memory
    pub fn resident_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| match s.try_lock() {
                Ok(slot) => slot.is_some(),
                Err(_) => true,
            })
            .count()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemBlockDevice;
    use crate::superblock::{Superblock, FS_UFS2_MAGIC};

    fn geometry() -> Geometry {
        let sb = Superblock {
            magic: FS_UFS2_MAGIC,
            ncg: 4,
            bsize: 32768,
            fsize: 4096,
            frag: 8,
            fragshift: 3,
            fshift: 12,
            fpg: 2048,
            ipg: 256,
            inopb: 128,
            sblkno: 24,
            cblkno: 32,
            iblkno: 40,
            dblkno: 56,
            cgsize: 32768,
            contigsumsize: 8,
            ..Default::default()
        };
        Geometry::new(&sb).unwrap()
    }

    fn config(capacity: usize, verify: bool) -> CgStoreConfig {
        CgStoreConfig {
            capacity,
            hash_groups: true,
            verify_hashes: verify,
            io_failure_limit: 2,
        }
    }

    async fn device_with_groups(geom: &Geometry) -> Arc<MemBlockDevice> {
        let dev = Arc::new(MemBlockDevice::new(geom.fpg * geom.ncg as u64 * geom.fsize));
        for c in 0..geom.ncg {
            let mut cg = CylinderGroup::new(geom, c, geom.fpg);
            cg.cs.nbfree = 100 + c as i32;
            let image = cg.encode(true).unwrap().to_vec();
            dev.write_at(geom.fsb_offset(geom.cgtod(c)), &image)
                .await
                .unwrap();
        }
        dev
    }

    #[tokio::test]
    async fn test_fetch_caches_group() {
        let geom = geometry();
        let dev = device_with_groups(&geom).await;
        let store = CgStore::new(dev.clone(), geom, config(4, true));

        let buf = store.fetch(1).await.unwrap();
        assert_eq!(buf.cs.nbfree, 101);
        assert!(!buf.needs_check());
        drop(buf);
        let reads = dev.read_count();
        let _buf = store.fetch(1).await.unwrap();
        assert_eq!(dev.read_count(), reads);
    }

    #[tokio::test]
    async fn test_dirty_group_written_on_flush() {
        let geom = geometry();
        let dev = device_with_groups(&geom).await;
        let store = CgStore::new(dev.clone(), geom, config(4, true));

        let mut buf = store.fetch(2).await.unwrap();
        buf.cs.nbfree = 7;
        buf.mark_dirty();
        drop(buf);
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.flush().await.unwrap(), 0);

        let fresh = CgStore::new(dev, geom, config(4, true));
        assert_eq!(fresh.fetch(2).await.unwrap().cs.nbfree, 7);
    }

    #[tokio::test]
    async fn test_corrupt_group() {
        let geom = geometry();
        let dev = device_with_groups(&geom).await;
        dev.corrupt_byte(geom.fsb_offset(geom.cgtod(3)) + 0x200);

        let strict = CgStore::new(dev.clone(), geom, config(4, true));
        assert!(matches!(
            strict.fetch(3).await,
            Err(FsError::Validation { .. })
        ));
        // Not cached after a failed check
        assert!(strict.fetch(3).await.is_err());

        let lenient = CgStore::new(dev, geom, config(4, false));
        assert!(lenient.fetch(3).await.unwrap().needs_check());
    }

    #[tokio::test]
    async fn test_eviction_keeps_dirty_groups() {
        let geom = geometry();
        let dev = device_with_groups(&geom).await;
        let store = CgStore::new(dev.clone(), geom, config(1, true));

        let mut buf = store.fetch(0).await.unwrap();
        buf.mark_dirty();
        drop(buf);
        drop(store.fetch(1).await.unwrap());
        drop(store.fetch(2).await.unwrap());

        // Group 0 is dirty and stays; group 1 was clean and is gone
        assert_eq!(store.resident_count(), 2);
        store.flush().await.unwrap();
        assert_eq!(store.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_io_failures_request_detach() {
        let geom = geometry();
        let dev = device_with_groups(&geom).await;
        let off = geom.fsb_offset(geom.cgtod(1));
        dev.fail_reads(off..off + 512);
        let store = CgStore::new(dev.clone(), geom, config(4, true));

        assert!(matches!(store.fetch(1).await, Err(FsError::Device(_))));
        assert!(!store.detach_requested());
        assert!(store.fetch(1).await.is_err());
        assert!(store.detach_requested());
    }

    #[tokio::test]
    async fn test_group_is_exclusive() {
        let geom = geometry();
        let dev = device_with_groups(&geom).await;
        let store = Arc::new(CgStore::new(dev, geom, config(4, true)));

        let held = store.fetch(0).await.unwrap();
        let s = store.clone();
        let waiter = tokio::spawn(async move { s.fetch(0).await.map(|b| b.cs.nbfree) });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 100);
    }
}
