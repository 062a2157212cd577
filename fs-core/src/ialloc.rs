//! Inode allocation
//!
//! Directories are spread across groups by [`dirpref`]; files follow their
//! parent. UFS2 groups initialise inode blocks lazily: before an inode in an
//! uninitialised block is handed out, that block is zeroed on disk with a
//! barrier write so the group map claiming it can never reach the disk first.

use crate::bitmap::{isclr, setbit, NBBY};
use crate::cg::CylinderGroup;
use crate::error::{FsError, Result};
use crate::fs::{CsumDelta, FsInner, FsState};
use crate::superblock::Geometry;

use crate::alloc::AllocKind;

/// Size of an on-disk UFS2 inode
pub const UFS2_DINODE_SIZE: usize = 256;
/// Offset of the generation number in a UFS2 inode
pub const DI_GEN_OFFSET: usize = 80;

/// A zeroed inode block in which every inode has a random non-zero generation
pub fn fresh_inode_block(bsize: usize) -> Vec<u8> {
    let mut block = vec![0u8; bsize];
    for dinode in block.chunks_exact_mut(UFS2_DINODE_SIZE) {
        let mut gen = 0u32;
        while gen == 0 {
            gen = rand::random();
        }
        dinode[DI_GEN_OFFSET..DI_GEN_OFFSET + 4].copy_from_slice(&gen.to_le_bytes());
    }
    block
}

/// Pick the first inode of the group a new directory should go in
///
/// Directories under the root go to a lightly used group chosen at random.
/// Others stay near the parent while the group has inodes and blocks to
/// spare and has not taken too many directories in a row.
pub(crate) fn dirpref(
    st: &FsState,
    geom: &Geometry,
    parent: u64,
    parent_is_root: bool,
    random: u32,
) -> u64 {
    let ncg = geom.ncg as i64;
    let ipg = geom.ipg as i64;
    let t = &st.sb.cstotal;
    let avgifree = t.nifree / ncg;
    let avgbfree = t.nbfree / ncg;
    let avgndir = t.ndir / ncg;
    let cs = |c: u32| st.csums[c as usize];

    if parent_is_root {
        let prefcg = random % geom.ncg;
        let mut mincg = prefcg;
        let mut minndir = ipg;
        for c in (prefcg..geom.ncg).chain(0..prefcg) {
            let s = cs(c);
            if (s.ndir as i64) < minndir
                && s.nifree as i64 >= avgifree
                && s.nbfree as i64 >= avgbfree
            {
                mincg = c;
                minndir = s.ndir as i64;
            }
        }
        return geom.ipg * mincg as u64;
    }

    let maxndir = (avgndir + ipg / 16).min(ipg);
    let minifree = (avgifree - avgifree / 4).max(1);
    let minbfree = (avgbfree - avgbfree / 4).max(1);
    let cgsize = (geom.fsize * geom.fpg) as i64;
    let bsize = geom.bsize as i64;
    let mut dirsize = (geom.avgfilesize * geom.avgfpdir) as i64;
    let curdirsize = if avgndir > 0 {
        (cgsize - avgbfree * bsize) / avgndir
    } else {
        0
    };
    if dirsize < curdirsize {
        dirsize = curdirsize;
    }
    let mut maxcontigdirs = if dirsize <= 0 {
        0
    } else {
        (avgbfree * bsize / dirsize).min(255)
    };
    if geom.avgfpdir > 0 {
        maxcontigdirs = maxcontigdirs.min(ipg / geom.avgfpdir as i64);
    }
    if maxcontigdirs == 0 {
        maxcontigdirs = 1;
    }

    let prefcg = geom.ino_to_cg(parent).min(geom.ncg - 1);
    let order = || (prefcg..geom.ncg).chain(0..prefcg);
    for c in order() {
        let s = cs(c);
        if (s.ndir as i64) < maxndir
            && s.nifree as i64 >= minifree
            && s.nbfree as i64 >= minbfree
            && (st.contigdirs[c as usize] as i64) < maxcontigdirs
        {
            return geom.ipg * c as u64;
        }
    }
    // Short on space: settle for any group with average free inodes
    for c in order() {
        if cs(c).nifree as i64 >= avgifree {
            return geom.ipg * c as u64;
        }
    }
    0
}

/// First free slot at or after the inode rotor, wrapping once
fn scan_inosused(cg: &CylinderGroup, ipg: u64) -> Result<u64> {
    let map = &cg.inosused;
    if map.is_empty() {
        return Err(FsError::corruption(cg.cgx, "empty inode map"));
    }
    let start = ((cg.irotor / NBBY) as usize).min(map.len() - 1);
    let len = (ipg.saturating_sub(cg.irotor).div_ceil(NBBY) as usize).max(1);
    let end = (start + len).min(map.len());
    let byte = match map[start..end].iter().position(|&b| b != 0xff) {
        Some(i) => start + i,
        None => match map[..=start].iter().position(|&b| b != 0xff) {
            Some(i) => i,
            None => return Err(FsError::corruption(cg.cgx, "inode map full but counted free")),
        },
    };
    let slot = byte as u64 * NBBY + (!map[byte]).trailing_zeros() as u64;
    if slot >= cg.niblk {
        return Err(FsError::corruption(
            cg.cgx,
            format!("free inode {} beyond the {} in the group", slot, cg.niblk),
        ));
    }
    Ok(slot)
}

impl FsInner {
    /// Allocate an inode, asking the reclaimer once before giving up
    pub(crate) async fn valloc(&self, parent: u64, parent_is_root: bool, is_dir: bool) -> Result<u64> {
        let g = self.geom;
        let mut reclaimed = false;
        loop {
            let random: u32 = rand::random();
            let start = self.with_state(|st| {
                if st.sb.cstotal.nifree <= 0 {
                    return None;
                }
                let mut ipref = if is_dir {
                    dirpref(st, &g, parent, parent_is_root, random)
                } else {
                    parent
                };
                if ipref >= g.ninodes() {
                    ipref = 0;
                }
                let c = g.ino_to_cg(ipref);
                let run = &mut st.contigdirs[c as usize];
                if is_dir {
                    *run = run.saturating_add(1);
                } else {
                    *run = run.saturating_sub(1);
                }
                Some((c, ipref))
            });
            if let Some((c, ipref)) = start {
                if let Some(ino) = self
                    .hashalloc(c, ipref, AllocKind::Inode { is_dir }, parent)
                    .await?
                {
                    log::trace!("IALLOC: inode {} for parent {}", ino, parent);
                    return Ok(ino);
                }
            }
            if !reclaimed {
                reclaimed = true;
                self.reclaimer.reclaim().await;
                continue;
            }
            self.report_full("out of inodes", parent);
            return Err(FsError::NoInodes);
        }
    }

    /// Allocate an inode in group `c`, preferring `ipref` if it is free
    pub(crate) async fn nodealloccg(&self, c: u32, ipref: u64, is_dir: bool) -> Result<Option<u64>> {
        let g = self.geom;
        if self.group_csum(c).nifree == 0 {
            return Ok(None);
        }
        let mut buf = self.getcg(c).await?;
        loop {
            if buf.cs.nifree == 0 {
                return Ok(None);
            }
            let preferred = if ipref != 0 {
                let p = ipref % g.ipg;
                (p < buf.niblk && isclr(&buf.inosused, p)).then_some(p)
            } else {
                None
            };
            let slot = match preferred {
                Some(p) => p,
                None => scan_inosused(&buf, g.ipg)?,
            };

            if g.is_ufs2() && slot + g.inopb > buf.initediblk && buf.initediblk < buf.niblk {
                let old = buf.initediblk;
                let lock = self.init_locks[c as usize].clone();
                match lock.clone().try_lock_owned() {
                    Ok(held) => {
                        drop(buf);
                        self.init_inode_block(c, old).await?;
                        buf = self.getcg(c).await?;
                        // Another initialiser may have moved the watermark already
                        if buf.initediblk == old {
                            buf.initediblk = (old + g.inopb).min(buf.niblk);
                            buf.mark_dirty();
                        }
                        drop(held);
                    }
                    Err(_) => {
                        drop(buf);
                        drop(lock.lock().await);
                        if self.group_csum(c).nifree == 0 {
                            return Ok(None);
                        }
                        buf = self.getcg(c).await?;
                    }
                }
                continue;
            }

            let cg = &mut *buf;
            cg.irotor = slot;
            setbit(&mut cg.inosused, slot);
            let delta = CsumDelta {
                nifree: -1,
                ndir: if is_dir { 1 } else { 0 },
                ..Default::default()
            };
            delta.apply_to(&mut cg.cs);
            self.with_state(|st| st.apply(c, delta, None));
            cg.touch();
            buf.mark_dirty();
            let ino = c as u64 * g.ipg + slot;
            self.hooks.inode_claimed(c, ino, is_dir);
            return Ok(Some(ino));
        }
    }

    /// Zero the inode block holding group-relative inode `first` and order
    /// it before any later write
    async fn init_inode_block(&self, c: u32, first: u64) -> Result<()> {
        let g = self.geom;
        let ino = c as u64 * g.ipg + first;
        let offset = g.fsb_offset(g.ino_to_fsba(ino));
        let block = fresh_inode_block(g.bsize as usize);
        if self.config.async_inode_init {
            self.device.write_barrier_at(offset, &block).await?;
        } else {
            self.device.write_at(offset, &block).await?;
        }
        log::debug!("IALLOC: initialised inodes {}..{} of group {}", first, first + g.inopb, c);
        Ok(())
    }
}
