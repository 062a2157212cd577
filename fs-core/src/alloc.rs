//! Block and fragment allocation
//!
//! Allocation starts in the group holding the preferred address (or the
//! inode's group) and falls back through [`FsInner::hashalloc`]. Each
//! per-group allocator fetches the group, decides from its maps, and updates
//! the group header and the in-memory summary together.

use crate::bitmap::{
    blkmap, clrbit, clrblock, clusteracct, isblock, isclr, isset, scanc, setbit, AROUND, INSIDE,
    NBBY,
};
use crate::cg::CylinderGroup;
use crate::error::{FsError, Result};
use crate::fs::{BlockRequest, CsumDelta, FsInner, ReallocRequest};
use crate::superblock::{Geometry, FS_OPTSPACE, FS_OPTTIME};
use crate::trim::TrimKey;

/// What a per-group allocator is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocKind {
    /// `size` bytes, keeping only `rsize` of a split block
    Frags { size: u64, rsize: u64 },
    /// `len` contiguous full blocks
    Cluster { len: u64 },
    /// An inode
    Inode { is_dir: bool },
}

/// Find a free run of `allocsiz` fragments in `cg`, starting the byte scan
/// at `bpref` (or the fragment rotor) and wrapping once
///
/// Advances the fragment rotor. Only called when the summaries promise such
/// a run, so not finding one means the maps are corrupt.
pub(crate) fn mapsearch(
    geom: &Geometry,
    cg: &mut CylinderGroup,
    bpref: u64,
    allocsiz: u64,
) -> Result<u64> {
    let maplen = cg.blksfree.len();
    if maplen == 0 {
        return Err(FsError::corruption(cg.cgx, "empty fragment map"));
    }
    let start = if bpref != 0 {
        geom.dtogd(bpref) / NBBY
    } else {
        cg.frotor / NBBY
    };
    let start = (start as usize).min(maplen - 1);
    let table = geom.frag.table();
    let mask = geom.frag.run_mask(allocsiz);

    let byte = match scanc(&cg.blksfree[start..], table, mask) {
        Some(i) => start + i,
        None => match scanc(&cg.blksfree[..=start], table, mask) {
            Some(i) => i,
            None => {
                return Err(FsError::corruption(
                    cg.cgx,
                    format!("no free run of {} fragments in the map", allocsiz),
                ))
            }
        },
    };

    let f = geom.frags();
    let mut bno = byte as u64 * NBBY;
    cg.frotor = bno;
    let end = bno + NBBY;
    while bno < end {
        let blk = blkmap(geom.frag, &cg.blksfree, bno) << 1;
        let mut field = AROUND[allocsiz as usize];
        let mut subfield = INSIDE[allocsiz as usize];
        for pos in 0..=(f - allocsiz) {
            if blk & field == subfield {
                return Ok(bno + pos);
            }
            field <<= 1;
            subfield <<= 1;
        }
        bno += f;
    }
    Err(FsError::corruption(
        cg.cgx,
        format!("run of {} fragments not found in byte {}", allocsiz, byte),
    ))
}

impl FsInner {
    pub(crate) fn check_size(&self, size: u64) -> Result<()> {
        let g = &self.geom;
        if size == 0 || size > g.bsize || size % g.fsize != 0 {
            return Err(FsError::BadRequest(format!(
                "size {} is not a fragment multiple of at most {}",
                size, g.bsize
            )));
        }
        Ok(())
    }

    /// Allocate `req.size` bytes, asking the reclaimer once before giving up
    pub(crate) async fn alloc(&self, req: &BlockRequest) -> Result<u64> {
        self.check_size(req.size)?;
        let g = self.geom;
        let bpref = if req.bpref >= g.size { 0 } else { req.bpref };
        let c = if bpref == 0 {
            g.ino_to_cg(req.ino.min(g.ninodes().saturating_sub(1)))
        } else {
            g.dtog(bpref)
        };

        let mut reclaimed = false;
        loop {
            let possible = self.with_state(|st| {
                if req.size == g.bsize && st.sb.cstotal.nbfree <= 0 {
                    return false;
                }
                req.privileged
                    || st.freespace(&g, g.minfree) - g.numfrags(req.size) as i64 >= 0
            });
            if possible {
                let kind = AllocKind::Frags {
                    size: req.size,
                    rsize: req.size,
                };
                if let Some(bno) = self.hashalloc(c, bpref, kind, req.ino).await? {
                    return Ok(bno);
                }
            }
            if !reclaimed {
                reclaimed = true;
                log::debug!("ALLOC: no space for inode {}, asking for reclaim", req.ino);
                self.reclaimer.reclaim().await;
                continue;
            }
            self.report_full("filesystem is full", req.ino);
            return Err(FsError::NoSpace);
        }
    }

    /// Try the preferred group, then a quadratic rehash, then every group
    ///
    /// Returns `Ok(None)` once every group has declined.
    pub(crate) async fn hashalloc(
        &self,
        icg: u32,
        pref: u64,
        kind: AllocKind,
        ino: u64,
    ) -> Result<Option<u64>> {
        let ncg = self.geom.ncg;
        if let Some(found) = self.alloc_in(icg, pref, kind, ino).await? {
            return Ok(Some(found));
        }
        let mut cg = icg;
        let mut i = 1;
        while i < ncg {
            cg += i;
            if cg >= ncg {
                cg -= ncg;
            }
            if let Some(found) = self.alloc_in(cg, 0, kind, ino).await? {
                return Ok(Some(found));
            }
            i *= 2;
        }
        // Offset 0 was tried first and offset 1 in the rehash
        let mut cg = (icg + 2) % ncg;
        for _ in 2..ncg {
            if let Some(found) = self.alloc_in(cg, 0, kind, ino).await? {
                return Ok(Some(found));
            }
            cg += 1;
            if cg == ncg {
                cg = 0;
            }
        }
        Ok(None)
    }

    async fn alloc_in(&self, c: u32, pref: u64, kind: AllocKind, ino: u64) -> Result<Option<u64>> {
        match kind {
            AllocKind::Frags { size, rsize } => self.alloccg(c, pref, size, rsize, ino).await,
            AllocKind::Cluster { len } => self.clusteralloc(c, pref, len, ino).await,
            AllocKind::Inode { is_dir } => self.nodealloccg(c, pref, is_dir).await,
        }
    }

    /// Allocate `size` bytes in group `c`
    ///
    /// A full block comes from [`FsInner::alloccgblk`]. A fragment request
    /// takes the smallest free run that fits, or splits a block when there
    /// is none.
    pub(crate) async fn alloccg(
        &self,
        c: u32,
        bpref: u64,
        size: u64,
        rsize: u64,
        ino: u64,
    ) -> Result<Option<u64>> {
        let g = self.geom;
        if size == g.bsize && self.group_csum(c).nbfree == 0 {
            return Ok(None);
        }
        let mut buf = self.getcg(c).await?;
        let cg = &mut *buf;
        if size == g.bsize && cg.cs.nbfree == 0 {
            return Ok(None);
        }

        let frags = g.numfrags(size);
        let mut allocsiz = frags;
        while allocsiz < g.frags() && cg.frsum[allocsiz as usize] == 0 {
            allocsiz += 1;
        }
        let bno = if size == g.bsize || allocsiz == g.frags() {
            if cg.cs.nbfree == 0 {
                return Ok(None);
            }
            self.alloccgblk(cg, bpref, rsize)?
        } else {
            let bno = mapsearch(&g, cg, bpref, allocsiz)?;
            for i in 0..frags {
                clrbit(&mut cg.blksfree, bno + i);
            }
            cg.frsum[allocsiz as usize] -= 1;
            if frags != allocsiz {
                cg.frsum[(allocsiz - frags) as usize] += 1;
            }
            let delta = CsumDelta {
                nffree: -(frags as i64),
                ..Default::default()
            };
            delta.apply_to(&mut cg.cs);
            self.with_state(|st| st.apply(c, delta, None));
            g.cgbase(c) + bno
        };
        cg.touch();
        buf.mark_dirty();
        let claimed = g.numfrags(rsize);
        self.hooks.block_claimed(c, bno, claimed, ino);
        log::trace!("ALLOC: group {} gave {} fragments at {}", c, claimed, bno);
        Ok(Some(bno))
    }

    /// Take a full block from a held group, freeing the tail beyond `rsize`
    ///
    /// `bpref == 0` starts one block past the rotor. A preference in another
    /// group keeps its zone: metadata stays in the metadata zone.
    pub(crate) fn alloccgblk(&self, cg: &mut CylinderGroup, bpref: u64, rsize: u64) -> Result<u64> {
        let g = self.geom;
        let c = cg.cgx;
        let bpref = if bpref == 0 {
            g.cgbase(c) + cg.rotor + g.frags()
        } else {
            let prefcg = g.dtog(bpref);
            if prefcg != c {
                if bpref < g.cgdata(prefcg) {
                    g.cgmeta(c)
                } else {
                    g.cgdata(c)
                }
            } else {
                bpref
            }
        };

        let mut bno = g.dtogd(g.blknum(bpref));
        if bno >= cg.ndblk || !isblock(g.frag, &cg.blksfree, g.fragstoblks(bno)) {
            bno = mapsearch(&g, cg, bpref, g.frags())?;
            // The rotor only tracks the data zone
            if bno >= g.dtogd(g.cgdata(c)) {
                cg.rotor = bno;
            }
        }

        let blkno = g.fragstoblks(bno);
        clrblock(g.frag, &mut cg.blksfree, blkno);
        let maxcluster = if cg.has_clusters() {
            clusteracct(
                g.contigsumsize,
                &mut cg.clustersfree,
                &mut cg.clustersum,
                cg.nclusterblks,
                blkno,
                -1,
            )
        } else {
            None
        };
        let mut delta = CsumDelta {
            nbfree: -1,
            ..Default::default()
        };

        let want = g.numfrags(rsize);
        if want != g.frags() {
            for i in want..g.frags() {
                setbit(&mut cg.blksfree, bno + i);
            }
            let rest = g.frags() - want;
            delta.nffree += rest as i64;
            cg.frsum[rest as usize] += 1;
        }
        delta.apply_to(&mut cg.cs);
        self.with_state(|st| st.apply(c, delta, maxcluster));
        Ok(g.cgbase(c) + bno)
    }

    /// Grow the run at `bprev` from `osize` to `nsize` bytes in place
    pub(crate) async fn fragextend(
        &self,
        c: u32,
        bprev: u64,
        osize: u64,
        nsize: u64,
        ino: u64,
    ) -> Result<Option<u64>> {
        let g = self.geom;
        let ofrags = g.numfrags(osize);
        let frags = g.numfrags(nsize);
        if (self.group_csum(c).nffree as i64) < (frags - ofrags) as i64 {
            return Ok(None);
        }
        let bbase = g.fragnum(bprev);
        if bbase > g.fragnum(bprev + frags - 1) {
            // would cross a block boundary
            return Ok(None);
        }

        let mut buf = self.getcg(c).await?;
        let cg = &mut *buf;
        let bno = g.dtogd(bprev);
        if (ofrags..frags).any(|i| isclr(&cg.blksfree, bno + i)) {
            return Ok(None);
        }

        // Length of the free run being cut into
        let mut i = frags;
        while i < g.frags() - bbase && isset(&cg.blksfree, bno + i) {
            i += 1;
        }
        let run = (i - ofrags) as usize;
        if cg.frsum[run] <= 0 {
            return Err(FsError::corruption(
                c,
                format!("no free run of {} recorded at {}", run, bprev),
            ));
        }
        cg.frsum[run] -= 1;
        if i != frags {
            cg.frsum[(i - frags) as usize] += 1;
        }
        for i in ofrags..frags {
            clrbit(&mut cg.blksfree, bno + i);
        }
        let delta = CsumDelta {
            nffree: -((frags - ofrags) as i64),
            ..Default::default()
        };
        delta.apply_to(&mut cg.cs);
        self.with_state(|st| st.apply(c, delta, None));
        cg.touch();
        buf.mark_dirty();
        self.hooks.block_claimed(c, bprev + ofrags, frags - ofrags, ino);
        log::trace!("ALLOC: extended {} to {} fragments in place", bprev, frags);
        Ok(Some(bprev))
    }

    /// Grow a fragment run, moving it when it cannot grow in place
    ///
    /// A move frees the old run afterwards. Under time optimisation the new
    /// location is a full block whose tail is given back right away, so the
    /// next growth can happen in place.
    pub(crate) async fn realloccg(&self, req: &ReallocRequest) -> Result<u64> {
        let g = self.geom;
        self.check_size(req.osize)?;
        self.check_size(req.nsize)?;
        if req.nsize <= req.osize {
            return Err(FsError::BadRequest(format!(
                "cannot grow {} bytes to {}",
                req.osize, req.nsize
            )));
        }
        if req.bprev == 0
            || req.bprev >= g.size
            || g.fragnum(req.bprev) + g.numfrags(req.osize) > g.frags()
        {
            return Err(FsError::BadRequest(format!(
                "bad previous run {} of {} bytes",
                req.bprev, req.osize
            )));
        }
        let c = g.dtog(req.bprev);
        let bpref = if req.bpref >= g.size { 0 } else { req.bpref };
        let grow = g.numfrags(req.nsize - req.osize) as i64;

        let mut reclaimed = false;
        loop {
            let allowed = req.privileged
                || self.with_state(|st| st.freespace(&g, g.minfree) - grow >= 0);
            if allowed {
                if let Some(bno) = self
                    .fragextend(c, req.bprev, req.osize, req.nsize, req.ino)
                    .await?
                {
                    return Ok(bno);
                }
                let request = self.with_state(|st| {
                    let mnt = st.sb.mount_point();
                    let nffree = st.sb.cstotal.nffree;
                    let dsize = g.dsize as i64;
                    if st.sb.optim == FS_OPTSPACE {
                        if g.minfree > 5 && nffree <= dsize * g.minfree / (2 * 100) {
                            log::warn!("ALLOC: {}: optimization changed from SPACE to TIME", mnt);
                            st.sb.optim = FS_OPTTIME;
                            st.sb.fmod = 1;
                        }
                        req.nsize
                    } else {
                        if nffree >= dsize * (g.minfree - 2) / 100 {
                            log::warn!("ALLOC: {}: optimization changed from TIME to SPACE", mnt);
                            st.sb.optim = FS_OPTSPACE;
                            st.sb.fmod = 1;
                        }
                        g.bsize
                    }
                });
                let kind = AllocKind::Frags {
                    size: request,
                    rsize: req.nsize,
                };
                if let Some(bno) = self.hashalloc(c, bpref, kind, req.ino).await? {
                    self.blkfree(req.bprev, req.osize, req.ino, TrimKey::Singleton)
                        .await?;
                    log::trace!("ALLOC: moved {} to {}", req.bprev, bno);
                    return Ok(bno);
                }
            }
            if !reclaimed {
                reclaimed = true;
                self.reclaimer.reclaim().await;
                continue;
            }
            self.report_full("filesystem is full", req.ino);
            return Err(FsError::NoSpace);
        }
    }

    /// Allocate a cluster of `len` full blocks
    pub(crate) async fn alloc_cluster(&self, ino: u64, bpref: u64, len: u64) -> Result<u64> {
        let g = self.geom;
        if g.contigsumsize <= 0 {
            return Err(FsError::BadRequest(
                "filesystem does not track clusters".into(),
            ));
        }
        if len == 0 || len > g.contigsumsize as u64 {
            return Err(FsError::BadRequest(format!(
                "cluster of {} blocks (limit {})",
                len, g.contigsumsize
            )));
        }
        let bpref = if bpref >= g.size { 0 } else { bpref };
        let c = if bpref == 0 {
            g.ino_to_cg(ino.min(g.ninodes().saturating_sub(1)))
        } else {
            g.dtog(bpref)
        };
        match self
            .hashalloc(c, bpref, AllocKind::Cluster { len }, ino)
            .await?
        {
            Some(bno) => Ok(bno),
            None => Err(FsError::NoSpace),
        }
    }

    /// Allocate `len` contiguous blocks in group `c`, at or after `bpref`
    ///
    /// The first fruitless query of a group replaces its optimistic cluster
    /// hint with the true longest cluster.
    pub(crate) async fn clusteralloc(
        &self,
        c: u32,
        bpref: u64,
        len: u64,
        ino: u64,
    ) -> Result<Option<u64>> {
        let g = self.geom;
        let contig = g.contigsumsize as u64;
        let hint = self.with_state(|st| st.maxcluster.get(c as usize).copied().unwrap_or(0));
        if (hint as i64) < len as i64 {
            return Ok(None);
        }

        let mut buf = self.getcg(c).await?;
        let cg = &mut *buf;
        if !cg.has_clusters() {
            return Err(FsError::corruption(c, "cluster maps missing"));
        }
        if !(len..=contig).any(|i| cg.clustersum[i as usize] > 0) {
            let mut i = len - 1;
            while i > 0 && cg.clustersum[i as usize] <= 0 {
                i -= 1;
            }
            self.with_state(|st| st.maxcluster[c as usize] = i as i32);
            log::trace!("ALLOC: group {} longest cluster is {}", c, i);
            return Ok(None);
        }

        // Never search before the preference
        let bpref = if g.dtog(bpref) != c {
            g.cgdata(c)
        } else {
            g.blknum(bpref)
        };
        let mut got = g.fragstoblks(g.dtogd(bpref));
        let mut run = 0;
        let mut found = false;
        while got < cg.nclusterblks as u64 {
            if isset(&cg.clustersfree, got) {
                run += 1;
                if run == len {
                    found = true;
                    break;
                }
            } else {
                run = 0;
            }
            got += 1;
        }
        if !found {
            return Ok(None);
        }

        let first = got + 1 - len;
        if (first..first + len).any(|b| !isblock(g.frag, &cg.blksfree, b)) {
            return Err(FsError::corruption(
                c,
                format!("cluster map disagrees with fragment map at block {}", first),
            ));
        }
        let bno = g.cgbase(c) + g.blkstofrags(first);
        for i in 0..len {
            let want = bno + g.blkstofrags(i);
            let got = self.alloccgblk(cg, want, g.bsize)?;
            if got != want {
                return Err(FsError::corruption(
                    c,
                    format!("cluster block {} allocated as {}", want, got),
                ));
            }
        }
        cg.touch();
        buf.mark_dirty();
        self.hooks.block_claimed(c, bno, g.blkstofrags(len), ino);
        log::trace!("ALLOC: group {} gave a cluster of {} at {}", c, len, bno);
        Ok(Some(bno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{setblock, FragsPerBlock};
    use crate::superblock::{Superblock, FS_UFS2_MAGIC};

    fn geometry() -> Geometry {
        let sb = Superblock {
            magic: FS_UFS2_MAGIC,
            ncg: 1,
            bsize: 32768,
            fsize: 4096,
            frag: 8,
            fragshift: 3,
            fshift: 12,
            fpg: 1024,
            ipg: 256,
            inopb: 128,
            sblkno: 24,
            cblkno: 32,
            iblkno: 40,
            dblkno: 56,
            cgsize: 4096,
            contigsumsize: 4,
            size: 1024,
            dsize: 968,
            ..Default::default()
        };
        Geometry::new(&sb).unwrap()
    }

    #[test]
    fn test_mapsearch_finds_smallest_fit_from_preference() {
        let geom = geometry();
        assert_eq!(geom.frag, FragsPerBlock::Eight);
        let mut cg = CylinderGroup::new(&geom, 0, 1024);
        // Fragments 66..69 free (a run of 3), block 16 fully free
        for f in 66..69 {
            setbit(&mut cg.blksfree, f);
        }
        setblock(geom.frag, &mut cg.blksfree, 16);

        let bno = mapsearch(&geom, &mut cg, 0, 3).unwrap();
        assert_eq!(bno, 66);
        assert_eq!(cg.frotor, 64);

        // Searching past the run wraps around to it
        let bno = mapsearch(&geom, &mut cg, 200, 3).unwrap();
        assert_eq!(bno, 66);
        // Runs are matched by exact length
        assert!(mapsearch(&geom, &mut cg, 0, 2).is_err());
    }

    #[test]
    fn test_mapsearch_full_block() {
        let geom = geometry();
        let mut cg = CylinderGroup::new(&geom, 0, 1024);
        setblock(geom.frag, &mut cg.blksfree, 100);
        let bno = mapsearch(&geom, &mut cg, 64, 8).unwrap();
        assert_eq!(bno, 800);
    }

    #[test]
    fn test_mapsearch_empty_map_is_corruption() {
        let geom = geometry();
        let mut cg = CylinderGroup::new(&geom, 0, 1024);
        let err = mapsearch(&geom, &mut cg, 0, 1).unwrap_err();
        assert!(err.is_fatal());
    }
}
