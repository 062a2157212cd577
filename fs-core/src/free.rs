//! Returning blocks, fragments and inodes to the free maps

use crate::bitmap::{
    blkmap, clrbit, clusteracct, fragacct, isblock, isclr, isfreeblock, isset, setbit, setblock,
};
use crate::error::{FsError, Result};
use crate::fs::{CsumDelta, FsInner};
use crate::trim::{PendingFree, TrimKey};

impl FsInner {
    fn check_extent(&self, bno: u64, size: u64) -> Result<()> {
        let g = &self.geom;
        self.check_size(size)?;
        if g.fragnum(bno) + g.numfrags(size) > g.frags() {
            return Err(FsError::BadRequest(format!(
                "{} bytes at {} cross a block boundary",
                size, bno
            )));
        }
        if bno >= g.size || bno + g.numfrags(size) > g.size {
            return Err(FsError::BadRequest(format!("bad block {}", bno)));
        }
        Ok(())
    }

    /// Free `size` bytes at `bno`, routing through a discard when enabled
    pub(crate) async fn blkfree(&self, bno: u64, size: u64, ino: u64, key: TrimKey) -> Result<()> {
        self.check_extent(bno, size)?;
        if key == TrimKey::NoTrim || !self.trim.enabled() {
            return self.blkfree_cg(bno, size, ino).await;
        }
        let frags = self.geom.numfrags(size);
        self.trim
            .submit(&self.device, PendingFree::new(bno, size, ino, frags), key);
        Ok(())
    }

    /// Return an extent to its group's maps
    ///
    /// Freeing anything already free is corruption. A fragment free that
    /// completes a block turns its fragments back into one free block.
    pub(crate) async fn blkfree_cg(&self, bno: u64, size: u64, ino: u64) -> Result<()> {
        self.check_extent(bno, size)?;
        let g = self.geom;
        let c = g.dtog(bno);
        let mut buf = self.getcg(c).await?;
        let cg = &mut *buf;
        let cgbno = g.dtogd(bno);
        let mut delta = CsumDelta::default();
        let mut maxcluster = None;

        if size == g.bsize {
            let fragno = g.fragstoblks(cgbno);
            if !isfreeblock(g.frag, &cg.blksfree, fragno) {
                return Err(FsError::corruption(c, format!("freeing free block {}", bno)));
            }
            setblock(g.frag, &mut cg.blksfree, fragno);
            if cg.has_clusters() {
                maxcluster = clusteracct(
                    g.contigsumsize,
                    &mut cg.clustersfree,
                    &mut cg.clustersum,
                    cg.nclusterblks,
                    fragno,
                    1,
                );
            }
            delta.nbfree += 1;
        } else {
            let bbase = cgbno - g.fragnum(cgbno);
            let frags = g.numfrags(size);
            if let Some(i) = (0..frags).find(|&i| isset(&cg.blksfree, cgbno + i)) {
                return Err(FsError::corruption(
                    c,
                    format!("freeing free fragment {}", bno + i),
                ));
            }
            let blk = blkmap(g.frag, &cg.blksfree, bbase);
            fragacct(g.frag, blk, &mut cg.frsum, -1);
            for i in 0..frags {
                setbit(&mut cg.blksfree, cgbno + i);
            }
            delta.nffree += frags as i64;
            let blk = blkmap(g.frag, &cg.blksfree, bbase);
            fragacct(g.frag, blk, &mut cg.frsum, 1);

            // A reassembled block is counted as a block, not as fragments
            let fragno = g.fragstoblks(bbase);
            if isblock(g.frag, &cg.blksfree, fragno) {
                delta.nffree -= g.frags() as i64;
                if cg.has_clusters() {
                    maxcluster = clusteracct(
                        g.contigsumsize,
                        &mut cg.clustersfree,
                        &mut cg.clustersum,
                        cg.nclusterblks,
                        fragno,
                        1,
                    );
                }
                delta.nbfree += 1;
            }
        }
        delta.apply_to(&mut cg.cs);
        self.with_state(|st| st.apply(c, delta, maxcluster));
        cg.touch();
        buf.mark_dirty();
        self.hooks.block_freed(c, bno, g.numfrags(size), ino);
        log::trace!("FREE: {} fragments at {}", g.numfrags(size), bno);
        Ok(())
    }

    /// Return inode `ino` to its group's map
    pub(crate) async fn freefile(&self, ino: u64, is_dir: bool) -> Result<()> {
        let g = self.geom;
        if ino >= g.ninodes() {
            return Err(FsError::BadRequest(format!("bad inode number {}", ino)));
        }
        let c = g.ino_to_cg(ino);
        let mut buf = self.getcg(c).await?;
        let cg = &mut *buf;
        let cgino = ino % g.ipg;
        if isclr(&cg.inosused, cgino) {
            return Err(FsError::corruption(c, format!("freeing free inode {}", ino)));
        }
        clrbit(&mut cg.inosused, cgino);
        if cgino < cg.irotor {
            cg.irotor = cgino;
        }
        let delta = CsumDelta {
            nifree: 1,
            ndir: if is_dir { -1 } else { 0 },
            ..Default::default()
        };
        delta.apply_to(&mut cg.cs);
        self.with_state(|st| st.apply(c, delta, None));
        cg.touch();
        buf.mark_dirty();
        self.hooks.inode_freed(c, ino, is_dir);
        log::trace!("FREE: inode {}", ino);
        Ok(())
    }
}
