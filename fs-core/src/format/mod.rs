//! Filesystem creation
//!
//! Lays out a fresh UFS2 filesystem: a primary superblock at
//! [`SBLOCK_UFS2`], and in every group a backup superblock, a
//! cylinder-group block and the first two inode blocks. Group 0 also holds
//! the summary array right after its inode blocks.

use futures::future::try_join_all;
use std::io;

use crate::bitmap::{count_clusters, setbit, setblock, FragsPerBlock, NBBY};
use crate::blockdev::{BlockDevice, DEV_BSIZE};
use crate::cg::{CgLayout, CylinderGroup};
use crate::config::FormatOptions;
use crate::error::{FsError, Result};
use crate::ialloc::{fresh_inode_block, UFS2_DINODE_SIZE};
use crate::superblock::{
    write_superblock, Csum, CsumTotal, Geometry, Superblock, FS_FLAGS_UPDATED, FS_METACKHASH,
    FS_OPTSPACE, FS_OPTTIME, FS_TRIM, FS_UFS2_MAGIC, MAXBSIZE, MAXVOLLEN, MINBSIZE, SBLOCKSIZE,
    SBLOCK_STRUCT_SIZE, SBLOCK_UFS2, CK_CYLGRP,
};

/// Longest cluster the summary may track
const FS_MAXCONTIG: u32 = 16;
/// Direct block pointers in an inode
const UFS_NDADDR: u64 = 12;
/// Indirect block pointers in an inode
const UFS_NIADDR: u32 = 3;
/// Symlinks this short live inside a UFS2 inode
const UFS2_MAXSYMLINKLEN: i32 = 120;
const FS_44INODEFMT: i32 = 2;
const FS_DYNAMICPOSTBLFMT: i32 = 1;

fn bad(detail: impl Into<String>) -> FsError {
    FsError::InvalidGeometry(detail.into())
}

fn roundup(x: u64, y: u64) -> u64 {
    x.div_ceil(y) * y
}

/// Sizes chosen for a new filesystem, in fragments unless noted
#[derive(Debug, Clone, Copy)]
struct Plan {
    bsize: u64,
    fsize: u64,
    frag: FragsPerBlock,
    inopb: u64,
    sblkno: u64,
    cblkno: u64,
    iblkno: u64,
    dblkno: u64,
    fpg: u64,
    ipg: u64,
    ncg: u32,
    size: u64,
    contig: u32,
    csfrags: u64,
}

impl Plan {
    fn new(opts: &FormatOptions, device_size: u64) -> Result<Self> {
        let bsize = opts.block_size as u64;
        let fsize = opts.fragment_size as u64;
        if !bsize.is_power_of_two()
            || bsize < MINBSIZE as u64
            || bsize > MAXBSIZE as u64
        {
            return Err(bad(format!("block size {}", bsize)));
        }
        if !fsize.is_power_of_two() || fsize < DEV_BSIZE || fsize > bsize {
            return Err(bad(format!("fragment size {}", fsize)));
        }
        let frag = FragsPerBlock::new((bsize / fsize) as i32)?;
        if opts.minfree > 99 {
            return Err(bad(format!("minfree {}%", opts.minfree)));
        }
        if opts.optim != FS_OPTTIME && opts.optim != FS_OPTSPACE {
            return Err(bad(format!("optimisation mode {}", opts.optim)));
        }
        if opts.density == 0 {
            return Err(bad("zero bytes per inode"));
        }
        let bytes = match opts.size {
            0 => device_size,
            n if n <= device_size => n,
            n => {
                return Err(bad(format!(
                    "{} bytes requested on a {} byte device",
                    n, device_size
                )))
            }
        };

        let f = frag.get();
        let inopb = bsize / UFS2_DINODE_SIZE as u64;
        let sblkno = roundup((SBLOCK_UFS2 + SBLOCKSIZE as u64).div_ceil(fsize), f);
        let cblkno = sblkno + roundup((SBLOCKSIZE as u64).div_ceil(fsize), f);
        let iblkno = cblkno + f;
        let contig = opts.max_cluster.min(FS_MAXCONTIG);
        let total = bytes / fsize;

        let inodes_for = |fpg: u64| -> u64 {
            roundup((fpg * fsize / opts.density as u64).max(inopb), inopb)
        };
        let fits = |fpg: u64, ipg: u64| -> bool {
            let meta = iblkno + ipg / inopb * f;
            let layout = CgLayout::standard(&probe_geometry(bsize, fsize, frag, fpg, ipg, contig));
            layout.nextfreeoff <= bsize as usize && meta + f <= fpg
        };

        let (fpg, ipg) = if opts.frags_per_group != 0 {
            let fpg = opts.frags_per_group as u64 / f * f;
            let ipg = inodes_for(fpg);
            if fpg == 0 || !fits(fpg, ipg) {
                return Err(bad(format!("{} fragments per group", opts.frags_per_group)));
            }
            (fpg, ipg)
        } else {
            // Largest group whose maps fit in one block, no larger than needed
            let step = f * NBBY;
            let mut fpg = roundup(total.max(step), step).min(bsize * NBBY / 2 / step * step);
            loop {
                let ipg = inodes_for(fpg);
                if fits(fpg, ipg) {
                    break (fpg, ipg);
                }
                if fpg <= step {
                    return Err(bad("cannot fit a cylinder group in one block"));
                }
                fpg -= step;
            }
        };
        let dblkno = iblkno + ipg / inopb * f;

        let mut ncg = total.div_ceil(fpg);
        let mut size = total;
        let last = total - (ncg.saturating_sub(1)) * fpg;
        if ncg > 1 && last < dblkno + f {
            ncg -= 1;
            size = ncg * fpg;
        }
        let csfrags = (ncg * Csum::SIZE as u64).div_ceil(fsize);
        if ncg == 0 || size.min(fpg) < dblkno + csfrags + f {
            return Err(bad(format!("{} bytes is too small", bytes)));
        }
        Ok(Self {
            bsize,
            fsize,
            frag,
            inopb,
            sblkno,
            cblkno,
            iblkno,
            dblkno,
            fpg,
            ipg,
            ncg: ncg as u32,
            size,
            contig,
            csfrags,
        })
    }

    /// Data fragments: everything but group metadata, the boot area and
    /// the summary array
    fn dsize(&self) -> u64 {
        self.size - self.sblkno - self.ncg as u64 * (self.dblkno - self.sblkno) - self.csfrags
    }
}

/// Geometry with just enough filled in to compute a group layout
fn probe_geometry(
    bsize: u64,
    fsize: u64,
    frag: FragsPerBlock,
    fpg: u64,
    ipg: u64,
    contig: u32,
) -> Geometry {
    Geometry {
        magic: FS_UFS2_MAGIC,
        ncg: 1,
        bsize,
        fsize,
        frag,
        fragshift: frag.get().trailing_zeros(),
        fshift: fsize.trailing_zeros(),
        fpg,
        ipg,
        inopb: bsize / UFS2_DINODE_SIZE as u64,
        sblkno: 0,
        cblkno: 0,
        iblkno: 0,
        dblkno: 0,
        old_cgoffset: 0,
        old_cgmask: 0,
        metaspace: 0,
        cgsize: bsize as usize,
        contigsumsize: contig as i32,
        size: fpg,
        dsize: fpg,
        minfree: 0,
        avgfilesize: 0,
        avgfpdir: 0,
    }
}

fn random_id() -> Result<i32> {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf)
        .map_err(|e| FsError::from(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
    Ok(i32::from_le_bytes(buf))
}

fn build_superblock(plan: &Plan, opts: &FormatOptions, device_size: u64) -> Result<Superblock> {
    let now = chrono::Utc::now().timestamp();
    let bsize = plan.bsize as i32;
    let fsize = plan.fsize as i32;
    let nindir = plan.bsize / 8;
    let mut maxfilesize = plan.bsize * UFS_NDADDR - 1;
    let mut sizepb = plan.bsize;
    for _ in 0..UFS_NIADDR {
        sizepb = sizepb.saturating_mul(nindir);
        maxfilesize = maxfilesize.saturating_add(sizepb);
    }
    let mut volname = [0u8; MAXVOLLEN];
    let name = opts.volume_name.as_bytes();
    let n = name.len().min(MAXVOLLEN - 1);
    volname[..n].copy_from_slice(&name[..n]);
    let cgsize = CgLayout::standard(&probe_geometry(
        plan.bsize,
        plan.fsize,
        plan.frag,
        plan.fpg,
        plan.ipg,
        plan.contig,
    ))
    .nextfreeoff as u64;

    let mut flags = 0;
    if opts.metackhash != 0 {
        flags |= FS_METACKHASH;
    }
    if opts.trim {
        flags |= FS_TRIM;
    }

    let sb = Superblock {
        sblkno: plan.sblkno as i32,
        cblkno: plan.cblkno as i32,
        iblkno: plan.iblkno as i32,
        dblkno: plan.dblkno as i32,
        ncg: plan.ncg,
        bsize,
        fsize,
        frag: plan.frag.get() as i32,
        minfree: opts.minfree as i32,
        bmask: !(bsize - 1),
        fmask: !(fsize - 1),
        bshift: plan.bsize.trailing_zeros() as i32,
        fshift: plan.fsize.trailing_zeros() as i32,
        maxcontig: plan.contig.max(1) as i32,
        maxbpg: nindir as i32,
        fragshift: plan.frag.get().trailing_zeros() as i32,
        fsbtodb: (plan.fsize / DEV_BSIZE).trailing_zeros() as i32,
        sbsize: roundup(SBLOCK_STRUCT_SIZE as u64, plan.fsize) as i32,
        nindir: nindir as i32,
        inopb: plan.inopb as u32,
        optim: opts.optim,
        id: [now as i32, random_id()?],
        cssize: (plan.csfrags * plan.fsize) as i32,
        cgsize: roundup(cgsize, plan.fsize) as i32,
        ipg: plan.ipg as u32,
        fpg: plan.fpg as i32,
        clean: 1,
        old_flags: FS_FLAGS_UPDATED,
        maxbsize: bsize,
        providersize: (device_size / plan.fsize) as i64,
        sblockactualloc: SBLOCK_UFS2 as i64,
        sblockloc: SBLOCK_UFS2 as i64,
        time: now,
        size: plan.size as i64,
        dsize: plan.dsize() as i64,
        csaddr: plan.dblkno as i64,
        avgfilesize: opts.avg_file_size,
        avgfpdir: opts.avg_files_per_dir,
        metackhash: opts.metackhash,
        flags,
        contigsumsize: plan.contig as i32,
        maxsymlinklen: UFS2_MAXSYMLINKLEN,
        old_inodefmt: FS_44INODEFMT,
        maxfilesize,
        qbmask: (bsize - 1) as i64,
        qfmask: (fsize - 1) as i64,
        old_postblformat: FS_DYNAMICPOSTBLFMT,
        old_nrpos: 1,
        magic: FS_UFS2_MAGIC,
        volname,
        ..Default::default()
    };
    Ok(sb)
}

/// Build group `c` with everything outside its metadata free
fn init_group(geom: &Geometry, plan: &Plan, c: u32, reserved_inodes: u64) -> CylinderGroup {
    let f = geom.frags();
    let cbase = geom.cgbase(c);
    let dmax = (cbase + geom.fpg).min(geom.size);
    let ndblk = dmax - cbase;
    let mut cg = CylinderGroup::new(geom, c, ndblk);
    cg.initediblk = geom.ipg.min(2 * geom.inopb);
    cg.cs.nifree = geom.ipg as i32;
    if c == 0 {
        for i in 0..reserved_inodes.min(geom.ipg) {
            setbit(&mut cg.inosused, i);
            cg.cs.nifree -= 1;
        }
    }

    let free_block = |cg: &mut CylinderGroup, d: u64| {
        let blkno = d / f;
        setblock(geom.frag, &mut cg.blksfree, blkno);
        if cg.has_clusters() {
            setbit(&mut cg.clustersfree, blkno);
        }
        cg.cs.nbfree += 1;
    };

    // Groups after the first can use the space before their backup superblock
    let dlower = geom.cgsblock(c) - cbase;
    if c > 0 {
        let mut d = 0;
        while d < dlower {
            free_block(&mut cg, d);
            d += f;
        }
    }
    let mut dupper = geom.cgdmin(c) - cbase;
    if c == 0 {
        dupper += plan.csfrags;
    }
    let partial = dupper % f;
    if partial != 0 {
        cg.frsum[(f - partial) as usize] += 1;
        let end = dupper + f - partial;
        while dupper < end {
            setbit(&mut cg.blksfree, dupper);
            cg.cs.nffree += 1;
            dupper += 1;
        }
    }
    let mut d = dupper;
    while d + f <= ndblk {
        free_block(&mut cg, d);
        d += f;
    }
    if d < ndblk {
        cg.frsum[(ndblk - d) as usize] += 1;
        while d < ndblk {
            setbit(&mut cg.blksfree, d);
            cg.cs.nffree += 1;
            d += 1;
        }
    }
    if cg.has_clusters() {
        cg.clustersum = count_clusters(geom.contigsumsize, &cg.clustersfree, cg.nclusterblks);
    }
    cg.touch();
    cg
}

/// Lay out a new filesystem on `device`
///
/// Returns the superblock as written.
pub async fn format_device(device: &dyn BlockDevice, opts: &FormatOptions) -> Result<Superblock> {
    let plan = Plan::new(opts, device.size())?;
    let mut sb = build_superblock(&plan, opts, device.size())?;
    let geom = Geometry::new(&sb)?;
    log::info!(
        "FORMAT: {} groups of {} fragments ({} inodes each), bsize {}, fsize {}",
        plan.ncg,
        plan.fpg,
        plan.ipg,
        plan.bsize,
        plan.fsize
    );

    let mut groups: Vec<CylinderGroup> = (0..plan.ncg)
        .map(|c| init_group(&geom, &plan, c, opts.reserved_inodes as u64))
        .collect();
    let csums: Vec<Csum> = groups.iter().map(|cg| cg.cs).collect();
    let mut total = CsumTotal::default();
    for cs in &csums {
        total.ndir += cs.ndir as i64;
        total.nbfree += cs.nbfree as i64;
        total.nifree += cs.nifree as i64;
        total.nffree += cs.nffree as i64;
    }
    sb.cstotal = total;
    sb.ckhash = sb.calc_sbhash()?;
    let sb_image = sb.encode()?;
    let sb_len = roundup(sb.sbsize as u64, DEV_BSIZE) as usize;
    let cg_len = roundup(geom.cgsize as u64, DEV_BSIZE) as usize;
    let hash_groups = sb.metackhash & CK_CYLGRP != 0;

    for cg in groups.iter_mut() {
        let c = cg.cgx;
        let mut cg_image = vec![0u8; cg_len];
        let encoded = cg.encode(hash_groups)?;
        cg_image[..encoded.len()].copy_from_slice(encoded);

        let inode_blocks: Vec<(u64, Vec<u8>)> = (0..cg.initediblk / geom.inopb)
            .map(|i| {
                let fsb = geom.cgimin(c) + geom.blkstofrags(i);
                (geom.fsb_offset(fsb), fresh_inode_block(geom.bsize as usize))
            })
            .collect();

        let mut writes = vec![
            (geom.fsb_offset(geom.cgsblock(c)), sb_image[..sb_len].to_vec()),
            (geom.fsb_offset(geom.cgtod(c)), cg_image),
        ];
        writes.extend(inode_blocks);
        try_join_all(
            writes
                .iter()
                .map(|(offset, data)| device.write_at(*offset, data)),
        )
        .await?;
        log::debug!("FORMAT: wrote group {}", c);
    }

    write_superblock(device, &mut sb, &csums).await?;
    device.sync().await?;
    log::info!(
        "FORMAT: {} data fragments, {} free blocks, {} free inodes",
        sb.dsize,
        sb.cstotal.nbfree,
        sb.cstotal.nifree
    );
    Ok(sb)
}
