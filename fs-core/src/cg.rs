//! Cylinder-group block codec
//!
//! A cylinder group block is a fixed header followed by the inode-used map,
//! the free-fragment map, the cluster summary and the free-cluster map, at
//! offsets recorded in the header itself. Decoding copies the maps out so the
//! allocator can borrow them independently; encoding writes them back into
//! the preserved raw image so fields this crate does not model survive.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

use crate::bitmap::MAXFRAG;
use crate::error::{FsError, Result};
use crate::superblock::{ffs_crc32c, Csum, Geometry};

/// Magic number of a cylinder-group block
pub const CG_MAGIC: i32 = 0x090255;
/// Size of the fixed cylinder-group header
pub const CG_HEADER_SIZE: usize = 0xa8;

const CG_MAGIC_OFFSET: usize = 0x04;
const CG_CGX_OFFSET: usize = 0x0c;
const CG_CKHASH_OFFSET: usize = 0x84;

/// Where the variable-length maps live inside a cylinder-group block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgLayout {
    pub iusedoff: usize,
    pub freeoff: usize,
    pub nextfreeoff: usize,
    pub clustersumoff: usize,
    pub clusteroff: usize,
}

impl CgLayout {
    /// Layout a fresh filesystem uses for every group
    pub fn standard(geom: &Geometry) -> Self {
        let iusedoff = CG_HEADER_SIZE;
        let freeoff = iusedoff + geom.ipg.div_ceil(8) as usize;
        let mut nextfreeoff = freeoff + geom.fpg.div_ceil(8) as usize;
        let mut clustersumoff = 0;
        let mut clusteroff = 0;
        if geom.contigsumsize > 0 {
            // The summary is indexed from 1, so slot 0 overlaps the previous word
            clustersumoff = nextfreeoff.next_multiple_of(4) - 4;
            clusteroff = clustersumoff + (geom.contigsumsize as usize + 1) * 4;
            nextfreeoff = clusteroff + geom.fragstoblks(geom.fpg).div_ceil(8) as usize;
        }
        Self {
            iusedoff,
            freeoff,
            nextfreeoff,
            clustersumoff,
            clusteroff,
        }
    }
}

/// Decoded cylinder-group block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CylinderGroup {
    pub cgx: u32,
    /// Fragments in this group (the last group may be short)
    pub ndblk: u64,
    /// Inodes in this group
    pub niblk: u64,
    pub cs: Csum,
    /// Last full block allocated
    pub rotor: u64,
    /// Last fragment allocated
    pub frotor: u64,
    /// Last inode allocated
    pub irotor: u64,
    /// Free runs of each length shorter than a block
    pub frsum: [i32; MAXFRAG],
    pub nclusterblks: u32,
    /// Inodes below this number sit in initialised inode blocks
    pub initediblk: u64,
    pub unrefs: u32,
    pub time: i64,
    pub ckhash: u32,
    pub inosused: Vec<u8>,
    pub blksfree: Vec<u8>,
    /// Cluster summary, indexed by cluster length; slot 0 is unused
    pub clustersum: Vec<i32>,
    pub clustersfree: Vec<u8>,
    layout: CgLayout,
    ufs2: bool,
    image: Vec<u8>,
}

/// Check-hash of a raw cylinder-group image
pub fn cg_image_hash(image: &[u8]) -> u32 {
    let mut copy = image.to_vec();
    copy[CG_CKHASH_OFFSET..CG_CKHASH_OFFSET + 4].fill(0);
    ffs_crc32c(&copy)
}

/// Stored check-hash of a raw cylinder-group image
pub fn cg_stored_hash(image: &[u8]) -> u32 {
    u32::from_le_bytes([
        image[CG_CKHASH_OFFSET],
        image[CG_CKHASH_OFFSET + 1],
        image[CG_CKHASH_OFFSET + 2],
        image[CG_CKHASH_OFFSET + 3],
    ])
}

fn region(
    image: &[u8],
    what: &'static str,
    cgx: u32,
    off: usize,
    len: usize,
) -> Result<Vec<u8>> {
    image
        .get(off..off + len)
        .map(|s| s.to_vec())
        .ok_or_else(|| {
            FsError::validation(
                "cylinder group",
                format!("group {} {} at {}+{} lies outside the block", cgx, what, off, len),
            )
        })
}

impl CylinderGroup {
    /// Build an empty group with every map cleared
    pub fn new(geom: &Geometry, cgx: u32, ndblk: u64) -> Self {
        let layout = CgLayout::standard(geom);
        let nclusterblks = if geom.contigsumsize > 0 {
            geom.fragstoblks(ndblk) as u32
        } else {
            0
        };
        let clustersum = if geom.contigsumsize > 0 {
            vec![0; geom.contigsumsize as usize + 1]
        } else {
            Vec::new()
        };
        let clustersfree = if geom.contigsumsize > 0 {
            vec![0; geom.fragstoblks(geom.fpg).div_ceil(8) as usize]
        } else {
            Vec::new()
        };
        Self {
            cgx,
            ndblk,
            niblk: geom.ipg,
            cs: Csum::default(),
            rotor: 0,
            frotor: 0,
            irotor: 0,
            frsum: [0; MAXFRAG],
            nclusterblks,
            initediblk: 0,
            unrefs: 0,
            time: 0,
            ckhash: 0,
            inosused: vec![0; geom.ipg.div_ceil(8) as usize],
            blksfree: vec![0; geom.fpg.div_ceil(8) as usize],
            clustersum,
            clustersfree,
            layout,
            ufs2: geom.is_ufs2(),
            image: vec![0; geom.cgsize],
        }
    }

    /// Parse the block of group `cgx`
    ///
    /// The image comes from the device and is untrusted: every problem is a
    /// validation error. The check-hash is not examined here.
    pub fn decode(geom: &Geometry, cgx: u32, image: &[u8]) -> Result<Self> {
        if image.len() < geom.cgsize || geom.cgsize < CG_HEADER_SIZE {
            return Err(FsError::validation(
                "cylinder group",
                format!("group {} block is {} bytes", cgx, image.len()),
            ));
        }
        let image = &image[..geom.cgsize];
        let mut r = Cursor::new(image);
        r.set_position(CG_MAGIC_OFFSET as u64);
        let magic = r.read_i32::<LittleEndian>()?;
        if magic != CG_MAGIC {
            return Err(FsError::validation(
                "cylinder group",
                format!("group {} has bad magic {:#x}", cgx, magic),
            ));
        }
        let old_time = r.read_i32::<LittleEndian>()?;
        let found = r.read_u32::<LittleEndian>()?;
        if found != cgx {
            return Err(FsError::validation(
                "cylinder group",
                format!("block for group {} claims to be group {}", cgx, found),
            ));
        }
        let _old_ncyl = r.read_i16::<LittleEndian>()?;
        let old_niblk = r.read_i16::<LittleEndian>()?;
        let ndblk = r.read_u32::<LittleEndian>()? as u64;
        let cs = Csum::read_from(&mut r)?;
        let rotor = r.read_u32::<LittleEndian>()? as u64;
        let frotor = r.read_u32::<LittleEndian>()? as u64;
        let irotor = r.read_u32::<LittleEndian>()? as u64;
        let mut frsum = [0i32; MAXFRAG];
        for v in frsum.iter_mut() {
            *v = r.read_i32::<LittleEndian>()?;
        }
        let _old_btotoff = r.read_i32::<LittleEndian>()?;
        let _old_boff = r.read_i32::<LittleEndian>()?;
        let iusedoff = r.read_u32::<LittleEndian>()? as usize;
        let freeoff = r.read_u32::<LittleEndian>()? as usize;
        let nextfreeoff = r.read_u32::<LittleEndian>()? as usize;
        let clustersumoff = r.read_u32::<LittleEndian>()? as usize;
        let clusteroff = r.read_u32::<LittleEndian>()? as usize;
        let nclusterblks = r.read_u32::<LittleEndian>()?;
        let niblk = r.read_u32::<LittleEndian>()? as u64;
        let initediblk = r.read_u32::<LittleEndian>()? as u64;
        let unrefs = r.read_u32::<LittleEndian>()?;
        let _sparecon32 = r.read_i32::<LittleEndian>()?;
        let ckhash = r.read_u32::<LittleEndian>()?;
        let time = r.read_i64::<LittleEndian>()?;

        let ufs2 = geom.is_ufs2();
        let (niblk, time) = if ufs2 {
            (niblk, time)
        } else {
            (old_niblk.max(0) as u64, old_time as i64)
        };

        if ndblk == 0 || ndblk > geom.fpg || niblk > geom.ipg {
            return Err(FsError::validation(
                "cylinder group",
                format!(
                    "group {} sizes out of range ({} fragments, {} inodes)",
                    cgx, ndblk, niblk
                ),
            ));
        }
        if initediblk > niblk || nclusterblks as u64 > geom.fragstoblks(geom.fpg) {
            return Err(FsError::validation(
                "cylinder group",
                format!(
                    "group {} watermarks out of range (inited {}, clusters {})",
                    cgx, initediblk, nclusterblks
                ),
            ));
        }
        if frsum.iter().any(|&n| n < 0) {
            return Err(FsError::validation(
                "cylinder group",
                format!("group {} has a negative fragment summary", cgx),
            ));
        }

        let inosused = region(image, "inode map", cgx, iusedoff, geom.ipg.div_ceil(8) as usize)?;
        let blksfree = region(image, "fragment map", cgx, freeoff, geom.fpg.div_ceil(8) as usize)?;
        let (clustersum, clustersfree) = if geom.contigsumsize > 0 {
            let n = geom.contigsumsize as usize;
            let raw = region(image, "cluster summary", cgx, clustersumoff + 4, n * 4)?;
            let mut sum = vec![0i32; n + 1];
            let mut rs = Cursor::new(&raw[..]);
            for v in sum.iter_mut().skip(1) {
                *v = rs.read_i32::<LittleEndian>()?;
            }
            let map = region(
                image,
                "cluster map",
                cgx,
                clusteroff,
                geom.fragstoblks(geom.fpg).div_ceil(8) as usize,
            )?;
            (sum, map)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Self {
            cgx,
            ndblk,
            niblk,
            cs,
            // Rotors only steer searches; clamp rather than trust them
            rotor: if rotor < ndblk { rotor } else { 0 },
            frotor: if frotor < ndblk { frotor } else { 0 },
            irotor: if irotor < niblk { irotor } else { 0 },
            frsum,
            nclusterblks,
            initediblk,
            unrefs,
            time,
            ckhash,
            inosused,
            blksfree,
            clustersum,
            clustersfree,
            layout: CgLayout {
                iusedoff,
                freeoff,
                nextfreeoff,
                clustersumoff,
                clusteroff,
            },
            ufs2,
            image: image.to_vec(),
        })
    }

    /// Serialise into the preserved image, updating the check-hash when
    /// `with_hash` is set, and return the bytes to write
    pub fn encode(&mut self, with_hash: bool) -> io::Result<&[u8]> {
        self.write_header()?;
        let l = self.layout;
        self.image[l.iusedoff..l.iusedoff + self.inosused.len()].copy_from_slice(&self.inosused);
        self.image[l.freeoff..l.freeoff + self.blksfree.len()].copy_from_slice(&self.blksfree);
        if !self.clustersum.is_empty() {
            for (i, v) in self.clustersum.iter().enumerate().skip(1) {
                let off = l.clustersumoff + 4 * i;
                self.image[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            self.image[l.clusteroff..l.clusteroff + self.clustersfree.len()]
                .copy_from_slice(&self.clustersfree);
        }
        if with_hash {
            self.ckhash = cg_image_hash(&self.image);
            self.image[CG_CKHASH_OFFSET..CG_CKHASH_OFFSET + 4]
                .copy_from_slice(&self.ckhash.to_le_bytes());
        }
        Ok(&self.image)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let ufs2 = self.ufs2;
        let mut w = Cursor::new(&mut self.image[..CG_HEADER_SIZE]);
        w.set_position(CG_MAGIC_OFFSET as u64);
        w.write_i32::<LittleEndian>(CG_MAGIC)?;
        w.write_i32::<LittleEndian>(self.time as i32)?;
        debug_assert_eq!(w.position() as usize, CG_CGX_OFFSET);
        w.write_u32::<LittleEndian>(self.cgx)?;
        w.set_position(0x12);
        w.write_i16::<LittleEndian>(if ufs2 { 0 } else { self.niblk as i16 })?;
        w.write_u32::<LittleEndian>(self.ndblk as u32)?;
        self.cs.write_to(&mut w)?;
        w.write_u32::<LittleEndian>(self.rotor as u32)?;
        w.write_u32::<LittleEndian>(self.frotor as u32)?;
        w.write_u32::<LittleEndian>(self.irotor as u32)?;
        for v in self.frsum {
            w.write_i32::<LittleEndian>(v)?;
        }
        w.set_position(0x5c);
        w.write_u32::<LittleEndian>(self.layout.iusedoff as u32)?;
        w.write_u32::<LittleEndian>(self.layout.freeoff as u32)?;
        w.write_u32::<LittleEndian>(self.layout.nextfreeoff as u32)?;
        w.write_u32::<LittleEndian>(self.layout.clustersumoff as u32)?;
        w.write_u32::<LittleEndian>(self.layout.clusteroff as u32)?;
        w.write_u32::<LittleEndian>(self.nclusterblks)?;
        w.write_u32::<LittleEndian>(if ufs2 { self.niblk as u32 } else { 0 })?;
        w.write_u32::<LittleEndian>(self.initediblk as u32)?;
        w.write_u32::<LittleEndian>(self.unrefs)?;
        w.set_position(CG_CKHASH_OFFSET as u64);
        w.write_u32::<LittleEndian>(0)?;
        if ufs2 {
            w.write_i64::<LittleEndian>(self.time)?;
        }
        Ok(())
    }

    /// Record a modification time
    pub fn touch(&mut self) {
        self.time = chrono::Utc::now().timestamp();
    }

    pub fn layout(&self) -> CgLayout {
        self.layout
    }

    /// Whether cluster maps are present
    pub fn has_clusters(&self) -> bool {
        !self.clustersum.is_empty()
    }
}
