//! Superblock store
//!
//! Parses, validates, checksums and persists the filesystem-wide descriptor
//! (`struct fs`) and its per-group summary array. The byte layout is the
//! Berkeley FFS layout shared by UFS1 and UFS2, little-endian.

use arrayref::array_ref;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::bitmap::FragsPerBlock;
use crate::blockdev::{BlockDevice, DEV_BSIZE};
use crate::error::{FsError, Result};

/// Magic number of a UFS1 superblock
pub const FS_UFS1_MAGIC: i32 = 0x011954;
/// Magic number of a UFS2 superblock
pub const FS_UFS2_MAGIC: i32 = 0x19540119;

/// Standard superblock locations, in search order
pub const SBLOCK_FLOPPY: u64 = 0;
pub const SBLOCK_UFS1: u64 = 8192;
pub const SBLOCK_UFS2: u64 = 65536;
pub const SBLOCK_PIGGY: u64 = 262144;
pub const SBLOCKSEARCH: [u64; 4] = [SBLOCK_UFS2, SBLOCK_UFS1, SBLOCK_FLOPPY, SBLOCK_PIGGY];

/// Bytes reserved for the superblock at each location
pub const SBLOCKSIZE: usize = 8192;
/// Size of the on-disk `struct fs`
pub const SBLOCK_STRUCT_SIZE: usize = 0x560;

pub const MINBSIZE: i32 = 4096;
pub const MAXBSIZE: i32 = 65536;
pub const MAXMNTLEN: usize = 468;
pub const MAXVOLLEN: usize = 32;
/// First inode that ordinary allocation hands out on a fresh filesystem
pub const UFS_ROOTINO: u32 = 2;

/// Optimisation modes
pub const FS_OPTTIME: i32 = 0;
pub const FS_OPTSPACE: i32 = 1;

/// `fs_flags` bits
pub const FS_UNCLEAN: i32 = 0x0001;
pub const FS_DOSOFTDEP: i32 = 0x0002;
pub const FS_NEEDSFSCK: i32 = 0x0004;
pub const FS_METACKHASH: i32 = 0x0200;
pub const FS_TRIM: i32 = 0x0400;
/// `fs_old_flags` bit saying `fs_flags` is authoritative
pub const FS_FLAGS_UPDATED: i8 = 0x80u8 as i8;

/// `fs_metackhash` bits
pub const CK_SUPERBLOCK: u32 = 0x0001;
pub const CK_CYLGRP: u32 = 0x0002;
pub const CK_INODE: u32 = 0x0004;

/// Byte range of the transient in-core pointers inside `struct fs`
const TRANSIENT: std::ops::Range<usize> = 0x2d8..0x358;
/// Offset of `fs_ckhash`
const CKHASH_OFFSET: usize = 0x518;

/// Per-group summary counters (`struct csum`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Csum {
    pub ndir: i32,
    pub nbfree: i32,
    pub nifree: i32,
    pub nffree: i32,
}

impl Csum {
    /// On-disk size
    pub const SIZE: usize = 16;

    pub(crate) fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            ndir: r.read_i32::<LittleEndian>()?,
            nbfree: r.read_i32::<LittleEndian>()?,
            nifree: r.read_i32::<LittleEndian>()?,
            nffree: r.read_i32::<LittleEndian>()?,
        })
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(self.ndir)?;
        w.write_i32::<LittleEndian>(self.nbfree)?;
        w.write_i32::<LittleEndian>(self.nifree)?;
        w.write_i32::<LittleEndian>(self.nffree)
    }
}

/// Filesystem-wide totals (`struct csum_total`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CsumTotal {
    pub ndir: i64,
    pub nbfree: i64,
    pub nifree: i64,
    pub nffree: i64,
    pub numclusters: i64,
    pub spare: [i64; 3],
}

/// The filesystem descriptor as stored on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub firstfield: i32,
    pub unused_1: i32,
    /// Offset of the backup superblock in each group, in fragments
    pub sblkno: i32,
    /// Offset of the cylinder-group block in each group
    pub cblkno: i32,
    /// Offset of the inode blocks in each group
    pub iblkno: i32,
    /// Offset of the first data block after the group metadata
    pub dblkno: i32,
    pub old_cgoffset: i32,
    pub old_cgmask: i32,
    pub old_time: i32,
    pub old_size: i32,
    pub old_dsize: i32,
    pub ncg: u32,
    pub bsize: i32,
    pub fsize: i32,
    pub frag: i32,
    pub minfree: i32,
    pub old_rotdelay: i32,
    pub old_rps: i32,
    pub bmask: i32,
    pub fmask: i32,
    pub bshift: i32,
    pub fshift: i32,
    pub maxcontig: i32,
    pub maxbpg: i32,
    pub fragshift: i32,
    pub fsbtodb: i32,
    pub sbsize: i32,
    pub spare1: [i32; 2],
    pub nindir: i32,
    pub inopb: u32,
    pub old_nspf: i32,
    pub optim: i32,
    pub old_npsect: i32,
    pub old_interleave: i32,
    pub old_trackskew: i32,
    pub id: [i32; 2],
    pub old_csaddr: i32,
    pub cssize: i32,
    pub cgsize: i32,
    pub spare2: i32,
    pub old_nsect: i32,
    pub old_spc: i32,
    pub old_ncyl: i32,
    pub old_cpg: i32,
    pub ipg: u32,
    pub fpg: i32,
    pub old_cstotal: Csum,
    pub fmod: i8,
    pub clean: i8,
    pub ronly: i8,
    pub old_flags: i8,
    pub fsmnt: [u8; MAXMNTLEN],
    pub volname: [u8; MAXVOLLEN],
    pub swuid: u64,
    pub pad: i32,
    pub cgrotor: i32,
    pub old_cpc: i32,
    pub maxbsize: i32,
    pub unrefs: i64,
    pub providersize: i64,
    pub metaspace: i64,
    pub sparecon64: [i64; 13],
    pub sblockactualloc: i64,
    pub sblockloc: i64,
    pub cstotal: CsumTotal,
    pub time: i64,
    pub size: i64,
    pub dsize: i64,
    pub csaddr: i64,
    pub pendingblocks: i64,
    pub pendinginodes: u32,
    pub snapinum: [u32; 20],
    pub avgfilesize: u32,
    pub avgfpdir: u32,
    pub save_cgsize: i32,
    pub mtime: i64,
    pub sujfree: i32,
    pub sparecon32: [i32; 21],
    pub ckhash: u32,
    pub metackhash: u32,
    pub flags: i32,
    pub contigsumsize: i32,
    pub maxsymlinklen: i32,
    pub old_inodefmt: i32,
    pub maxfilesize: u64,
    pub qbmask: i64,
    pub qfmask: i64,
    pub state: i32,
    pub old_postblformat: i32,
    pub old_nrpos: i32,
    pub spare5: [i32; 2],
    pub magic: i32,
    /// Bytes between the end of `struct fs` and the end of the superblock area
    pub trailer: Vec<u8>,
}

impl Default for Superblock {
    fn default() -> Self {
        Self {
            firstfield: 0,
            unused_1: 0,
            sblkno: 0,
            cblkno: 0,
            iblkno: 0,
            dblkno: 0,
            old_cgoffset: 0,
            old_cgmask: 0,
            old_time: 0,
            old_size: 0,
            old_dsize: 0,
            ncg: 0,
            bsize: 0,
            fsize: 0,
            frag: 0,
            minfree: 0,
            old_rotdelay: 0,
            old_rps: 0,
            bmask: 0,
            fmask: 0,
            bshift: 0,
            fshift: 0,
            maxcontig: 0,
            maxbpg: 0,
            fragshift: 0,
            fsbtodb: 0,
            sbsize: 0,
            spare1: [0; 2],
            nindir: 0,
            inopb: 0,
            old_nspf: 0,
            optim: FS_OPTTIME,
            old_npsect: 0,
            old_interleave: 0,
            old_trackskew: 0,
            id: [0; 2],
            old_csaddr: 0,
            cssize: 0,
            cgsize: 0,
            spare2: 0,
            old_nsect: 0,
            old_spc: 0,
            old_ncyl: 0,
            old_cpg: 0,
            ipg: 0,
            fpg: 0,
            old_cstotal: Csum::default(),
            fmod: 0,
            clean: 0,
            ronly: 0,
            old_flags: 0,
            fsmnt: [0; MAXMNTLEN],
            volname: [0; MAXVOLLEN],
            swuid: 0,
            pad: 0,
            cgrotor: 0,
            old_cpc: 0,
            maxbsize: 0,
            unrefs: 0,
            providersize: 0,
            metaspace: 0,
            sparecon64: [0; 13],
            sblockactualloc: 0,
            sblockloc: 0,
            cstotal: CsumTotal::default(),
            time: 0,
            size: 0,
            dsize: 0,
            csaddr: 0,
            pendingblocks: 0,
            pendinginodes: 0,
            snapinum: [0; 20],
            avgfilesize: 0,
            avgfpdir: 0,
            save_cgsize: 0,
            mtime: 0,
            sujfree: 0,
            sparecon32: [0; 21],
            ckhash: 0,
            metackhash: 0,
            flags: 0,
            contigsumsize: 0,
            maxsymlinklen: 0,
            old_inodefmt: 0,
            maxfilesize: 0,
            qbmask: 0,
            qfmask: 0,
            state: 0,
            old_postblformat: 0,
            old_nrpos: 0,
            spare5: [0; 2],
            magic: 0,
            trailer: vec![0; SBLOCKSIZE - SBLOCK_STRUCT_SIZE],
        }
    }
}

fn read_i32s<R: Read, const N: usize>(r: &mut R) -> io::Result<[i32; N]> {
    let mut out = [0i32; N];
    for v in out.iter_mut() {
        *v = r.read_i32::<LittleEndian>()?;
    }
    Ok(out)
}

fn read_u32s<R: Read, const N: usize>(r: &mut R) -> io::Result<[u32; N]> {
    let mut out = [0u32; N];
    for v in out.iter_mut() {
        *v = r.read_u32::<LittleEndian>()?;
    }
    Ok(out)
}

fn read_i64s<R: Read, const N: usize>(r: &mut R) -> io::Result<[i64; N]> {
    let mut out = [0i64; N];
    for v in out.iter_mut() {
        *v = r.read_i64::<LittleEndian>()?;
    }
    Ok(out)
}

impl Superblock {
    /// Decode a superblock image of at least [`SBLOCK_STRUCT_SIZE`] bytes
    ///
    /// No validation happens here; see [`read_superblock`].
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < SBLOCK_STRUCT_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "superblock image too short",
            ));
        }
        let mut r = Cursor::new(&buf[..SBLOCK_STRUCT_SIZE]);
        let mut sb = Superblock {
            firstfield: r.read_i32::<LittleEndian>()?,
            unused_1: r.read_i32::<LittleEndian>()?,
            sblkno: r.read_i32::<LittleEndian>()?,
            cblkno: r.read_i32::<LittleEndian>()?,
            iblkno: r.read_i32::<LittleEndian>()?,
            dblkno: r.read_i32::<LittleEndian>()?,
            old_cgoffset: r.read_i32::<LittleEndian>()?,
            old_cgmask: r.read_i32::<LittleEndian>()?,
            old_time: r.read_i32::<LittleEndian>()?,
            old_size: r.read_i32::<LittleEndian>()?,
            old_dsize: r.read_i32::<LittleEndian>()?,
            ncg: r.read_u32::<LittleEndian>()?,
            bsize: r.read_i32::<LittleEndian>()?,
            fsize: r.read_i32::<LittleEndian>()?,
            frag: r.read_i32::<LittleEndian>()?,
            minfree: r.read_i32::<LittleEndian>()?,
            old_rotdelay: r.read_i32::<LittleEndian>()?,
            old_rps: r.read_i32::<LittleEndian>()?,
            bmask: r.read_i32::<LittleEndian>()?,
            fmask: r.read_i32::<LittleEndian>()?,
            bshift: r.read_i32::<LittleEndian>()?,
            fshift: r.read_i32::<LittleEndian>()?,
            maxcontig: r.read_i32::<LittleEndian>()?,
            maxbpg: r.read_i32::<LittleEndian>()?,
            fragshift: r.read_i32::<LittleEndian>()?,
            fsbtodb: r.read_i32::<LittleEndian>()?,
            sbsize: r.read_i32::<LittleEndian>()?,
            spare1: read_i32s(&mut r)?,
            nindir: r.read_i32::<LittleEndian>()?,
            inopb: r.read_u32::<LittleEndian>()?,
            old_nspf: r.read_i32::<LittleEndian>()?,
            optim: r.read_i32::<LittleEndian>()?,
            old_npsect: r.read_i32::<LittleEndian>()?,
            old_interleave: r.read_i32::<LittleEndian>()?,
            old_trackskew: r.read_i32::<LittleEndian>()?,
            id: read_i32s(&mut r)?,
            old_csaddr: r.read_i32::<LittleEndian>()?,
            cssize: r.read_i32::<LittleEndian>()?,
            cgsize: r.read_i32::<LittleEndian>()?,
            spare2: r.read_i32::<LittleEndian>()?,
            old_nsect: r.read_i32::<LittleEndian>()?,
            old_spc: r.read_i32::<LittleEndian>()?,
            old_ncyl: r.read_i32::<LittleEndian>()?,
            old_cpg: r.read_i32::<LittleEndian>()?,
            ipg: r.read_u32::<LittleEndian>()?,
            fpg: r.read_i32::<LittleEndian>()?,
            old_cstotal: Csum::read_from(&mut r)?,
            fmod: r.read_i8()?,
            clean: r.read_i8()?,
            ronly: r.read_i8()?,
            old_flags: r.read_i8()?,
            fsmnt: *array_ref![buf, 0xd4, MAXMNTLEN],
            volname: *array_ref![buf, 0x2a8, MAXVOLLEN],
            ..Default::default()
        };
        r.set_position(0x2c8);
        sb.swuid = r.read_u64::<LittleEndian>()?;
        sb.pad = r.read_i32::<LittleEndian>()?;
        sb.cgrotor = r.read_i32::<LittleEndian>()?;
        r.set_position(TRANSIENT.end as u64);
        sb.old_cpc = r.read_i32::<LittleEndian>()?;
        sb.maxbsize = r.read_i32::<LittleEndian>()?;
        sb.unrefs = r.read_i64::<LittleEndian>()?;
        sb.providersize = r.read_i64::<LittleEndian>()?;
        sb.metaspace = r.read_i64::<LittleEndian>()?;
        sb.sparecon64 = read_i64s(&mut r)?;
        sb.sblockactualloc = r.read_i64::<LittleEndian>()?;
        sb.sblockloc = r.read_i64::<LittleEndian>()?;
        sb.cstotal = CsumTotal {
            ndir: r.read_i64::<LittleEndian>()?,
            nbfree: r.read_i64::<LittleEndian>()?,
            nifree: r.read_i64::<LittleEndian>()?,
            nffree: r.read_i64::<LittleEndian>()?,
            numclusters: r.read_i64::<LittleEndian>()?,
            spare: read_i64s(&mut r)?,
        };
        sb.time = r.read_i64::<LittleEndian>()?;
        sb.size = r.read_i64::<LittleEndian>()?;
        sb.dsize = r.read_i64::<LittleEndian>()?;
        sb.csaddr = r.read_i64::<LittleEndian>()?;
        sb.pendingblocks = r.read_i64::<LittleEndian>()?;
        sb.pendinginodes = r.read_u32::<LittleEndian>()?;
        sb.snapinum = read_u32s(&mut r)?;
        sb.avgfilesize = r.read_u32::<LittleEndian>()?;
        sb.avgfpdir = r.read_u32::<LittleEndian>()?;
        sb.save_cgsize = r.read_i32::<LittleEndian>()?;
        sb.mtime = r.read_i64::<LittleEndian>()?;
        sb.sujfree = r.read_i32::<LittleEndian>()?;
        sb.sparecon32 = read_i32s(&mut r)?;
        sb.ckhash = r.read_u32::<LittleEndian>()?;
        sb.metackhash = r.read_u32::<LittleEndian>()?;
        sb.flags = r.read_i32::<LittleEndian>()?;
        sb.contigsumsize = r.read_i32::<LittleEndian>()?;
        sb.maxsymlinklen = r.read_i32::<LittleEndian>()?;
        sb.old_inodefmt = r.read_i32::<LittleEndian>()?;
        sb.maxfilesize = r.read_u64::<LittleEndian>()?;
        sb.qbmask = r.read_i64::<LittleEndian>()?;
        sb.qfmask = r.read_i64::<LittleEndian>()?;
        sb.state = r.read_i32::<LittleEndian>()?;
        sb.old_postblformat = r.read_i32::<LittleEndian>()?;
        sb.old_nrpos = r.read_i32::<LittleEndian>()?;
        sb.spare5 = read_i32s(&mut r)?;
        sb.magic = r.read_i32::<LittleEndian>()?;

        let end = buf.len().min(SBLOCKSIZE);
        sb.trailer[..end - SBLOCK_STRUCT_SIZE].copy_from_slice(&buf[SBLOCK_STRUCT_SIZE..end]);
        Ok(sb)
    }

    /// Encode into a full [`SBLOCKSIZE`] image
    ///
    /// The in-core pointer area is always written as zeroes.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; SBLOCKSIZE];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    fn encode_into(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut w = Cursor::new(&mut buf[..]);
        for v in [
            self.firstfield,
            self.unused_1,
            self.sblkno,
            self.cblkno,
            self.iblkno,
            self.dblkno,
            self.old_cgoffset,
            self.old_cgmask,
            self.old_time,
            self.old_size,
            self.old_dsize,
        ] {
            w.write_i32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.ncg)?;
        for v in [
            self.bsize,
            self.fsize,
            self.frag,
            self.minfree,
            self.old_rotdelay,
            self.old_rps,
            self.bmask,
            self.fmask,
            self.bshift,
            self.fshift,
            self.maxcontig,
            self.maxbpg,
            self.fragshift,
            self.fsbtodb,
            self.sbsize,
            self.spare1[0],
            self.spare1[1],
            self.nindir,
        ] {
            w.write_i32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.inopb)?;
        for v in [
            self.old_nspf,
            self.optim,
            self.old_npsect,
            self.old_interleave,
            self.old_trackskew,
            self.id[0],
            self.id[1],
            self.old_csaddr,
            self.cssize,
            self.cgsize,
            self.spare2,
            self.old_nsect,
            self.old_spc,
            self.old_ncyl,
            self.old_cpg,
        ] {
            w.write_i32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.ipg)?;
        w.write_i32::<LittleEndian>(self.fpg)?;
        self.old_cstotal.write_to(&mut w)?;
        w.write_i8(self.fmod)?;
        w.write_i8(self.clean)?;
        w.write_i8(self.ronly)?;
        w.write_i8(self.old_flags)?;
        w.write_all(&self.fsmnt)?;
        w.write_all(&self.volname)?;
        w.write_u64::<LittleEndian>(self.swuid)?;
        w.write_i32::<LittleEndian>(self.pad)?;
        w.write_i32::<LittleEndian>(self.cgrotor)?;
        w.write_all(&[0u8; TRANSIENT.end - TRANSIENT.start])?;
        w.write_i32::<LittleEndian>(self.old_cpc)?;
        w.write_i32::<LittleEndian>(self.maxbsize)?;
        for v in [self.unrefs, self.providersize, self.metaspace] {
            w.write_i64::<LittleEndian>(v)?;
        }
        for v in self.sparecon64 {
            w.write_i64::<LittleEndian>(v)?;
        }
        w.write_i64::<LittleEndian>(self.sblockactualloc)?;
        w.write_i64::<LittleEndian>(self.sblockloc)?;
        let t = &self.cstotal;
        for v in [t.ndir, t.nbfree, t.nifree, t.nffree, t.numclusters] {
            w.write_i64::<LittleEndian>(v)?;
        }
        for v in t.spare {
            w.write_i64::<LittleEndian>(v)?;
        }
        for v in [self.time, self.size, self.dsize, self.csaddr, self.pendingblocks] {
            w.write_i64::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.pendinginodes)?;
        for v in self.snapinum {
            w.write_u32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.avgfilesize)?;
        w.write_u32::<LittleEndian>(self.avgfpdir)?;
        w.write_i32::<LittleEndian>(self.save_cgsize)?;
        w.write_i64::<LittleEndian>(self.mtime)?;
        w.write_i32::<LittleEndian>(self.sujfree)?;
        for v in self.sparecon32 {
            w.write_i32::<LittleEndian>(v)?;
        }
        w.write_u32::<LittleEndian>(self.ckhash)?;
        w.write_u32::<LittleEndian>(self.metackhash)?;
        for v in [
            self.flags,
            self.contigsumsize,
            self.maxsymlinklen,
            self.old_inodefmt,
        ] {
            w.write_i32::<LittleEndian>(v)?;
        }
        w.write_u64::<LittleEndian>(self.maxfilesize)?;
        w.write_i64::<LittleEndian>(self.qbmask)?;
        w.write_i64::<LittleEndian>(self.qfmask)?;
        for v in [
            self.state,
            self.old_postblformat,
            self.old_nrpos,
            self.spare5[0],
            self.spare5[1],
            self.magic,
        ] {
            w.write_i32::<LittleEndian>(v)?;
        }
        debug_assert_eq!(w.position() as usize, SBLOCK_STRUCT_SIZE);
        let tail = self.trailer.len().min(SBLOCKSIZE - SBLOCK_STRUCT_SIZE);
        buf[SBLOCK_STRUCT_SIZE..SBLOCK_STRUCT_SIZE + tail].copy_from_slice(&self.trailer[..tail]);
        Ok(())
    }

    /// Check-hash of this superblock as it would be written
    ///
    /// When the filesystem does not ask for superblock hashes the stored
    /// value is returned untouched. A filesystem that had hashes turned off
    /// by an older implementation keeps whatever hash was last written.
    pub fn calc_sbhash(&self) -> io::Result<u32> {
        if self.metackhash & CK_SUPERBLOCK == 0 {
            return Ok(self.ckhash);
        }
        Ok(image_sbhash(&self.encode()?, self.sbsize))
    }

    /// Whether this is a UFS2 superblock
    pub fn is_ufs2(&self) -> bool {
        self.magic == FS_UFS2_MAGIC
    }

    /// Mount point recorded in the superblock
    pub fn mount_point(&self) -> String {
        c_string(&self.fsmnt)
    }

    /// Volume label
    pub fn volume_name(&self) -> String {
        c_string(&self.volname)
    }

    /// Copy UFS1 fields into their wider UFS2 counterparts
    fn oldfscompat_read(&mut self, sblockloc: u64) {
        if self.old_flags & FS_FLAGS_UPDATED == 0 {
            self.flags = self.old_flags as i32 & 0xff;
            self.old_flags |= FS_FLAGS_UPDATED;
            self.sblockloc = sblockloc as i64;
        }
        if self.magic == FS_UFS1_MAGIC && self.maxbsize != self.bsize {
            self.maxbsize = self.bsize;
            self.time = self.old_time as i64;
            self.size = self.old_size as i64;
            self.dsize = self.old_dsize as i64;
            self.csaddr = self.old_csaddr as i64;
            self.cstotal.ndir = self.old_cstotal.ndir as i64;
            self.cstotal.nbfree = self.old_cstotal.nbfree as i64;
            self.cstotal.nifree = self.old_cstotal.nifree as i64;
            self.cstotal.nffree = self.old_cstotal.nffree as i64;
        }
    }

    /// Mirror the wide fields back into the UFS1 ones before writing
    fn oldfscompat_write(&mut self) {
        if self.magic == FS_UFS1_MAGIC {
            self.old_time = self.time as i32;
            self.old_cstotal.ndir = self.cstotal.ndir as i32;
            self.old_cstotal.nbfree = self.cstotal.nbfree as i32;
            self.old_cstotal.nifree = self.cstotal.nifree as i32;
            self.old_cstotal.nffree = self.cstotal.nffree as i32;
        }
    }

    /// Apply the geometry sanity rules for a superblock found at `sblockloc`
    ///
    /// An explicitly requested alternate location skips the check that the
    /// superblock sits where its own version expects it.
    fn plausible_at(&self, sblockloc: u64, alternate: bool) -> bool {
        let located = match self.magic {
            FS_UFS1_MAGIC => alternate || sblockloc <= SBLOCK_UFS1,
            FS_UFS2_MAGIC => alternate || self.sblockloc == sblockloc as i64,
            _ => false,
        };
        located
            && self.ncg >= 1
            && self.bsize >= MINBSIZE
            && self.bsize <= MAXBSIZE
            && self.bsize as usize >= SBLOCK_STRUCT_SIZE
            && self.sbsize as usize >= SBLOCK_STRUCT_SIZE
            && self.sbsize as usize <= SBLOCKSIZE
            && self.fsize > 0
            && self.fsize <= self.bsize
            && self.fpg > 0
            && self.ipg > 0
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// CRC32C as the on-disk format defines it: seeded with all ones, no final
/// inversion
pub fn ffs_crc32c(data: &[u8]) -> u32 {
    !crc32c::crc32c(data)
}

/// Hash `sbsize` bytes of a raw superblock image with its hash field zeroed
fn image_sbhash(image: &[u8], sbsize: i32) -> u32 {
    let len = (sbsize.max(0) as usize).min(image.len());
    let mut copy = image[..len].to_vec();
    if len >= CKHASH_OFFSET + 4 {
        copy[CKHASH_OFFSET..CKHASH_OFFSET + 4].fill(0);
    }
    ffs_crc32c(&copy)
}

/// Options controlling how a superblock is located and accepted
#[derive(Debug, Clone, Default)]
pub struct SbReadOptions {
    /// Read only this byte offset instead of the standard search list
    pub location: Option<u64>,
    /// Accept a superblock whose check-hash fails, marking it as needing fsck
    pub ignore_hash_failures: bool,
}

/// A superblock together with its summary information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSuperblock {
    pub sb: Superblock,
    /// Per-group summaries, indexed by group number
    pub csums: Vec<Csum>,
    /// Largest free cluster per group as far as is known
    pub maxcluster: Vec<i32>,
    /// Byte offset the superblock was read from
    pub location: u64,
}

/// Locate, validate and load the superblock and its summary array
pub async fn read_superblock(
    device: &dyn BlockDevice,
    opts: &SbReadOptions,
) -> Result<LoadedSuperblock> {
    let candidates: Vec<u64> = match opts.location {
        Some(loc) => vec![loc],
        None => SBLOCKSEARCH.to_vec(),
    };

    let mut found = None;
    for loc in candidates {
        if loc + SBLOCKSIZE as u64 > device.size() {
            continue;
        }
        let mut buf = vec![0u8; SBLOCKSIZE];
        device.read_at(loc, &mut buf).await?;
        if let Some(sb) = try_superblock(&buf, loc, opts, opts.location.is_some())? {
            found = Some((sb, loc));
            break;
        }
    }
    let (mut sb, location) = found.ok_or(FsError::NoSuperblock)?;
    sb.oldfscompat_read(location);

    let csums = read_summaries(device, &sb).await?;
    let maxcluster = if sb.contigsumsize > 0 {
        vec![sb.contigsumsize; sb.ncg as usize]
    } else {
        Vec::new()
    };

    log::info!(
        "SUPERBLOCK: found {} superblock at {} ({} groups, bsize {}, fsize {})",
        if sb.is_ufs2() { "UFS2" } else { "UFS1" },
        location,
        sb.ncg,
        sb.bsize,
        sb.fsize
    );
    Ok(LoadedSuperblock {
        sb,
        csums,
        maxcluster,
        location,
    })
}

/// Parse and check one candidate. `Ok(None)` means "no superblock here".
fn try_superblock(
    buf: &[u8],
    loc: u64,
    opts: &SbReadOptions,
    alternate: bool,
) -> Result<Option<Superblock>> {
    let mut sb = Superblock::decode(buf)?;
    if !sb.plausible_at(loc, alternate) {
        return Ok(None);
    }
    if sb.is_ufs2() {
        sb.sblockactualloc = loc as i64;
        if sb.metackhash & CK_SUPERBLOCK != 0 {
            let computed = image_sbhash(buf, sb.sbsize);
            if computed != sb.ckhash {
                if !opts.ignore_hash_failures {
                    log::warn!(
                        "SUPERBLOCK: check-hash failed at {}: stored {:#010x}, computed {:#010x}",
                        loc,
                        sb.ckhash,
                        computed
                    );
                    return Err(FsError::StaleSuperblock {
                        stored: sb.ckhash,
                        computed,
                    });
                }
                log::warn!(
                    "SUPERBLOCK: ignoring check-hash failure at {}; filesystem needs fsck",
                    loc
                );
                sb.flags |= FS_NEEDSFSCK;
            }
        }
    }
    Ok(Some(sb))
}

/// Byte ranges, in read order, that hold the summary array
fn summary_chunks(sb: &Superblock) -> Vec<(u64, usize)> {
    let fsize = sb.fsize as u64;
    let frag = sb.frag.max(1) as u64;
    let blks = (sb.cssize.max(0) as u64).div_ceil(fsize);
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < blks {
        let n = if i + frag > blks { blks - i } else { frag };
        let offset = (sb.csaddr as u64 + i) * fsize;
        chunks.push((offset, (n * fsize) as usize));
        i += frag;
    }
    chunks
}

async fn read_summaries(device: &dyn BlockDevice, sb: &Superblock) -> Result<Vec<Csum>> {
    let needed = sb.ncg as usize * Csum::SIZE;
    if (sb.cssize as usize) < needed {
        return Err(FsError::validation(
            "superblock",
            format!("summary area of {} bytes cannot hold {} groups", sb.cssize, sb.ncg),
        ));
    }
    let mut raw = Vec::with_capacity(sb.cssize as usize);
    for (offset, len) in summary_chunks(sb) {
        let mut chunk = vec![0u8; len];
        device.read_at(offset, &mut chunk).await?;
        raw.extend_from_slice(&chunk);
    }
    let mut r = Cursor::new(&raw[..needed]);
    (0..sb.ncg)
        .map(|_| Csum::read_from(&mut r).map_err(FsError::from))
        .collect()
}

/// Persist the summary array and then the superblock
///
/// The summaries go first so a crash never leaves a clean superblock next to
/// stale summaries. The superblock's hash is recomputed just before writing.
pub async fn write_superblock(
    device: &dyn BlockDevice,
    sb: &mut Superblock,
    csums: &[Csum],
) -> Result<()> {
    let mut raw = Vec::with_capacity(sb.cssize as usize);
    for cs in csums {
        cs.write_to(&mut raw)?;
    }
    for (offset, len) in summary_chunks(sb) {
        let start = (offset - sb.csaddr as u64 * sb.fsize as u64) as usize;
        let mut chunk = vec![0u8; len];
        if start < raw.len() {
            let n = (raw.len() - start).min(len);
            chunk[..n].copy_from_slice(&raw[start..start + n]);
        }
        device.write_at(offset, &chunk).await?;
    }

    sb.fmod = 0;
    sb.oldfscompat_write();
    sb.ckhash = sb.calc_sbhash()?;
    let image = sb.encode()?;
    let len = (sb.sbsize as u64).div_ceil(DEV_BSIZE) * DEV_BSIZE;
    device
        .write_at(sb.sblockloc as u64, &image[..len as usize])
        .await?;
    log::debug!(
        "SUPERBLOCK: wrote superblock at {} (hash {:#010x})",
        sb.sblockloc,
        sb.ckhash
    );
    Ok(())
}

/// Immutable geometry of a mounted filesystem
///
/// All block addresses are in fragments from the start of the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub magic: i32,
    pub ncg: u32,
    pub bsize: u64,
    pub fsize: u64,
    pub frag: FragsPerBlock,
    pub fragshift: u32,
    pub fshift: u32,
    pub fpg: u64,
    pub ipg: u64,
    pub inopb: u64,
    pub sblkno: u64,
    pub cblkno: u64,
    pub iblkno: u64,
    pub dblkno: u64,
    pub old_cgoffset: u64,
    pub old_cgmask: i64,
    pub metaspace: u64,
    pub cgsize: usize,
    pub contigsumsize: i32,
    pub size: u64,
    pub dsize: u64,
    pub minfree: i64,
    pub avgfilesize: u64,
    pub avgfpdir: u64,
}

impl Geometry {
    /// Derive and check the geometry of a superblock
    pub fn new(sb: &Superblock) -> Result<Self> {
        let bad = |detail: String| Err(FsError::InvalidGeometry(detail));
        let frag = FragsPerBlock::new(sb.frag)?;
        if sb.fsize <= 0 || sb.fsize & (sb.fsize - 1) != 0 {
            return bad(format!("fragment size {} is not a power of two", sb.fsize));
        }
        if sb.bsize as i64 != sb.fsize as i64 * sb.frag as i64 {
            return bad(format!(
                "block size {} is not {} fragments of {}",
                sb.bsize, sb.frag, sb.fsize
            ));
        }
        if !(0..31).contains(&sb.fshift) || 1i32 << sb.fshift != sb.fsize {
            return bad(format!("fragment shift {} for size {}", sb.fshift, sb.fsize));
        }
        if !(0..4).contains(&sb.fragshift) || 1i32 << sb.fragshift != sb.frag {
            return bad(format!(
                "fragment shift {} for {} fragments per block",
                sb.fragshift, sb.frag
            ));
        }
        if sb.ncg == 0 || sb.fpg <= 0 || sb.fpg % sb.frag != 0 {
            return bad(format!("{} groups of {} fragments", sb.ncg, sb.fpg));
        }
        let dinode_size = if sb.magic == FS_UFS2_MAGIC { 256 } else { 128 };
        if sb.inopb == 0
            || sb.inopb as i64 * dinode_size > sb.bsize as i64
            || sb.ipg == 0
            || sb.ipg % sb.inopb != 0
        {
            return bad(format!(
                "{} inodes per group, {} inodes per block",
                sb.ipg, sb.inopb
            ));
        }
        let inode_frags = (sb.ipg / sb.inopb) as i64 * sb.frag as i64;
        if sb.sblkno < 0
            || sb.sblkno > sb.cblkno
            || sb.cblkno > sb.iblkno
            || sb.iblkno as i64 + inode_frags > sb.dblkno as i64
            || sb.dblkno >= sb.fpg
        {
            return bad(format!(
                "group offsets {}/{}/{}/{} in a group of {}",
                sb.sblkno, sb.cblkno, sb.iblkno, sb.dblkno, sb.fpg
            ));
        }
        if sb.dsize < 0 || sb.dsize > sb.size || sb.size > sb.ncg as i64 * sb.fpg as i64 {
            return bad(format!(
                "{} data fragments of {} in {} groups",
                sb.dsize, sb.size, sb.ncg
            ));
        }
        if !(0..100).contains(&sb.minfree) {
            return bad(format!("minfree {}%", sb.minfree));
        }
        if sb.cgsize <= 0 || sb.cgsize > sb.bsize {
            return Err(FsError::InvalidGeometry(format!(
                "cylinder group size {}",
                sb.cgsize
            )));
        }
        if sb.contigsumsize < 0 {
            return Err(FsError::InvalidGeometry(format!(
                "cluster summary size {}",
                sb.contigsumsize
            )));
        }
        Ok(Self {
            magic: sb.magic,
            ncg: sb.ncg,
            bsize: sb.bsize as u64,
            fsize: sb.fsize as u64,
            frag,
            fragshift: sb.fragshift as u32,
            fshift: sb.fshift as u32,
            fpg: sb.fpg as u64,
            ipg: sb.ipg as u64,
            inopb: sb.inopb as u64,
            sblkno: sb.sblkno as u64,
            cblkno: sb.cblkno as u64,
            iblkno: sb.iblkno as u64,
            dblkno: sb.dblkno as u64,
            old_cgoffset: sb.old_cgoffset.max(0) as u64,
            old_cgmask: sb.old_cgmask as i64,
            metaspace: sb.metaspace.max(0) as u64,
            cgsize: sb.cgsize as usize,
            contigsumsize: sb.contigsumsize,
            size: sb.size as u64,
            dsize: sb.dsize as u64,
            minfree: sb.minfree as i64,
            avgfilesize: sb.avgfilesize as u64,
            avgfpdir: sb.avgfpdir as u64,
        })
    }

    pub fn is_ufs2(&self) -> bool {
        self.magic == FS_UFS2_MAGIC
    }

    /// Fragments per block
    #[inline]
    pub fn frags(&self) -> u64 {
        self.frag.get()
    }

    /// First fragment of group `c`
    #[inline]
    pub fn cgbase(&self, c: u32) -> u64 {
        self.fpg * c as u64
    }

    /// Start of the metadata of group `c` (UFS1 staggers it per group)
    #[inline]
    pub fn cgstart(&self, c: u32) -> u64 {
        if self.is_ufs2() {
            self.cgbase(c)
        } else {
            self.cgbase(c) + self.old_cgoffset * ((c as i64) & !self.old_cgmask) as u64
        }
    }

    /// Backup superblock of group `c`
    #[inline]
    pub fn cgsblock(&self, c: u32) -> u64 {
        self.cgstart(c) + self.sblkno
    }

    /// Cylinder-group block of group `c`
    #[inline]
    pub fn cgtod(&self, c: u32) -> u64 {
        self.cgstart(c) + self.cblkno
    }

    /// First inode block of group `c`
    #[inline]
    pub fn cgimin(&self, c: u32) -> u64 {
        self.cgstart(c) + self.iblkno
    }

    /// First block after the metadata of group `c`
    #[inline]
    pub fn cgdmin(&self, c: u32) -> u64 {
        self.cgstart(c) + self.dblkno
    }

    /// Start of the reserved metadata zone of group `c`
    #[inline]
    pub fn cgmeta(&self, c: u32) -> u64 {
        self.cgdmin(c)
    }

    /// Start of the ordinary data zone of group `c`
    #[inline]
    pub fn cgdata(&self, c: u32) -> u64 {
        self.cgdmin(c) + self.metaspace
    }

    /// Group holding fragment `d`
    #[inline]
    pub fn dtog(&self, d: u64) -> u32 {
        (d / self.fpg) as u32
    }

    /// Offset of fragment `d` within its group
    #[inline]
    pub fn dtogd(&self, d: u64) -> u64 {
        d % self.fpg
    }

    /// Group holding inode `ino`
    #[inline]
    pub fn ino_to_cg(&self, ino: u64) -> u32 {
        (ino / self.ipg) as u32
    }

    /// Fragment address of the inode block holding `ino`
    #[inline]
    pub fn ino_to_fsba(&self, ino: u64) -> u64 {
        let c = self.ino_to_cg(ino);
        self.cgimin(c) + self.blkstofrags((ino % self.ipg) / self.inopb)
    }

    #[inline]
    pub fn blkstofrags(&self, blks: u64) -> u64 {
        blks << self.fragshift
    }

    #[inline]
    pub fn fragstoblks(&self, frags: u64) -> u64 {
        frags >> self.fragshift
    }

    /// Whole fragments in `bytes`
    #[inline]
    pub fn numfrags(&self, bytes: u64) -> u64 {
        bytes >> self.fshift
    }

    /// Fragment index of `fsb` within its block
    #[inline]
    pub fn fragnum(&self, fsb: u64) -> u64 {
        fsb & (self.frags() - 1)
    }

    /// First fragment of the block holding `fsb`
    #[inline]
    pub fn blknum(&self, fsb: u64) -> u64 {
        fsb & !(self.frags() - 1)
    }

    /// Byte offset of fragment address `fsb` on the device
    #[inline]
    pub fn fsb_offset(&self, fsb: u64) -> u64 {
        fsb * self.fsize
    }

    /// Total inodes
    #[inline]
    pub fn ninodes(&self) -> u64 {
        self.ipg * self.ncg as u64
    }
}
