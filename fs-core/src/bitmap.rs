//! Bitmap and cluster accounting for cylinder groups
//!
//! Pure functions over a group's free-fragment map (one bit per fragment,
//! set means free) and free-cluster map (one bit per full block). Nothing in
//! here blocks or locks; callers hand in the maps of a group they already own.

use crate::error::{FsError, Result};

/// Bits per byte
pub const NBBY: u64 = 8;
/// Largest supported number of fragments per block
pub const MAXFRAG: usize = 8;

/// Number of fragments in a block
///
/// The on-disk format only defines maps for 1, 2, 4 and 8 fragments per
/// block, so those are the only values this type can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragsPerBlock {
    One = 1,
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl FragsPerBlock {
    /// Validate a raw `fs_frag` value
    pub fn new(frag: i32) -> Result<Self> {
        match frag {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            other => Err(FsError::InvalidGeometry(format!(
                "{} fragments per block (must be 1, 2, 4 or 8)",
                other
            ))),
        }
    }

    /// Fragments per block as an integer
    #[inline]
    pub fn get(self) -> u64 {
        self as u64
    }

    /// Free-run table for this block layout
    #[inline]
    pub fn table(self) -> &'static [u8; 256] {
        match self {
            Self::One | Self::Two | Self::Four => &FRAGTBL124,
            Self::Eight => &FRAGTBL8,
        }
    }

    /// Bit of a [`FragsPerBlock::table`] entry that flags a free run of `len`
    #[inline]
    pub fn run_mask(self, len: u64) -> u8 {
        1u8 << (len - 1 + self.get() % NBBY)
    }
}

/// For every byte value, the set of maximal free-run lengths found inside
/// each `frag`-bit block of that byte. A run of length `k` sets bit
/// `k - 1 + frag % 8`, so the tables for 1, 2 and 4 occupy disjoint bits.
const fn runs_table(frag: usize) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut entry = 0u32;
        let mut blk = 0usize;
        while blk < 8 / frag {
            let bits = (byte >> (blk * frag)) & ((1 << frag) - 1);
            let mut run = 0usize;
            let mut i = 0usize;
            while i < frag {
                if bits & (1 << i) != 0 {
                    run += 1;
                } else {
                    if run > 0 {
                        entry |= 1 << (run - 1 + frag % 8);
                    }
                    run = 0;
                }
                i += 1;
            }
            if run > 0 {
                entry |= 1 << (run - 1 + frag % 8);
            }
            blk += 1;
        }
        table[byte] = entry as u8;
        byte += 1;
    }
    table
}

const fn merge(a: [u8; 256], b: [u8; 256], c: [u8; 256]) -> [u8; 256] {
    let mut out = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        out[i] = a[i] | b[i] | c[i];
        i += 1;
    }
    out
}

static FRAGTBL124: [u8; 256] = merge(runs_table(1), runs_table(2), runs_table(4));
static FRAGTBL8: [u8; 256] = runs_table(8);

/// Masks that cover a free run of length `n` plus one bounding bit each side
pub(crate) const AROUND: [u32; 9] = [0x3, 0x7, 0xf, 0x1f, 0x3f, 0x7f, 0xff, 0x1ff, 0x3ff];
/// The free-run pattern expected inside the matching [`AROUND`] mask
pub(crate) const INSIDE: [u32; 9] = [0x0, 0x2, 0x6, 0xe, 0x1e, 0x3e, 0x7e, 0xfe, 0x1fe];

#[inline]
pub fn isset(map: &[u8], i: u64) -> bool {
    map[(i / NBBY) as usize] & (1 << (i % NBBY)) != 0
}

#[inline]
pub fn isclr(map: &[u8], i: u64) -> bool {
    !isset(map, i)
}

#[inline]
pub fn setbit(map: &mut [u8], i: u64) {
    map[(i / NBBY) as usize] |= 1 << (i % NBBY);
}

#[inline]
pub fn clrbit(map: &mut [u8], i: u64) {
    map[(i / NBBY) as usize] &= !(1 << (i % NBBY));
}

/// Byte index and mask covering every fragment of block `h`
#[inline]
fn block_mask(frag: FragsPerBlock, h: u64) -> (usize, u8) {
    match frag {
        FragsPerBlock::Eight => (h as usize, 0xff),
        FragsPerBlock::Four => ((h >> 1) as usize, 0x0f << ((h & 0x1) << 2)),
        FragsPerBlock::Two => ((h >> 2) as usize, 0x03 << ((h & 0x3) << 1)),
        FragsPerBlock::One => ((h >> 3) as usize, 0x01 << (h & 0x7)),
    }
}

/// Whether every fragment of block `h` is free
pub fn isblock(frag: FragsPerBlock, map: &[u8], h: u64) -> bool {
    let (idx, mask) = block_mask(frag, h);
    map[idx] & mask == mask
}

/// Whether every fragment of block `h` is allocated
pub fn isfreeblock(frag: FragsPerBlock, map: &[u8], h: u64) -> bool {
    let (idx, mask) = block_mask(frag, h);
    map[idx] & mask == 0
}

/// Mark every fragment of block `h` free
pub fn setblock(frag: FragsPerBlock, map: &mut [u8], h: u64) {
    let (idx, mask) = block_mask(frag, h);
    map[idx] |= mask;
}

/// Mark every fragment of block `h` allocated
pub fn clrblock(frag: FragsPerBlock, map: &mut [u8], h: u64) {
    let (idx, mask) = block_mask(frag, h);
    map[idx] &= !mask;
}

/// The `frag` free bits of the block starting at fragment `loc`
#[inline]
pub fn blkmap(frag: FragsPerBlock, map: &[u8], loc: u64) -> u32 {
    let byte = map[(loc / NBBY) as usize] as u32;
    (byte >> (loc % NBBY)) & (0xff >> (NBBY - frag.get()))
}

/// Update the free-run histogram for one block
///
/// `fragmap` holds the block's free bits as returned by [`blkmap`]. Every
/// maximal free run of length `k < frag` adds `cnt` to `fraglist[k]`.
pub fn fragacct(frag: FragsPerBlock, fragmap: u32, fraglist: &mut [i32; MAXFRAG], cnt: i32) {
    let f = frag.get();
    let inblk = (frag.table()[fragmap as usize] as u32) << 1;
    let fragmap = fragmap << 1;
    for siz in 1..f {
        if inblk & (1 << (siz + f % NBBY)) == 0 {
            continue;
        }
        let mut field = AROUND[siz as usize];
        let mut subfield = INSIDE[siz as usize];
        let mut pos = siz;
        while pos <= f {
            if fragmap & field == subfield {
                fraglist[siz as usize] += cnt;
                pos += siz;
                field <<= siz;
                subfield <<= siz;
            }
            field <<= 1;
            subfield <<= 1;
            pos += 1;
        }
    }
}

/// Index of the first byte of `map` whose table entry intersects `mask`
pub fn scanc(map: &[u8], table: &[u8; 256], mask: u8) -> Option<usize> {
    map.iter().position(|&b| table[b as usize] & mask != 0)
}

/// Adjust cluster accounting after block `blkno` became free (`cnt > 0`) or
/// allocated (`cnt < 0`)
///
/// Sets or clears the block's bit in `freemap`, measures the free runs on
/// either side (each capped at `contigsumsize`), moves the counts in `sump`
/// and returns the new largest cluster size for the group. Returns `None`
/// when cluster tracking is disabled.
pub fn clusteracct(
    contigsumsize: i32,
    freemap: &mut [u8],
    sump: &mut [i32],
    nclusterblks: u32,
    blkno: u64,
    cnt: i32,
) -> Option<i32> {
    if contigsumsize <= 0 {
        return None;
    }
    if cnt > 0 {
        setbit(freemap, blkno);
    } else {
        clrbit(freemap, blkno);
    }
    let contig = contigsumsize as i64;
    let blk = blkno as i64;

    let start = blk + 1;
    let end = (start + contig).min(nclusterblks as i64);
    let mut i = start;
    while i < end && isset(freemap, i as u64) {
        i += 1;
    }
    let forw = i - start;

    let start = blk - 1;
    let end = (start - contig).max(-1);
    let mut i = start;
    while i > end && isset(freemap, i as u64) {
        i -= 1;
    }
    let back = start - i;

    let joined = (back + forw + 1).min(contig);
    sump[joined as usize] += cnt;
    if back > 0 {
        sump[back as usize] -= cnt;
    }
    if forw > 0 {
        sump[forw as usize] -= cnt;
    }

    let mut max = contig;
    while max > 0 && sump[max as usize] <= 0 {
        max -= 1;
    }
    Some(max as i32)
}

/// Count maximal free runs shorter than a block, by direct inspection
pub fn count_free_runs(frag: FragsPerBlock, blksfree: &[u8], nfrags: u64) -> [i32; MAXFRAG] {
    let f = frag.get();
    let mut frsum = [0i32; MAXFRAG];
    let mut base = 0;
    while base + f <= nfrags {
        let mut run = 0u64;
        for i in 0..f {
            if isset(blksfree, base + i) {
                run += 1;
            } else {
                if run > 0 && run < f {
                    frsum[run as usize] += 1;
                }
                run = 0;
            }
        }
        if run > 0 && run < f {
            frsum[run as usize] += 1;
        }
        base += f;
    }
    frsum
}

/// Recompute a cluster summary from the free-cluster map
pub fn count_clusters(contigsumsize: i32, clustersfree: &[u8], nclusterblks: u32) -> Vec<i32> {
    let mut sum = vec![0i32; contigsumsize.max(0) as usize + 1];
    if contigsumsize <= 0 {
        return sum;
    }
    let mut run = 0i32;
    for blk in 0..nclusterblks as u64 {
        if isset(clustersfree, blk) {
            run += 1;
        } else if run > 0 {
            sum[run.min(contigsumsize) as usize] += 1;
            run = 0;
        }
    }
    if run > 0 {
        sum[run.min(contigsumsize) as usize] += 1;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ALL: [FragsPerBlock; 4] = [
        FragsPerBlock::One,
        FragsPerBlock::Two,
        FragsPerBlock::Four,
        FragsPerBlock::Eight,
    ];

    #[test]
    fn test_frag_validation() {
        for f in [1, 2, 4, 8] {
            assert_eq!(FragsPerBlock::new(f).unwrap().get(), f as u64);
        }
        for f in [0, 3, 5, 16, -1] {
            assert!(matches!(
                FragsPerBlock::new(f),
                Err(FsError::InvalidGeometry(_))
            ));
        }
    }

    #[test]
    fn test_tables() {
        assert_eq!(FRAGTBL8[0x00], 0);
        assert_eq!(FRAGTBL8[0xff], 0x80);
        // 0b0110_0110: two runs of two
        assert_eq!(FRAGTBL8[0x66], 0x02);
        // 0b1011_0001: runs of 1, 2 and 1
        assert_eq!(FRAGTBL8[0xb1], 0x03);
        // Four frags per block: low nibble full, high nibble one run of two
        let e = FRAGTBL124[0x6f];
        assert_ne!(e & FragsPerBlock::Four.run_mask(4), 0);
        assert_ne!(e & FragsPerBlock::Four.run_mask(2), 0);
        assert_eq!(e & FragsPerBlock::Four.run_mask(1), 0);
    }

    #[test]
    fn test_block_ops() {
        for frag in ALL {
            let blocks = 64 / frag.get();
            let mut map = vec![0u8; 8];
            for h in 0..blocks {
                assert!(isfreeblock(frag, &map, h));
                setblock(frag, &mut map, h);
                assert!(isblock(frag, &map, h));
            }
            assert!(map.iter().all(|&b| b == 0xff));
            clrblock(frag, &mut map, 1);
            assert!(isfreeblock(frag, &map, 1));
            assert!(isblock(frag, &map, 0));
            if frag.get() > 1 {
                setbit(&mut map, frag.get());
                assert!(!isblock(frag, &map, 1));
                assert!(!isfreeblock(frag, &map, 1));
            }
        }
    }

    #[test]
    fn test_blkmap_extracts_block_bits() {
        let map = [0b1010_0110u8, 0xff];
        assert_eq!(blkmap(FragsPerBlock::Four, &map, 0), 0b0110);
        assert_eq!(blkmap(FragsPerBlock::Four, &map, 4), 0b1010);
        assert_eq!(blkmap(FragsPerBlock::Two, &map, 2), 0b01);
        assert_eq!(blkmap(FragsPerBlock::Eight, &map, 8), 0xff);
    }

    #[test]
    fn test_fragacct_matches_recount() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for frag in ALL {
            let nfrags = 512u64;
            let mut map = vec![0u8; (nfrags / NBBY) as usize];
            let mut frsum = [0i32; MAXFRAG];
            for _ in 0..4000 {
                let bit = rng.gen_range(0..nfrags);
                let base = bit - bit % frag.get();
                fragacct(frag, blkmap(frag, &map, base), &mut frsum, -1);
                if isset(&map, bit) {
                    clrbit(&mut map, bit);
                } else {
                    setbit(&mut map, bit);
                }
                fragacct(frag, blkmap(frag, &map, base), &mut frsum, 1);
            }
            assert_eq!(frsum, count_free_runs(frag, &map, nfrags), "frag {:?}", frag);
        }
    }

    fn longest_run(map: &[u8], n: u32) -> i32 {
        let (mut best, mut run) = (0, 0);
        for b in 0..n as u64 {
            if isset(map, b) {
                run += 1;
                best = best.max(run);
            } else {
                run = 0;
            }
        }
        best
    }

    #[test]
    fn test_clusteracct_matches_recount() {
        let mut rng = StdRng::seed_from_u64(42);
        let contig = 16;
        let nblks = 200u32;
        let mut map = vec![0u8; 32];
        let mut sum = vec![0i32; contig as usize + 1];
        for _ in 0..3000 {
            let blk = rng.gen_range(0..nblks as u64);
            let cnt = if isset(&map, blk) { -1 } else { 1 };
            let max = clusteracct(contig, &mut map, &mut sum, nblks, blk, cnt).unwrap();
            assert!(max <= longest_run(&map, nblks));
            assert_eq!(max, longest_run(&map, nblks).min(contig));
        }
        assert_eq!(sum, count_clusters(contig, &map, nblks));
    }

    #[test]
    fn test_clusteracct_joins_neighbours() {
        let mut map = vec![0u8; 2];
        let mut sum = vec![0i32; 9];
        assert_eq!(clusteracct(8, &mut map, &mut sum, 16, 3, 1), Some(1));
        assert_eq!(clusteracct(8, &mut map, &mut sum, 16, 5, 1), Some(1));
        assert_eq!(sum[1], 2);
        // Filling the gap merges both singletons into one run of three
        assert_eq!(clusteracct(8, &mut map, &mut sum, 16, 4, 1), Some(3));
        assert_eq!(sum[1], 0);
        assert_eq!(sum[3], 1);
        // Splitting it again
        assert_eq!(clusteracct(8, &mut map, &mut sum, 16, 4, -1), Some(1));
        assert_eq!(sum[1], 2);
        assert_eq!(sum[3], 0);
    }

    #[test]
    fn test_clusteracct_disabled() {
        let mut map = vec![0u8; 2];
        let mut sum = vec![0i32; 1];
        assert_eq!(clusteracct(0, &mut map, &mut sum, 16, 2, 1), None);
        assert_eq!(map, vec![0, 0]);
    }

    #[test]
    fn test_scanc() {
        let map = [0x00, 0x01, 0xff];
        let full = FragsPerBlock::Eight.run_mask(8);
        assert_eq!(scanc(&map, FragsPerBlock::Eight.table(), full), Some(2));
        let single = FragsPerBlock::Eight.run_mask(1);
        assert_eq!(scanc(&map, FragsPerBlock::Eight.table(), single), Some(1));
        assert_eq!(scanc(&map[..2], FragsPerBlock::Eight.table(), full), None);
    }
}
