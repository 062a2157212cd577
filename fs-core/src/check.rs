//! Consistency checker
//!
//! Recounts every cylinder group from its maps and compares the result with
//! the group header, the summary array and the superblock totals. Nothing is
//! repaired; every disagreement becomes a [`Problem`] in the report.

use serde::{Deserialize, Serialize};

use crate::bitmap::{count_clusters, count_free_runs, isblock, isset, MAXFRAG};
use crate::blockdev::{BlockDevice, DEV_BSIZE};
use crate::cg::{cg_image_hash, cg_stored_hash, CylinderGroup};
use crate::error::Result;
use crate::superblock::{read_superblock, Csum, CsumTotal, Geometry, SbReadOptions, CK_CYLGRP, FS_NEEDSFSCK};

/// One disagreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Group concerned, `None` for filesystem-wide totals
    pub cg: Option<u32>,
    pub detail: String,
}

/// Outcome of a check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub groups_checked: u32,
    pub problems: Vec<Problem>,
    /// Totals recounted from the maps (directories come from group headers)
    pub recounted: CsumTotal,
    /// The superblock asks for a full check
    pub needs_fsck: bool,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, cg: Option<u32>, detail: String) {
        match cg {
            Some(c) => log::warn!("CHECK: group {}: {}", c, detail),
            None => log::warn!("CHECK: {}", detail),
        }
        self.problems.push(Problem { cg, detail });
    }
}

/// Counters recomputed from one group's maps
#[derive(Debug, Clone, PartialEq, Eq)]
struct Recount {
    cs: Csum,
    frsum: [i32; MAXFRAG],
    clustersum: Vec<i32>,
    cluster_mismatch: Option<u64>,
}

fn recount(geom: &Geometry, cg: &CylinderGroup) -> Recount {
    let f = geom.frags();
    let span = cg.ndblk.div_ceil(f) * f;
    let mut cs = Csum {
        ndir: cg.cs.ndir,
        ..Default::default()
    };
    let mut base = 0;
    while base < span {
        let free = (base..base + f).filter(|&i| isset(&cg.blksfree, i)).count() as i32;
        if free as u64 == f {
            cs.nbfree += 1;
        } else {
            cs.nffree += free;
        }
        base += f;
    }
    let used = (0..cg.niblk).filter(|&i| isset(&cg.inosused, i)).count() as i32;
    cs.nifree = cg.niblk as i32 - used;

    let (clustersum, cluster_mismatch) = if cg.has_clusters() {
        let sum = count_clusters(geom.contigsumsize, &cg.clustersfree, cg.nclusterblks);
        let mismatch = (0..cg.nclusterblks as u64)
            .find(|&b| isset(&cg.clustersfree, b) != isblock(geom.frag, &cg.blksfree, b));
        (sum, mismatch)
    } else {
        (Vec::new(), None)
    };
    Recount {
        cs,
        frsum: count_free_runs(geom.frag, &cg.blksfree, span),
        clustersum,
        cluster_mismatch,
    }
}

fn compare_csum(report: &mut CheckReport, c: u32, what: &str, expected: &Csum, found: &Csum) {
    let fields = [
        ("directories", expected.ndir, found.ndir),
        ("free blocks", expected.nbfree, found.nbfree),
        ("free inodes", expected.nifree, found.nifree),
        ("free fragments", expected.nffree, found.nffree),
    ];
    for (name, want, got) in fields {
        if want != got {
            report.problem(Some(c), format!("{} {}: {} but counted {}", what, name, got, want));
        }
    }
}

/// Check every cylinder group of the filesystem on `device`
pub async fn check_filesystem(device: &dyn BlockDevice, opts: &SbReadOptions) -> Result<CheckReport> {
    let loaded = read_superblock(device, opts).await?;
    let sb = &loaded.sb;
    let geom = Geometry::new(sb)?;
    let mut report = CheckReport {
        needs_fsck: sb.flags & FS_NEEDSFSCK != 0,
        ..Default::default()
    };
    let len = (geom.cgsize as u64).div_ceil(DEV_BSIZE) * DEV_BSIZE;
    let mut summed = CsumTotal::default();

    for c in 0..geom.ncg {
        let summary = loaded.csums[c as usize];
        summed.ndir += summary.ndir as i64;
        summed.nbfree += summary.nbfree as i64;
        summed.nifree += summary.nifree as i64;
        summed.nffree += summary.nffree as i64;

        let mut buf = vec![0u8; len as usize];
        if let Err(e) = device.read_at(geom.fsb_offset(geom.cgtod(c)), &mut buf).await {
            report.problem(Some(c), format!("unreadable: {}", e));
            continue;
        }
        let image = &buf[..geom.cgsize];
        if sb.metackhash & CK_CYLGRP != 0 && cg_stored_hash(image) != cg_image_hash(image) {
            report.problem(Some(c), "check-hash mismatch".into());
        }
        let cg = match CylinderGroup::decode(&geom, c, image) {
            Ok(cg) => cg,
            Err(e) => {
                report.problem(Some(c), e.to_string());
                continue;
            }
        };
        report.groups_checked += 1;

        let counted = recount(&geom, &cg);
        compare_csum(&mut report, c, "header", &counted.cs, &cg.cs);
        compare_csum(&mut report, c, "summary", &cg.cs, &summary);
        if counted.frsum != cg.frsum {
            report.problem(
                Some(c),
                format!("fragment summary {:?} but counted {:?}", cg.frsum, counted.frsum),
            );
        }
        if cg.has_clusters() && counted.clustersum[1..] != cg.clustersum[1..] {
            report.problem(
                Some(c),
                format!(
                    "cluster summary {:?} but counted {:?}",
                    &cg.clustersum[1..],
                    &counted.clustersum[1..]
                ),
            );
        }
        if let Some(b) = counted.cluster_mismatch {
            report.problem(
                Some(c),
                format!("cluster map disagrees with fragment map at block {}", b),
            );
        }

        let t = &mut report.recounted;
        t.ndir += counted.cs.ndir as i64;
        t.nbfree += counted.cs.nbfree as i64;
        t.nifree += counted.cs.nifree as i64;
        t.nffree += counted.cs.nffree as i64;
    }

    let stored = &sb.cstotal;
    let totals = [
        ("directories", stored.ndir, summed.ndir),
        ("free blocks", stored.nbfree, summed.nbfree),
        ("free inodes", stored.nifree, summed.nifree),
        ("free fragments", stored.nffree, summed.nffree),
    ];
    for (name, got, want) in totals {
        if got != want {
            report.problem(
                None,
                format!("superblock {}: {} but summaries add up to {}", name, got, want),
            );
        }
    }
    log::info!(
        "CHECK: {} groups checked, {} problems",
        report.groups_checked,
        report.problems.len()
    );
    Ok(report)
}
