mod common;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ufsalloc::check::check_filesystem;
use ufsalloc::hooks::{NoDependencies, Reclaimer};
use ufsalloc::superblock::SbReadOptions;
use ufsalloc::{BlockRequest, Filesystem, FsError, MountConfig, ReallocRequest, TrimKey};

use common::{formatted, free_frags, mounted, small_options};

/// Take every full block group `c` has
async fn fill_group(fs: &Filesystem, c: u32) -> Vec<u64> {
    let bsize = fs.geometry().bsize;
    let mut got = Vec::new();
    while let Some(bno) = fs.alloc_in_group(c, 0, bsize, 0).await.unwrap() {
        got.push(bno);
    }
    got
}

fn block(size: u64) -> BlockRequest {
    BlockRequest {
        ino: 0,
        bpref: 0,
        size,
        privileged: false,
    }
}

#[derive(Default)]
struct CountingReclaimer {
    calls: AtomicUsize,
}

#[async_trait]
impl Reclaimer for CountingReclaimer {
    async fn reclaim(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[tokio::test]
async fn test_free_then_alloc_returns_same_block() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let before = fs.stats();

    let req = BlockRequest {
        ino: 5,
        bpref: 64,
        size: g.bsize,
        privileged: false,
    };
    let bno = fs.alloc_block(req).await.unwrap();
    assert_eq!(bno, 64);
    assert_eq!(fs.stats().free_blocks, before.free_blocks - 1);

    fs.free_blocks(bno, g.bsize, 5, TrimKey::NoTrim).await.unwrap();
    assert_eq!(fs.stats(), before);
    assert_eq!(fs.alloc_block(req).await.unwrap(), 64);
}

#[tokio::test]
async fn test_fragment_round_trip() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let before = fs.stats();

    // Group 0 starts with a run of 7 fragments after the summary array
    let bno = fs.alloc_block(block(g.fsize)).await.unwrap();
    assert_eq!(bno, 57);
    assert_eq!(fs.stats().free_frags, before.free_frags - 1);
    fs.free_blocks(bno, g.fsize, 0, TrimKey::NoTrim).await.unwrap();
    assert_eq!(fs.stats(), before);
    assert_eq!(fs.alloc_block(block(g.fsize)).await.unwrap(), 57);
}

#[tokio::test]
async fn test_bad_sizes_rejected() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    for size in [0, g.fsize + 1, g.bsize + g.fsize] {
        assert!(matches!(
            fs.alloc_block(block(size)).await,
            Err(FsError::BadRequest(_))
        ));
    }
    assert!(matches!(
        fs.free_blocks(62, 4 * g.fsize, 0, TrimKey::NoTrim).await,
        Err(FsError::BadRequest(_))
    ));
    assert!(!fs.is_detached());
}

#[tokio::test]
async fn test_full_group_declines_without_side_effects() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    assert_eq!(fill_group(&fs, 0).await.len(), 120);

    let stats = fs.stats();
    let summary = fs.group_summary(0).unwrap();
    assert_eq!(summary.nbfree, 0);
    assert_eq!(fs.alloc_in_group(0, 0, g.bsize, 0).await.unwrap(), None);
    assert_eq!(fs.alloc_in_group(0, 64, g.bsize, 0).await.unwrap(), None);
    assert_eq!(fs.stats(), stats);
    assert_eq!(fs.group_summary(0), Some(summary));
}

#[tokio::test]
async fn test_full_first_group_falls_to_next() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    fill_group(&fs, 0).await;
    let group2 = fs.group_summary(2).unwrap();
    let group3 = fs.group_summary(3).unwrap();

    let bno = fs.alloc_block(block(g.bsize)).await.unwrap();
    assert_eq!(g.dtog(bno), 1);
    assert_eq!(fs.group_summary(2), Some(group2));
    assert_eq!(fs.group_summary(3), Some(group3));
}

#[tokio::test]
async fn test_completed_block_counted_once() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let before = fs.stats();

    let bno = fs
        .alloc_block(BlockRequest {
            ino: 3,
            bpref: 64,
            size: g.bsize,
            privileged: false,
        })
        .await
        .unwrap();
    assert_eq!(bno, 64);
    let allocated = fs.stats();

    fs.free_blocks(64, 4 * g.fsize, 3, TrimKey::NoTrim).await.unwrap();
    let half = fs.stats();
    assert_eq!(half.free_blocks, allocated.free_blocks);
    assert_eq!(half.free_frags, allocated.free_frags + 4);

    fs.free_blocks(68, 4 * g.fsize, 3, TrimKey::NoTrim).await.unwrap();
    assert_eq!(fs.stats(), before);

    fs.sync().await.unwrap();
    let report = check_filesystem(&*dev, &SbReadOptions::default()).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);
}

#[tokio::test]
async fn test_realloc_grows_in_place() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let before = fs.stats();

    let bno = fs.alloc_block(block(2 * g.fsize)).await.unwrap();
    assert_eq!(bno, 57);
    let grow = |osize: u64, nsize: u64| ReallocRequest {
        ino: 0,
        bprev: 57,
        bpref: 0,
        osize,
        nsize,
        privileged: false,
    };
    assert_eq!(fs.realloc_fragments(grow(2 * g.fsize, 4 * g.fsize)).await.unwrap(), 57);
    assert_eq!(fs.stats().free_frags, before.free_frags - 4);
    assert_eq!(fs.realloc_fragments(grow(4 * g.fsize, 7 * g.fsize)).await.unwrap(), 57);
    assert_eq!(fs.stats().free_frags, 0);

    // A full block cannot start at 57: the run moves and its old space is freed
    let moved = fs.realloc_fragments(grow(7 * g.fsize, g.bsize)).await.unwrap();
    assert_ne!(moved, 57);
    assert_eq!(g.fragnum(moved), 0);
    let after = fs.stats();
    assert_eq!(after.free_frags, before.free_frags);
    assert_eq!(after.free_blocks, before.free_blocks - 1);
}

#[tokio::test]
async fn test_realloc_moves_when_neighbour_taken() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();

    assert_eq!(fs.alloc_block(block(2 * g.fsize)).await.unwrap(), 57);
    assert_eq!(fs.alloc_block(block(g.fsize)).await.unwrap(), 59);
    let before = fs.stats();

    let moved = fs
        .realloc_fragments(ReallocRequest {
            ino: 0,
            bprev: 57,
            bpref: 0,
            osize: 2 * g.fsize,
            nsize: 3 * g.fsize,
            privileged: false,
        })
        .await
        .unwrap();
    assert_ne!(moved, 57);
    // Time optimisation takes a whole block and returns the unused tail
    assert_eq!(g.fragnum(moved), 0);
    let after = fs.stats();
    assert_eq!(after.free_blocks, before.free_blocks - 1);
    assert_eq!(after.free_frags, before.free_frags + 5 + 2);

    // The old run is free again and is the best fit for its size
    let reused = fs
        .alloc_block(BlockRequest {
            bpref: 57,
            ..block(2 * g.fsize)
        })
        .await
        .unwrap();
    assert_eq!(reused, 57);
}

#[tokio::test]
async fn test_realloc_rejects_shrink() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let bno = fs.alloc_block(block(2 * g.fsize)).await.unwrap();
    let result = fs
        .realloc_fragments(ReallocRequest {
            ino: 0,
            bprev: bno,
            bpref: 0,
            osize: 2 * g.fsize,
            nsize: g.fsize,
            privileged: false,
        })
        .await;
    assert!(matches!(result, Err(FsError::BadRequest(_))));
}

#[tokio::test]
async fn test_cluster_allocation() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let before = fs.stats();

    let bno = fs.alloc_cluster(9, 0, 16).await.unwrap();
    assert_eq!(bno, 64);
    assert_eq!(fs.stats().free_blocks, before.free_blocks - 16);
    // Every block of the run is taken
    for i in 0..16 {
        let b = bno + i * g.frags();
        assert!(matches!(
            fs.alloc_in_group(0, b, g.bsize, 0).await,
            Ok(Some(other)) if other != b
        ));
    }

    assert!(matches!(
        fs.alloc_cluster(9, 0, 17).await,
        Err(FsError::BadRequest(_))
    ));
    assert!(matches!(
        fs.alloc_cluster(9, 0, 0).await,
        Err(FsError::BadRequest(_))
    ));
}

#[tokio::test]
async fn test_cluster_hint_is_exact_after_query() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let base = g.cgbase(3);

    assert_eq!(fill_group(&fs, 3).await.len(), 124);
    assert_eq!(fs.cluster_hint(3), Some(0));
    for b in [base, base + 8, base + 16] {
        fs.free_blocks(b, g.bsize, 0, TrimKey::NoTrim).await.unwrap();
    }
    // Every full-block change recomputes the hint
    assert_eq!(fs.cluster_hint(3), Some(3));
    fs.unmount().await.unwrap();

    // A fresh mount only knows the upper bound until the group is queried
    let fs = Filesystem::mount(dev.clone(), MountConfig::default())
        .await
        .unwrap();
    assert_eq!(fs.cluster_hint(3), Some(16));
    let bno = fs.alloc_cluster(0, base, 4).await.unwrap();
    assert_eq!(g.dtog(bno), 0);
    assert_eq!(fs.cluster_hint(3), Some(3));

    // A fitting request is served from the group
    let bno = fs.alloc_cluster(0, base, 3).await.unwrap();
    assert_eq!(bno, base);
    assert_eq!(fs.cluster_hint(3), Some(0));
}

#[tokio::test]
async fn test_minfree_reserve_and_single_reclaim() {
    let (dev, _) = formatted(&small_options()).await;
    let reclaimer = Arc::new(CountingReclaimer::default());
    let fs = Filesystem::mount_with(
        dev.clone(),
        MountConfig::default(),
        Arc::new(NoDependencies),
        reclaimer.clone(),
    )
    .await
    .unwrap();
    let g = fs.geometry();

    let err = loop {
        if let Err(e) = fs.alloc_block(block(g.bsize)).await {
            break e;
        }
    };
    assert!(matches!(err, FsError::NoSpace));
    assert!(err.is_exhaustion());
    assert_eq!(reclaimer.calls.load(Ordering::SeqCst), 1);
    let reserve = g.dsize as i64 * g.minfree / 100;
    assert!(free_frags(&fs) - (g.frags() as i64) < reserve);

    // Privileged callers may dig into the reserve
    let privileged = BlockRequest {
        privileged: true,
        ..block(g.bsize)
    };
    fs.alloc_block(privileged).await.unwrap();
    assert!(!fs.is_detached());
}

#[tokio::test]
async fn test_randomised_accounting() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let frag = g.frags();
    let initial = free_frags(&fs);
    let mut rng = StdRng::seed_from_u64(0x5eed_u64);
    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut used: HashSet<u64> = HashSet::new();

    let claim = |used: &mut HashSet<u64>, bno: u64, frags: u64| {
        for f in bno..bno + frags {
            assert!(used.insert(f), "fragment {} handed out twice", f);
        }
    };

    for _ in 0..400 {
        match rng.gen_range(0..10) {
            0..=4 => {
                let frags = rng.gen_range(1..=frag);
                let bno = fs
                    .alloc_block(BlockRequest {
                        ino: rng.gen_range(0..g.ninodes()),
                        bpref: 0,
                        size: frags * g.fsize,
                        privileged: true,
                    })
                    .await
                    .unwrap();
                assert!(g.fragnum(bno) + frags <= frag);
                claim(&mut used, bno, frags);
                live.push((bno, frags));
            }
            5..=7 if !live.is_empty() => {
                let (bno, frags) = live.swap_remove(rng.gen_range(0..live.len()));
                fs.free_blocks(bno, frags * g.fsize, 0, TrimKey::NoTrim)
                    .await
                    .unwrap();
                for f in bno..bno + frags {
                    used.remove(&f);
                }
            }
            8..=9 if !live.is_empty() => {
                let i = rng.gen_range(0..live.len());
                let (bno, frags) = live[i];
                if frags == frag {
                    continue;
                }
                let nfrags = rng.gen_range(frags + 1..=frag);
                let got = fs
                    .realloc_fragments(ReallocRequest {
                        ino: 0,
                        bprev: bno,
                        bpref: 0,
                        osize: frags * g.fsize,
                        nsize: nfrags * g.fsize,
                        privileged: true,
                    })
                    .await
                    .unwrap();
                if got == bno {
                    claim(&mut used, bno + frags, nfrags - frags);
                } else {
                    for f in bno..bno + frags {
                        used.remove(&f);
                    }
                    claim(&mut used, got, nfrags);
                }
                live[i] = (got, nfrags);
            }
            _ => {}
        }
        assert_eq!(free_frags(&fs), initial - used.len() as i64);
    }

    fs.sync().await.unwrap();
    let report = check_filesystem(&*dev, &SbReadOptions::default()).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);
    let stats = fs.stats();
    assert_eq!(report.recounted.nbfree, stats.free_blocks);
    assert_eq!(report.recounted.nffree, stats.free_frags);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_never_overlap() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let fs = Arc::new(fs);
    let g = fs.geometry();
    let initial = free_frags(&fs);

    let mut tasks = Vec::new();
    for t in 0..8u64 {
        let fs = fs.clone();
        tasks.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(t);
            let mut got = Vec::new();
            for _ in 0..25 {
                let frags = rng.gen_range(1..=g.frags());
                let bno = fs
                    .alloc_block(BlockRequest {
                        ino: t * 100,
                        bpref: 0,
                        size: frags * g.fsize,
                        privileged: false,
                    })
                    .await
                    .unwrap();
                got.push((bno, frags));
            }
            got
        }));
    }

    let mut used = HashSet::new();
    for task in tasks {
        for (bno, frags) in task.await.unwrap() {
            for f in bno..bno + frags {
                assert!(used.insert(f), "fragment {} handed out twice", f);
            }
        }
    }
    assert_eq!(free_frags(&fs), initial - used.len() as i64);

    fs.sync().await.unwrap();
    let report = check_filesystem(&*dev, &SbReadOptions::default()).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);
}
