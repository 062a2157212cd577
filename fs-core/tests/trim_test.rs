mod common;

use ufsalloc::superblock::{read_superblock, SbReadOptions};
use ufsalloc::{BlockRequest, Filesystem, FormatOptions, MountConfig, TrimKey};

use common::{mounted, mounted_with, small_options, trim_config};

async fn take_block(fs: &Filesystem, bpref: u64) -> u64 {
    let bno = fs
        .alloc_block(BlockRequest {
            ino: 0,
            bpref,
            size: fs.geometry().bsize,
            privileged: false,
        })
        .await
        .unwrap();
    assert_eq!(bno, bpref);
    bno
}

#[tokio::test]
async fn test_contiguous_frees_share_one_discard() {
    let (dev, fs) = mounted(trim_config()).await;
    let g = fs.geometry();
    for bpref in [64, 72, 200] {
        take_block(&fs, bpref).await;
    }
    let before = fs.stats();
    dev.clear_events();

    let key = fs.begin_trim_batch();
    fs.free_blocks(72, g.bsize, 0, key).await.unwrap();
    fs.free_blocks(64, g.bsize, 0, key).await.unwrap();
    assert!(dev.unmaps().is_empty());
    let pending = fs.discard_stats();
    assert_eq!(pending.in_flight, 2);
    assert_eq!(pending.in_flight_frags, 16);
    assert_eq!(pending.open_batches, 1);
    assert_eq!(pending.issued, 0);
    // Nothing returns to the maps before its discard completes
    assert_eq!(fs.stats(), before);

    // A gap sends the merged range on its way and starts a new one
    fs.free_blocks(200, g.bsize, 0, key).await.unwrap();
    assert_eq!(fs.discard_stats().issued, 1);
    fs.end_trim_batch(key);
    assert_eq!(fs.discard_stats().issued, 2);
    assert_eq!(fs.discard_stats().open_batches, 0);

    fs.drain_discards().await;
    let mut unmaps = dev.unmaps();
    unmaps.sort();
    assert_eq!(
        unmaps,
        vec![(64 * g.fsize, 2 * g.bsize), (200 * g.fsize, g.bsize)]
    );
    let after = fs.stats();
    assert_eq!(after.free_blocks, before.free_blocks + 3);
    let done = fs.discard_stats();
    assert_eq!(done.in_flight, 0);
    assert_eq!(done.in_flight_frags, 0);
}

#[tokio::test]
async fn test_batches_do_not_mix() {
    let (dev, fs) = mounted(trim_config()).await;
    let g = fs.geometry();
    take_block(&fs, 64).await;
    take_block(&fs, 72).await;

    let first = fs.begin_trim_batch();
    let second = fs.begin_trim_batch();
    assert_ne!(first, second);
    fs.free_blocks(64, g.bsize, 0, first).await.unwrap();
    fs.free_blocks(72, g.bsize, 0, second).await.unwrap();
    assert_eq!(fs.discard_stats().open_batches, 2);
    fs.end_trim_batch(first);
    fs.end_trim_batch(second);
    fs.drain_discards().await;

    let mut unmaps = dev.unmaps();
    unmaps.sort();
    assert_eq!(unmaps, vec![(64 * g.fsize, g.bsize), (72 * g.fsize, g.bsize)]);
}

#[tokio::test]
async fn test_block_not_reused_before_discard_completes() {
    let (dev, fs) = mounted(trim_config()).await;
    let g = fs.geometry();
    take_block(&fs, 64).await;
    let before = fs.stats();

    dev.pause_unmaps();
    fs.free_blocks(64, g.bsize, 0, TrimKey::Singleton)
        .await
        .unwrap();
    tokio::task::yield_now().await;
    assert_eq!(fs.discard_stats().in_flight, 1);
    assert_eq!(fs.stats(), before);

    let elsewhere = fs
        .alloc_block(BlockRequest {
            ino: 0,
            bpref: 64,
            size: g.bsize,
            privileged: false,
        })
        .await
        .unwrap();
    assert_ne!(elsewhere, 64);

    dev.resume_unmaps();
    fs.drain_discards().await;
    assert_eq!(dev.unmaps(), vec![(64 * g.fsize, g.bsize)]);
    take_block(&fs, 64).await;
}

#[tokio::test]
async fn test_no_trim_frees_immediately() {
    let (dev, fs) = mounted(trim_config()).await;
    let g = fs.geometry();
    let before = fs.stats();
    take_block(&fs, 64).await;
    fs.free_blocks(64, g.bsize, 0, TrimKey::NoTrim).await.unwrap();
    assert_eq!(fs.stats(), before);
    assert_eq!(fs.discard_stats().issued, 0);
    assert!(dev.unmaps().is_empty());
}

#[tokio::test]
async fn test_discards_follow_superblock_flag() {
    // Not requested at format time and not forced at mount
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    take_block(&fs, 64).await;
    fs.free_blocks(64, g.bsize, 0, TrimKey::Singleton)
        .await
        .unwrap();
    assert_eq!(fs.discard_stats().issued, 0);
    assert!(dev.unmaps().is_empty());

    let opts = FormatOptions {
        trim: true,
        ..small_options()
    };
    let (dev, fs) = mounted_with(&opts, MountConfig::default()).await;
    take_block(&fs, 64).await;
    fs.free_blocks(64, g.bsize, 0, TrimKey::Singleton)
        .await
        .unwrap();
    fs.drain_discards().await;
    assert_eq!(dev.unmaps(), vec![(64 * g.fsize, g.bsize)]);
}

#[tokio::test]
async fn test_unmount_flushes_open_batches() {
    let (dev, fs) = mounted(trim_config()).await;
    let g = fs.geometry();
    let before = fs.stats();
    take_block(&fs, 64).await;
    take_block(&fs, 72).await;

    let key = fs.begin_trim_batch();
    fs.free_blocks(64, g.bsize, 0, key).await.unwrap();
    fs.free_blocks(72, g.bsize, 0, key).await.unwrap();
    fs.unmount().await.unwrap();

    assert_eq!(dev.unmaps(), vec![(64 * g.fsize, 2 * g.bsize)]);
    let loaded = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert_eq!(loaded.sb.clean, 1);
    assert_eq!(loaded.sb.cstotal.nbfree, before.free_blocks);
    assert_eq!(loaded.csums[0].nbfree as i64, before.free_blocks - 3 * 124);
}
