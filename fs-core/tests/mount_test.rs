mod common;

use std::sync::Arc;
use tempfile::TempDir;

use ufsalloc::blockdev::{BlockDevice, BlockDeviceError, FileBackedBlockDevice};
use ufsalloc::cg::CylinderGroup;
use ufsalloc::check::check_filesystem;
use ufsalloc::format::format_device;
use ufsalloc::superblock::{
    read_superblock, write_superblock, SbReadOptions, FS_NEEDSFSCK, SBLOCK_UFS2,
};
use ufsalloc::{BlockRequest, Filesystem, FsError, MountConfig, TrimKey};

use common::{formatted, init_logging, mounted, small_options, DEVICE_SIZE};

#[tokio::test]
async fn test_mount_marks_dirty_and_unmount_marks_clean() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let on_disk = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert_eq!(on_disk.sb.clean, 0);

    fs.unmount().await.unwrap();
    let on_disk = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert_eq!(on_disk.sb.clean, 1);
    assert_eq!(on_disk.sb.fmod, 0);
}

#[tokio::test]
async fn test_sync_persists_counters() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    for _ in 0..10 {
        fs.alloc_block(BlockRequest {
            ino: 300,
            bpref: 0,
            size: g.bsize,
            privileged: false,
        })
        .await
        .unwrap();
    }
    fs.alloc_inode(300, false, true).await.unwrap();
    fs.sync().await.unwrap();
    let stats = fs.stats();

    let on_disk = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert_eq!(on_disk.sb.cstotal.nbfree, stats.free_blocks);
    assert_eq!(on_disk.sb.cstotal.ndir, 1);
    assert_eq!(on_disk.csums[1].nbfree, fs.group_summary(1).unwrap().nbfree);
    assert_eq!(on_disk.csums[1].ndir, 1);

    let report = check_filesystem(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);

    // A second mount sees the same counters
    drop(fs);
    let fs = Filesystem::mount(dev.clone(), MountConfig::default())
        .await
        .unwrap();
    assert_eq!(fs.stats().free_blocks, stats.free_blocks);
    assert_eq!(fs.stats().directories, 1);
}

#[tokio::test]
async fn test_stats_serialise() {
    let (_dev, fs) = mounted(MountConfig::default()).await;
    let json = serde_json::to_value(fs.stats()).unwrap();
    assert_eq!(json["ncg"], 4);
    assert_eq!(json["optim"], "time");
    assert_eq!(json["needs_fsck"], false);
    let discards = serde_json::to_value(fs.discard_stats()).unwrap();
    assert_eq!(discards["in_flight"], 0);
}

/// Offset of the last byte of group `c`'s inode map
fn inode_map_tail(fs_geom: &ufsalloc::superblock::Geometry, c: u32) -> u64 {
    let layout = CylinderGroup::new(fs_geom, c, fs_geom.fpg).layout();
    fs_geom.fsb_offset(fs_geom.cgtod(c)) + layout.freeoff as u64 - 1
}

#[tokio::test]
async fn test_corrupt_group_rejected_when_verifying() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    drop(fs);
    dev.corrupt_byte(inode_map_tail(&g, 2));

    let fs = Filesystem::mount(dev.clone(), MountConfig::default())
        .await
        .unwrap();
    let result = fs.alloc_in_group(2, 0, g.bsize, 0).await;
    assert!(matches!(result, Err(FsError::Validation { .. })));
    // Bad on-disk data is not an internal inconsistency
    assert!(!fs.is_detached());
    assert!(!fs.stats().needs_fsck);
}

#[tokio::test]
async fn test_corrupt_group_accepted_when_lenient() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    drop(fs);
    dev.corrupt_byte(inode_map_tail(&g, 2));

    let config = MountConfig {
        verify_cg_hashes: false,
        ..Default::default()
    };
    let fs = Filesystem::mount(dev.clone(), config).await.unwrap();
    let bno = fs.alloc_in_group(2, 0, g.bsize, 0).await.unwrap();
    assert_eq!(bno.map(|b| g.dtog(b)), Some(2));
    assert!(fs.stats().needs_fsck);

    fs.unmount().await.unwrap();
    let on_disk = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert_eq!(on_disk.sb.clean, 0);
    assert_ne!(on_disk.sb.flags & FS_NEEDSFSCK, 0);
}

#[tokio::test]
async fn test_stale_superblock() {
    let (dev, _sb) = formatted(&small_options()).await;
    // First byte of the mount point name
    dev.corrupt_byte(SBLOCK_UFS2 + 0xd4);

    let result = Filesystem::mount(dev.clone(), MountConfig::default()).await;
    assert!(matches!(result, Err(FsError::StaleSuperblock { .. })));

    let config = MountConfig {
        ignore_hash_failures: true,
        ..Default::default()
    };
    let fs = Filesystem::mount(dev.clone(), config).await.unwrap();
    assert!(fs.stats().needs_fsck);
}

#[tokio::test]
async fn test_inconsistent_geometry_rejected() {
    let (dev, _sb) = formatted(&small_options()).await;
    let mut loaded = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    // Hash stays valid, the shift no longer matches the fragment size
    loaded.sb.fshift = 0;
    write_superblock(&*dev, &mut loaded.sb, &loaded.csums)
        .await
        .unwrap();

    let result = Filesystem::mount(dev.clone(), MountConfig::default()).await;
    assert!(matches!(result, Err(FsError::InvalidGeometry(_))));
    let result = check_filesystem(&*dev, &SbReadOptions::default()).await;
    assert!(matches!(result, Err(FsError::InvalidGeometry(_))));
}

#[tokio::test]
async fn test_detached_filesystem_left_needing_fsck() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    let mounted_free = fs.stats().free_blocks;
    let bno = fs
        .alloc_block(BlockRequest {
            ino: 0,
            bpref: 64,
            size: g.bsize,
            privileged: false,
        })
        .await
        .unwrap();
    fs.free_blocks(bno, g.bsize, 0, TrimKey::NoTrim).await.unwrap();
    let err = fs
        .free_blocks(bno, g.bsize, 0, TrimKey::NoTrim)
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Corruption { .. }));
    assert!(fs.stats().needs_fsck);

    assert!(matches!(fs.sync().await, Err(FsError::Detached)));
    assert!(matches!(fs.unmount().await, Err(FsError::Detached)));

    let on_disk = read_superblock(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert_eq!(on_disk.sb.clean, 0);
    assert_ne!(on_disk.sb.flags & FS_NEEDSFSCK, 0);
    // Counters stay as last synced
    assert_eq!(on_disk.sb.cstotal.nbfree, mounted_free);

    let fs = Filesystem::mount(dev.clone(), MountConfig::default())
        .await
        .unwrap();
    assert!(fs.stats().needs_fsck);
}

#[tokio::test]
async fn test_repeated_read_failures_detach() {
    let (dev, fs) = mounted(MountConfig::default()).await;
    let g = fs.geometry();
    drop(fs);
    let offset = g.fsb_offset(g.cgtod(3));
    dev.fail_reads(offset..offset + 512);

    let config = MountConfig {
        io_failure_limit: 2,
        ..Default::default()
    };
    let fs = Filesystem::mount(dev.clone(), config).await.unwrap();
    assert!(matches!(
        fs.alloc_in_group(3, 0, g.bsize, 0).await,
        Err(FsError::Device(_))
    ));
    assert!(!fs.is_detached());
    assert!(fs.alloc_in_group(3, 0, g.bsize, 0).await.is_err());
    assert!(fs.is_detached());
    assert!(matches!(
        fs.alloc_in_group(0, 0, g.bsize, 0).await,
        Err(FsError::Detached)
    ));
}

#[tokio::test]
async fn test_file_backed_device() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ufs.img");

    let mut dev = FileBackedBlockDevice::create(&path, DEVICE_SIZE).await.unwrap();
    format_device(&dev, &small_options()).await.unwrap();
    dev.close().await.unwrap();

    let dev = Arc::new(FileBackedBlockDevice::open(&path, false).await.unwrap());
    let fs = Filesystem::mount(dev.clone(), MountConfig::default())
        .await
        .unwrap();
    let g = fs.geometry();
    let bno = fs
        .alloc_block(BlockRequest {
            ino: 0,
            bpref: 64,
            size: g.bsize,
            privileged: false,
        })
        .await
        .unwrap();
    assert_eq!(bno, 64);
    let free = fs.stats().free_blocks;
    fs.unmount().await.unwrap();
    drop(dev);

    let dev = Arc::new(FileBackedBlockDevice::open(&path, true).await.unwrap());
    let fs = Filesystem::mount(dev.clone(), MountConfig::default())
        .await
        .unwrap();
    assert_eq!(fs.stats().free_blocks, free);
    assert!(matches!(
        fs.alloc_block(BlockRequest {
            ino: 0,
            bpref: 0,
            size: g.bsize,
            privileged: false,
        })
        .await,
        Err(FsError::Device(BlockDeviceError::ReadOnly))
    ));
    fs.unmount().await.unwrap();

    let report = check_filesystem(&*dev, &SbReadOptions::default())
        .await
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.problems);
}
