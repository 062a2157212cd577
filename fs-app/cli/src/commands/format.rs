//! Format command for laying out new filesystems

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use std::io::Write;
use std::path::PathBuf;

use ufsalloc::blockdev::{BlockDevice, FileBackedBlockDevice};
use ufsalloc::format::format_device;
use ufsalloc::superblock::{FS_OPTSPACE, FS_OPTTIME};
use ufsalloc::FormatOptions;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Optim {
    /// Favour allocation speed
    Time,
    /// Favour minimal fragmentation
    Space,
}

/// Lay out a new filesystem on a device or image file
#[derive(Parser, Debug)]
#[command(about = "Lay out a new UFS2 filesystem")]
pub struct FormatArgs {
    /// Device or image file to format
    pub device: PathBuf,

    /// Filesystem size in MiB; 0 uses the whole device
    #[arg(short, long, default_value_t = 0)]
    pub size: u64,

    /// Create the image file (of --size MiB) if it does not exist
    #[arg(long)]
    pub create: bool,

    #[arg(short = 'b', long, default_value_t = 32768)]
    pub block_size: u32,

    #[arg(short = 'f', long, default_value_t = 4096)]
    pub fragment_size: u32,

    /// Bytes of data space per inode
    #[arg(short = 'i', long, default_value_t = 16384)]
    pub density: u32,

    /// Percentage of space reserved for privileged allocation
    #[arg(short = 'm', long, default_value_t = 8)]
    pub minfree: u8,

    #[arg(short = 'o', long, value_enum, default_value_t = Optim::Time)]
    pub optim: Optim,

    /// Mark the filesystem as wanting discards of freed blocks
    #[arg(short = 't', long)]
    pub trim: bool,

    /// Volume label
    #[arg(short = 'L', long, default_value = "")]
    pub label: String,

    /// Format without asking for confirmation
    #[arg(long)]
    pub force: bool,
}

impl FormatArgs {
    fn options(&self) -> FormatOptions {
        FormatOptions {
            size: self.size * MIB,
            block_size: self.block_size,
            fragment_size: self.fragment_size,
            density: self.density,
            minfree: self.minfree,
            optim: match self.optim {
                Optim::Time => FS_OPTTIME,
                Optim::Space => FS_OPTSPACE,
            },
            trim: self.trim,
            volume_name: self.label.clone(),
            ..Default::default()
        }
    }
}

pub async fn run(args: FormatArgs) -> Result<()> {
    info!("ufsalloc format v{}", env!("CARGO_PKG_VERSION"));

    let mut device = if args.device.exists() {
        FileBackedBlockDevice::open(&args.device, false)
            .await
            .with_context(|| format!("Failed to open {}", args.device.display()))?
    } else if args.create {
        if args.size == 0 {
            bail!("--create needs an explicit --size");
        }
        info!("Creating image {} ({} MiB)", args.device.display(), args.size);
        FileBackedBlockDevice::create(&args.device, args.size * MIB)
            .await
            .with_context(|| format!("Failed to create {}", args.device.display()))?
    } else {
        return Err(anyhow!("Device {} does not exist", args.device.display()));
    };

    let opts = args.options();
    if opts.size > device.size() {
        bail!(
            "Requested size ({} MiB) exceeds device size ({:.2} MiB)",
            args.size,
            device.size() as f64 / MIB as f64
        );
    }

    if !args.force {
        println!(
            "WARNING: This will format {} as UFS2.",
            args.device.display()
        );
        println!("This operation will DESTROY ALL DATA on the device!");
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    let sb = format_device(&device, &opts)
        .await
        .with_context(|| format!("Failed to format {}", args.device.display()))?;
    device
        .close()
        .await
        .with_context(|| format!("Failed to close {}", args.device.display()))?;

    println!(
        "{}: {} cylinder groups of {} fragments, {} inodes each",
        args.device.display(),
        sb.ncg,
        sb.fpg,
        sb.ipg
    );
    println!(
        "block size {}, fragment size {}, {} free blocks",
        sb.bsize, sb.fsize, sb.cstotal.nbfree
    );
    Ok(())
}
