//! Info command: print the superblock and free space summary

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use ufsalloc::superblock::{
    read_superblock, Geometry, SbReadOptions, FS_NEEDSFSCK, FS_OPTSPACE, FS_TRIM,
};

use super::open_read_only;

/// Show the superblock and free space summary
#[derive(Parser, Debug)]
#[command(about = "Show superblock and free space information")]
pub struct InfoArgs {
    /// Device or image file to inspect
    pub device: PathBuf,

    /// Read the superblock from this byte offset instead of searching
    #[arg(long)]
    pub superblock: Option<u64>,

    /// Accept a superblock whose check-hash fails
    #[arg(long)]
    pub ignore_hash: bool,

    /// Also list every cylinder group's summary
    #[arg(short, long)]
    pub groups: bool,

    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

fn format_time(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{} (invalid)", secs))
}

pub async fn run(args: InfoArgs) -> Result<()> {
    let device = open_read_only(&args.device).await?;
    let opts = SbReadOptions {
        location: args.superblock,
        ignore_hash_failures: args.ignore_hash,
    };
    let loaded = read_superblock(&device, &opts)
        .await
        .with_context(|| format!("No usable superblock on {}", args.device.display()))?;
    let sb = &loaded.sb;
    let geom = Geometry::new(sb).context("Superblock geometry is inconsistent")?;

    let optim = if sb.optim == FS_OPTSPACE { "space" } else { "time" };
    let clean = sb.clean != 0 && sb.flags & FS_NEEDSFSCK == 0;
    let trim = sb.flags & FS_TRIM != 0;

    if args.json {
        let mut out = json!({
            "device": args.device.display().to_string(),
            "superblock_location": loaded.location,
            "volume_name": sb.volume_name(),
            "last_written": format_time(sb.time),
            "size_frags": geom.size,
            "data_frags": geom.dsize,
            "ncg": geom.ncg,
            "block_size": geom.bsize,
            "fragment_size": geom.fsize,
            "frags_per_group": geom.fpg,
            "inodes_per_group": geom.ipg,
            "minfree": geom.minfree,
            "optim": optim,
            "trim": trim,
            "clean": clean,
            "totals": sb.cstotal,
        });
        if args.groups {
            out["groups"] = serde_json::to_value(&loaded.csums)?;
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Device:          {}", args.device.display());
    println!("Superblock at:   {}", loaded.location);
    println!("Volume name:     {}", sb.volume_name());
    println!("Last written:    {}", format_time(sb.time));
    println!(
        "Size:            {} fragments ({} usable)",
        geom.size, geom.dsize
    );
    println!(
        "Block size:      {} ({} fragments of {})",
        geom.bsize,
        geom.frags(),
        geom.fsize
    );
    println!(
        "Groups:          {} of {} fragments, {} inodes each",
        geom.ncg, geom.fpg, geom.ipg
    );
    println!("Minfree:         {}%", geom.minfree);
    println!("Optimisation:    {}", optim);
    println!("Trim:            {}", if trim { "enabled" } else { "disabled" });
    println!("State:           {}", if clean { "clean" } else { "needs check" });
    println!();
    println!("Free blocks:     {}", sb.cstotal.nbfree);
    println!("Free fragments:  {}", sb.cstotal.nffree);
    println!("Free inodes:     {}", sb.cstotal.nifree);
    println!("Directories:     {}", sb.cstotal.ndir);

    if args.groups {
        println!();
        println!("{:>6} {:>10} {:>10} {:>10} {:>8}", "group", "nbfree", "nffree", "nifree", "ndir");
        for (c, cs) in loaded.csums.iter().enumerate() {
            println!(
                "{:>6} {:>10} {:>10} {:>10} {:>8}",
                c, cs.nbfree, cs.nffree, cs.nifree, cs.ndir
            );
        }
    }
    Ok(())
}
