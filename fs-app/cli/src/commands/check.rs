//! Check command: recount the maps and report disagreements

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Instant;

use ufsalloc::check::check_filesystem;
use ufsalloc::superblock::SbReadOptions;

use super::open_read_only;

/// Recount every cylinder group and report inconsistencies
#[derive(Parser, Debug)]
#[command(about = "Check cylinder group maps against their counters")]
pub struct CheckArgs {
    /// Device or image file to check
    pub device: PathBuf,

    /// Read the superblock from this byte offset instead of searching
    #[arg(long)]
    pub superblock: Option<u64>,

    /// Accept a superblock whose check-hash fails
    #[arg(long)]
    pub ignore_hash: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: CheckArgs) -> Result<()> {
    let device = open_read_only(&args.device).await?;
    let opts = SbReadOptions {
        location: args.superblock,
        ignore_hash_failures: args.ignore_hash,
    };

    let start = Instant::now();
    let report = check_filesystem(&device, &opts)
        .await
        .with_context(|| format!("Failed to check {}", args.device.display()))?;
    info!(
        "Checked {} groups in {:.2?}",
        report.groups_checked,
        start.elapsed()
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Groups checked:  {}", report.groups_checked);
        println!("Free blocks:     {}", report.recounted.nbfree);
        println!("Free fragments:  {}", report.recounted.nffree);
        println!("Free inodes:     {}", report.recounted.nifree);
        println!("Directories:     {}", report.recounted.ndir);
        if report.needs_fsck {
            println!("Superblock is marked as needing a full check");
        }
        for p in &report.problems {
            match p.cg {
                Some(c) => println!("group {}: {}", c, p.detail),
                None => println!("{}", p.detail),
            }
        }
    }

    if !report.is_clean() {
        bail!("{} problem(s) found", report.problems.len());
    }
    if !args.json {
        println!("No problems found");
    }
    Ok(())
}
