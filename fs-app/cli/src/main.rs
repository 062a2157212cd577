//! ufsalloc command line interface
//!
//! Lays out, inspects and checks UFS2 images through the allocator library.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// Tools for UFS2 images managed by the ufsalloc allocator
#[derive(Parser)]
#[command(
    name = "ufsalloc",
    about = "ufsalloc command-line interface",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lay out a new filesystem on a device or image file
    Format(commands::format::FormatArgs),

    /// Show the superblock and free space summary
    Info(commands::info::InfoArgs),

    /// Recount every cylinder group and report inconsistencies
    Check(commands::check::CheckArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    info!("ufsalloc v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Format(args) => commands::format::run(args).await,
        Commands::Info(args) => commands::info::run(args).await,
        Commands::Check(args) => commands::check::run(args).await,
    }
}
