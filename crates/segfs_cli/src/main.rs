//! segfs CLI
//!
//! Command-line tools for segfs images.
//!
//! # Commands
//!
//! - `mkfs` - Format an image file
//! - `inspect` - Display geometry, segment usage and checkpoints
//! - `dump-log` - Dump partial-segment summaries for debugging
//! - `verify` - Check superblocks, the log and recovery
//! - `put` - Write a host file into a segfs file
//! - `cat` - Print the contents of a segfs file
//! - `clean` - Run the segment cleaner

mod commands;
mod error;

use clap::{Parser, Subcommand};
use error::CliError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// segfs command-line image tools.
#[derive(Parser)]
#[command(name = "segfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the image file
    #[arg(global = true, short, long)]
    image: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Format an image file
    Mkfs {
        /// Image size in bytes
        #[arg(short, long, default_value = "67108864")]
        size: u64,

        /// Block size in bytes
        #[arg(short, long, default_value = "4096")]
        block_size: u32,

        /// Blocks per segment
        #[arg(long, default_value = "512")]
        blocks_per_segment: u32,

        /// Percentage of segments reserved for the cleaner
        #[arg(short, long, default_value = "5")]
        reserved: u32,
    },

    /// Display geometry, segment usage and checkpoints
    Inspect {
        /// Show per-segment usage
        #[arg(short, long)]
        segments: bool,

        /// Show the checkpoint list
        #[arg(short, long)]
        checkpoints: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump partial-segment summaries for debugging
    DumpLog {
        /// Only dump this segment
        #[arg(short, long)]
        segment: Option<u64>,

        /// Maximum number of partial segments to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// List the files of every partial segment
        #[arg(long)]
        files: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check superblocks, the log and recovery
    Verify,

    /// Write a host file into a segfs file
    Put {
        /// Host file to read
        source: PathBuf,

        /// Existing inode to write to (a new file is created otherwise)
        #[arg(long)]
        ino: Option<u64>,

        /// Byte offset to write at
        #[arg(short, long, default_value = "0")]
        offset: u64,
    },

    /// Print the contents of a segfs file
    Cat {
        /// Inode number
        ino: u64,
    },

    /// Run the segment cleaner
    Clean {
        /// Victim segments examined per pass
        #[arg(short, long, default_value = "4")]
        per_pass: usize,

        /// Number of passes
        #[arg(long, default_value = "1")]
        passes: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so `cat` output stays clean.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let image = |command: &'static str| cli.image.clone().ok_or(CliError::ImageRequired(command));

    match cli.command {
        Commands::Mkfs {
            size,
            block_size,
            blocks_per_segment,
            reserved,
        } => {
            let path = image("mkfs")?;
            commands::mkfs::run(&path, size, block_size, blocks_per_segment, reserved)?;
        }
        Commands::Inspect {
            segments,
            checkpoints,
            format,
        } => {
            let path = image("inspect")?;
            commands::inspect::run(&path, segments, checkpoints, &format)?;
        }
        Commands::DumpLog {
            segment,
            limit,
            files,
            format,
        } => {
            let path = image("dump-log")?;
            commands::dump_log::run(&path, segment, limit, files, &format)?;
        }
        Commands::Verify => {
            let path = image("verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Put {
            source,
            ino,
            offset,
        } => {
            let path = image("put")?;
            commands::files::put(&path, &source, ino, offset)?;
        }
        Commands::Cat { ino } => {
            let path = image("cat")?;
            commands::files::cat(&path, ino)?;
        }
        Commands::Clean { per_pass, passes } => {
            let path = image("clean")?;
            commands::clean::run(&path, per_pass, passes)?;
        }
        Commands::Version => {
            println!("segfs CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("segfs core v{}", segfs_core::VERSION);
        }
    }

    Ok(())
}
