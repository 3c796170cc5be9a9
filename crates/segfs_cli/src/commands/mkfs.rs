//! Mkfs command implementation.

use segfs_core::{Filesystem, FormatOptions};
use segfs_storage::FileBackend;
use std::path::Path;

/// Runs the mkfs command.
pub fn run(
    path: &Path,
    size: u64,
    block_size: u32,
    blocks_per_segment: u32,
    reserved: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = FormatOptions::new()
        .device_size(size)
        .block_size(block_size)
        .blocks_per_segment(blocks_per_segment)
        .reserved_segments_percent(reserved);
    let backend = FileBackend::create(path, size)?;
    let geometry = Filesystem::format(Box::new(backend), &options)?;

    println!("Formatted {}", path.display());
    println!("  Block size:         {} bytes", geometry.block_size());
    println!("  Blocks per segment: {}", geometry.blocks_per_segment());
    println!("  Segments:           {}", geometry.nsegments());
    println!("  Used size:          {} bytes", geometry.device_bytes());
    Ok(())
}
