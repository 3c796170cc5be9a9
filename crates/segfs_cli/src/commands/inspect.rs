//! Inspect command implementation.

use segfs_core::{run_recovery, Checkpoint, RecoveryInfo, SegmentUsage, SufileStat};
use segfs_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Image inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Image path.
    pub path: String,
    /// Block size in bytes.
    pub block_size: u32,
    /// Blocks per segment.
    pub blocks_per_segment: u32,
    /// Number of segments.
    pub nsegments: u64,
    /// Latest checkpoint number.
    pub last_cno: u64,
    /// Segment usage counts.
    pub sufile: SufileStat,
    /// What recovery found.
    pub recovery: RecoveryInfo,
    /// Per-segment usage (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentEntry>>,
    /// Checkpoints (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<Vec<Checkpoint>>,
}

/// Usage of one segment.
#[derive(Debug, Serialize)]
pub struct SegmentEntry {
    /// Segment number.
    pub segnum: u64,
    /// Usage record.
    #[serde(flatten)]
    pub usage: SegmentUsage,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_segments: bool,
    show_checkpoints: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No image found at {:?}", path).into());
    }

    let recovery = run_recovery(Box::new(FileBackend::open(path)?))?;
    let fs = super::mount(path, true)?;
    let geometry = fs.geometry();

    let result = InspectResult {
        path: path.display().to_string(),
        block_size: geometry.block_size(),
        blocks_per_segment: geometry.blocks_per_segment(),
        nsegments: geometry.nsegments(),
        last_cno: fs.last_cno().as_u64(),
        sufile: fs.sufile_stat(),
        recovery,
        segments: show_segments.then(|| {
            fs.segment_usage()
                .into_iter()
                .enumerate()
                .map(|(segnum, usage)| SegmentEntry {
                    segnum: segnum as u64,
                    usage,
                })
                .collect()
        }),
        checkpoints: show_checkpoints.then(|| fs.checkpoints()),
    };
    fs.unmount()?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("segfs Image Inspection");
    println!("======================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Geometry:");
    println!("  Block size:         {} bytes", result.block_size);
    println!("  Blocks per segment: {}", result.blocks_per_segment);
    println!("  Segments:           {}", result.nsegments);
    println!();
    println!("Segment usage:");
    println!("  Clean: {}", result.sufile.ncleansegs);
    println!("  Dirty: {}", result.sufile.ndirtysegs);
    println!();
    println!("Log:");
    println!("  Last checkpoint:  {}", result.last_cno);
    println!(
        "  Super root:       block {} (seq {})",
        result.recovery.super_root, result.recovery.super_root_seq
    );
    if result.recovery.is_clean() {
        println!("  State:            clean");
    } else {
        println!(
            "  State:            {} logical segment(s) to roll forward",
            result.recovery.logical_segments
        );
    }
    if result.recovery.full_scan {
        println!("  Warning: no superblock pointed at a valid super root");
    }

    if let Some(segments) = &result.segments {
        println!();
        println!("Segments:");
        for entry in segments {
            let state = if entry.usage.is_error() {
                "error"
            } else if entry.usage.is_dirty() {
                "dirty"
            } else {
                "clean"
            };
            println!(
                "  {:>6}  {:<5}  {:>6} blocks  lastmod {}",
                entry.segnum, state, entry.usage.nblocks, entry.usage.lastmod
            );
        }
    }

    if let Some(checkpoints) = &result.checkpoints {
        println!();
        println!("Checkpoints:");
        for cp in checkpoints {
            println!(
                "  {:>6}  created {}  {} inode(s)  {} block(s)  +{} written",
                cp.cno.as_u64(),
                cp.create,
                cp.inodes_count,
                cp.blocks_count,
                cp.nblk_inc
            );
        }
    }
}
