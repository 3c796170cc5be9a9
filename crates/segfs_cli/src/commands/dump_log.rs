//! Dump-log command implementation.

use crate::error::CliError;
use segfs_core::layout::SegFlags;
use segfs_core::{BlockDevice, LogReader, PartialSegment, SegNum};
use segfs_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// Partial segment representation for output.
#[derive(Debug, Serialize)]
pub struct PsegInfo {
    /// Segment holding the partial segment.
    pub segment: u64,
    /// First block.
    pub start: u64,
    /// Sequence number.
    pub seq: u64,
    /// Checkpoint the log belongs to.
    pub cno: u64,
    /// Flag names.
    pub flags: String,
    /// Blocks, summary and super root included.
    pub nblocks: u32,
    /// Number of files described.
    pub nfinfo: u32,
    /// Segment the log continues in.
    pub next: u64,
    /// Whether the partial segment ends in a super root.
    pub super_root: bool,
    /// Files described (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileInfoOut>>,
}

/// A file info record for output.
#[derive(Debug, Serialize)]
pub struct FileInfoOut {
    /// Inode number.
    pub ino: u64,
    /// Data blocks.
    pub ndatablk: u32,
    /// Node blocks.
    pub nnodeblk: u32,
    /// File size recorded with the blocks.
    pub size: u64,
}

/// Runs the dump-log command.
///
/// Partial segments are listed in sequence order. Stale logs left behind in
/// reused segments are listed too; their sequence numbers are lower than
/// the live log around them.
pub fn run(
    path: &Path,
    segment: Option<u64>,
    limit: Option<usize>,
    show_files: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (device, superblocks) = BlockDevice::open(Box::new(FileBackend::open(path)?))?;
    let seed = superblocks
        .first()
        .map(|sb| sb.crc_seed)
        .ok_or("no valid superblock")?;
    let nsegments = device.geometry().nsegments();
    let reader = LogReader::new(&device, seed);

    let segments = match segment {
        Some(segnum) if segnum >= nsegments => {
            return Err(CliError::SegmentOutOfRange { segment: segnum, nsegments }.into());
        }
        Some(segnum) => segnum..segnum + 1,
        None => 0..nsegments,
    };

    let mut psegs: Vec<PsegInfo> = segments
        .flat_map(|segnum| {
            reader
                .segment(SegNum::new(segnum))
                .into_iter()
                .map(move |pseg| describe(segnum, &pseg, show_files))
        })
        .collect();
    psegs.sort_by_key(|p| p.seq);
    if let Some(limit) = limit {
        psegs.truncate(limit);
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&psegs)?);
        }
        _ => {
            print_text_output(&psegs);
        }
    }

    Ok(())
}

fn describe(segment: u64, pseg: &PartialSegment, show_files: bool) -> PsegInfo {
    let header = pseg.header();
    PsegInfo {
        segment,
        start: pseg.start(),
        seq: header.seq,
        cno: header.cno.as_u64(),
        flags: format!("{:?}", header.flags),
        nblocks: header.nblocks,
        nfinfo: header.nfinfo,
        next: header.next,
        super_root: pseg.has(SegFlags::SR),
        files: show_files.then(|| {
            pseg.summary()
                .files
                .iter()
                .map(|entry| FileInfoOut {
                    ino: entry.info.ino.as_u64(),
                    ndatablk: entry.info.ndatablk,
                    nnodeblk: entry.info.nblocks.saturating_sub(entry.info.ndatablk),
                    size: entry.info.size,
                })
                .collect()
        }),
    }
}

fn print_text_output(psegs: &[PsegInfo]) {
    println!("{} partial segment(s)", psegs.len());
    println!();
    println!(
        "{:>8}  {:>4}  {:>8}  {:>6}  {:>6}  {:>8}  FLAGS",
        "SEQ", "SEG", "START", "BLOCKS", "CNO", "NEXT"
    );
    for p in psegs {
        println!(
            "{:>8}  {:>4}  {:>8}  {:>6}  {:>6}  {:>8}  {}",
            p.seq, p.segment, p.start, p.nblocks, p.cno, p.next, p.flags
        );
        if let Some(files) = &p.files {
            for f in files {
                println!(
                    "          ino {:<6} {} data + {} node block(s), size {}",
                    f.ino, f.ndatablk, f.nnodeblk, f.size
                );
            }
        }
    }
}
