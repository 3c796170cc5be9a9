//! Verify command implementation.

use crate::error::CliError;
use segfs_core::layout::SummaryHeader;
use segfs_core::{run_recovery, BlockDevice, LogReader, SegNum};
use segfs_storage::FileBackend;
use std::path::Path;

/// Verification result.
#[derive(Debug)]
pub struct VerifyResult {
    /// Number of valid superblock copies.
    pub superblocks_valid: usize,
    /// Number of partial segments verified.
    pub psegs_checked: usize,
    /// Segments holding at least one valid partial segment.
    pub segments_with_log: u64,
    /// Problems that make the image unusable or lose data.
    pub errors: Vec<String>,
    /// Findings a crash can leave behind.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn new() -> Self {
        Self {
            superblocks_valid: 0,
            psegs_checked: 0,
            segments_with_log: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying image at {:?}", path);
    println!();

    let mut result = VerifyResult::new();

    println!("Checking superblocks...");
    {
        let backend = FileBackend::open(path)?;
        for (slot, copy) in BlockDevice::probe(&backend)?.into_iter().enumerate() {
            match copy {
                Ok(_) => result.superblocks_valid += 1,
                Err(e) => result.errors.push(format!("superblock copy {slot}: {e}")),
            }
        }
    }

    println!("Checking recovery...");
    match run_recovery(Box::new(FileBackend::open(path)?)) {
        Ok(info) => {
            if info.full_scan {
                result
                    .errors
                    .push("no superblock points at a valid super root".to_string());
            }
            if !info.is_clean() {
                result.warnings.push(format!(
                    "{} logical segment(s) after checkpoint {} await roll-forward",
                    info.logical_segments,
                    info.cno.as_u64()
                ));
            }
        }
        Err(e) => result.errors.push(format!("recovery: {e}")),
    }

    if result.superblocks_valid > 0 {
        println!("Checking log...");
        verify_log(path, &mut result)?;
    }

    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Image verification passed");
        Ok(())
    } else {
        println!("✗ Image verification failed");
        Err(CliError::VerificationFailed(result.errors.len()).into())
    }
}

/// Walks every segment. A block right after the last valid partial segment
/// that starts a summary continuing the sequence is a torn or damaged log.
fn verify_log(path: &Path, result: &mut VerifyResult) -> Result<(), Box<dyn std::error::Error>> {
    let (device, superblocks) = BlockDevice::open(Box::new(FileBackend::open(path)?))?;
    let seed = superblocks
        .first()
        .map(|sb| sb.crc_seed)
        .ok_or("no valid superblock")?;
    let reader = LogReader::new(&device, seed);
    let geometry = *device.geometry();

    for segnum in 0..geometry.nsegments() {
        let psegs = reader.segment(SegNum::new(segnum));
        let Some(last) = psegs.last() else { continue };
        result.segments_with_log += 1;
        result.psegs_checked += psegs.len();

        if let Some(next) = reader.follow_on(last) {
            let Ok(block) = device.read_block(next) else {
                result.errors.push(format!("block {next}: unreadable"));
                continue;
            };
            if let Ok(header) = SummaryHeader::decode(&block) {
                if header.seq == last.header().seq + 1 {
                    if let Err(e) = reader.read(next) {
                        result
                            .warnings
                            .push(format!("segment {segnum}: partial segment at {next}: {e}"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_result(result: &VerifyResult) {
    println!();
    println!("  Superblock copies valid: {}/2", result.superblocks_valid);
    println!("  Segments with log:       {}", result.segments_with_log);
    println!("  Partial segments:        {}", result.psegs_checked);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}
