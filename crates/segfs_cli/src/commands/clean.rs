//! Clean command implementation.

use segfs_core::{Config, Filesystem};
use segfs_storage::FileBackend;
use std::path::Path;
use std::time::Duration;

/// Runs the clean command.
pub fn run(path: &Path, per_pass: usize, passes: usize) -> Result<(), Box<dyn std::error::Error>> {
    let backend = FileBackend::open(path)?;
    let config = Config::new()
        .interval(Duration::from_secs(3600))
        .max_checkpoint_age(Duration::from_secs(3600))
        .gc_segments_per_pass(per_pass);
    let fs = Filesystem::mount(Box::new(backend), config)?;

    let before = fs.sufile_stat();
    let mut cleaned = 0;
    for _ in 0..passes {
        let n = fs.clean_segments()?;
        cleaned += n;
        if n == 0 {
            break;
        }
    }
    let after = fs.sufile_stat();
    fs.unmount()?;

    println!("Cleaned {cleaned} segment(s)");
    println!(
        "  Clean segments: {} -> {} of {}",
        before.ncleansegs, after.ncleansegs, after.nsegments
    );
    Ok(())
}
