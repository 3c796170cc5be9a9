//! Put and cat command implementations.

use segfs_core::Ino;
use std::io::Write;
use std::path::Path;

/// Runs the put command: copies `source` into a segfs file and checkpoints.
pub fn put(
    path: &Path,
    source: &Path,
    ino: Option<u64>,
    offset: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(source)?;
    let fs = super::mount(path, false)?;
    let ino = match ino {
        Some(ino) => Ino::new(ino),
        None => fs.create_file()?,
    };
    fs.write_at(ino, offset, &data)?;
    let cno = fs.sync()?;
    fs.unmount()?;

    println!("Wrote {} bytes to {ino} (checkpoint {})", data.len(), cno.as_u64());
    Ok(())
}

/// Runs the cat command.
pub fn cat(path: &Path, ino: u64) -> Result<(), Box<dyn std::error::Error>> {
    // Read-only mounts do not roll forward, so only checkpointed data shows.
    let fs = super::mount(path, true)?;
    let ino = Ino::new(ino);
    let size = fs.file_size(ino)?;
    let mut out = std::io::stdout().lock();
    let chunk = fs.geometry().block_bytes() as u64 * 64;
    let mut offset = 0;
    while offset < size {
        let len = chunk.min(size - offset);
        out.write_all(&fs.read_at(ino, offset, len as usize)?)?;
        offset += len;
    }
    out.flush()?;
    fs.unmount()?;
    Ok(())
}
