//! CLI command implementations.

pub mod clean;
pub mod dump_log;
pub mod files;
pub mod inspect;
pub mod mkfs;
pub mod verify;

use segfs_core::{Config, CoreResult, Filesystem};
use segfs_storage::FileBackend;
use std::path::Path;

/// Mounts the image at `path`.
///
/// The constructor timer is slowed down so that a short-lived CLI mount only
/// writes what the command asks for.
pub fn mount(path: &Path, read_only: bool) -> CoreResult<Filesystem> {
    let backend = FileBackend::open(path)?;
    let config = Config::new()
        .interval(std::time::Duration::from_secs(3600))
        .max_checkpoint_age(std::time::Duration::from_secs(3600))
        .read_only(read_only);
    Filesystem::mount(Box::new(backend), config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 16 * 32 * 1024 + 1024;

    #[test]
    fn put_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fs.img");
        let source = dir.path().join("hello.txt");
        std::fs::write(&source, b"hello from the host").unwrap();

        mkfs::run(&image, SIZE, 1024, 32, 5).unwrap();
        files::put(&image, &source, None, 0).unwrap();
        inspect::run(&image, true, true, "json").unwrap();
        verify::run(&image).unwrap();
        dump_log::run(&image, None, Some(4), true, "text").unwrap();

        let fs = mount(&image, true).unwrap();
        let ino = segfs_core::Ino::FIRST_USER;
        assert_eq!(fs.read_at(ino, 0, 19).unwrap(), b"hello from the host");
        fs.unmount().unwrap();
    }

    #[test]
    fn clean_on_a_fresh_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fs.img");
        mkfs::run(&image, SIZE, 1024, 32, 5).unwrap();
        clean::run(&image, 4, 2).unwrap();
        verify::run(&image).unwrap();
    }

    #[test]
    fn dump_log_rejects_missing_segments() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fs.img");
        mkfs::run(&image, SIZE, 1024, 32, 5).unwrap();
        assert!(dump_log::run(&image, Some(16), None, false, "text").is_err());
    }
}
