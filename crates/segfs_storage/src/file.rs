//! File-backed storage for disk images.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A disk image stored in a regular file.
///
/// The file is locked exclusively for as long as the backend lives, so two
/// processes can never run a segment constructor against the same image.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_data()` so completed writes reach the disk
///
/// # Example
///
/// ```no_run
/// use segfs_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::create(Path::new("disk.img"), 1 << 20).unwrap();
/// backend.write_at(4096, b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens an existing image.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is locked by another
    /// process.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file)
    }

    /// Creates (or truncates) an image of `size` zero bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, sized or locked.
    pub fn create(path: &Path, size: u64) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut backend = Self::from_file(path, file)?;
        backend.set_len(size)?;
        Ok(backend)
    }

    fn from_file(path: &Path, file: File) -> StorageResult<Self> {
        file.try_lock_exclusive()
            .map_err(|e| StorageError::Locked(format!("{}: {e}", path.display())))?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = *self.size.read();
        let end = offset.saturating_add(data.len() as u64);

        if end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn set_len(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();
        file.set_len(new_size)?;
        file.sync_all()?;
        *size = new_size;
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&*self.file.read());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_sizes_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let backend = FileBackend::create(&path, 8192).unwrap();
        assert_eq!(backend.size().unwrap(), 8192);
        assert_eq!(backend.read_at(4000, 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut backend = FileBackend::create(&path, 64).unwrap();
        backend.write_at(10, b"hello world").unwrap();
        assert_eq!(backend.read_at(10, 11).unwrap(), b"hello world");
        assert_eq!(backend.read_at(16, 5).unwrap(), b"world");
    }

    #[test]
    fn file_write_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut backend = FileBackend::create(&path, 16).unwrap();
        let result = backend.write_at(10, b"0123456789");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        {
            let mut backend = FileBackend::create(&path, 128).unwrap();
            backend.write_at(100, b"persistent").unwrap();
            backend.sync().unwrap();
        }

        {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.size().unwrap(), 128);
            assert_eq!(backend.read_at(100, 10).unwrap(), b"persistent");
        }
    }

    #[test]
    fn file_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let _first = FileBackend::create(&path, 64).unwrap();
        let second = FileBackend::open(&path);
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("disk.img");

        let backend = FileBackend::create(&path, 32).unwrap();
        assert_eq!(backend.path(), path);
        assert!(path.exists());
    }
}
