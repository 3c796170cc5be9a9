//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory storage backend.
///
/// Handles created with [`InMemoryBackend::share`] view the same bytes, which
/// lets a test keep a handle on a device after the filesystem that owns it
/// has been stopped, and remount the image it left behind.
///
/// # Example
///
/// ```rust
/// use segfs_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::with_size(1024);
/// let observer = backend.share();
/// backend.write_at(0, b"test data").unwrap();
/// assert_eq!(&observer.data()[..9], b"test data");
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled device of `size` bytes.
    #[must_use]
    pub fn with_size(size: usize) -> Self {
        Self::with_data(vec![0; size])
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns another handle on the same bytes.
    #[must_use]
    pub fn share(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }

    /// Returns a copy of all data in the backend.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Overwrites the byte at `offset`, ignoring out-of-range offsets.
    ///
    /// Used by corruption tests.
    pub fn flip_byte(&self, offset: usize) {
        if let Some(byte) = self.data.write().get_mut(offset) {
            *byte ^= 0xff;
        }
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn write_at(&mut self, offset: u64, new_data: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        let end = offset.saturating_add(new_data.len() as u64);

        if end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: new_data.len(),
                size,
            });
        }

        data[offset as usize..end as usize].copy_from_slice(new_data);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn set_len(&mut self, new_size: u64) -> StorageResult<()> {
        self.data.write().resize(new_size as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.data().is_empty());
    }

    #[test]
    fn memory_write_then_read() {
        let mut backend = InMemoryBackend::with_size(32);
        backend.write_at(4, b"hello").unwrap();
        backend.write_at(10, b"world").unwrap();

        assert_eq!(backend.read_at(4, 5).unwrap(), b"hello");
        assert_eq!(backend.read_at(10, 5).unwrap(), b"world");
        assert_eq!(backend.read_at(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn memory_overwrite_replaces_bytes() {
        let mut backend = InMemoryBackend::with_size(8);
        backend.write_at(0, b"aaaaaaaa").unwrap();
        backend.write_at(2, b"bb").unwrap();
        assert_eq!(backend.read_at(0, 8).unwrap(), b"aabbaaaa");
    }

    #[test]
    fn memory_read_past_end_fails() {
        let backend = InMemoryBackend::with_size(5);
        let result = backend.read_at(3, 10);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn memory_write_past_end_fails() {
        let mut backend = InMemoryBackend::with_size(5);
        let result = backend.write_at(4, b"xx");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
        assert_eq!(backend.data(), vec![0; 5]);
    }

    #[test]
    fn memory_set_len_zero_fills() {
        let mut backend = InMemoryBackend::with_data(b"abc".to_vec());
        backend.set_len(6).unwrap();
        assert_eq!(backend.data(), b"abc\0\0\0");
        backend.set_len(2).unwrap();
        assert_eq!(backend.data(), b"ab");
    }

    #[test]
    fn memory_shared_handles_see_writes() {
        let mut backend = InMemoryBackend::with_size(4);
        let other = backend.share();
        backend.write_at(1, b"z").unwrap();
        assert_eq!(other.read_at(1, 1).unwrap(), b"z");
        other.flip_byte(1);
        assert_eq!(backend.read_at(1, 1).unwrap(), vec![b'z' ^ 0xff]);
    }

    proptest! {
        #[test]
        fn memory_reads_return_last_write(
            writes in proptest::collection::vec((0u64..60, proptest::collection::vec(any::<u8>(), 1..4)), 1..20)
        ) {
            let mut backend = InMemoryBackend::with_size(64);
            let mut model = vec![0u8; 64];
            for (offset, bytes) in &writes {
                backend.write_at(*offset, bytes).unwrap();
                model[*offset as usize..*offset as usize + bytes.len()].copy_from_slice(bytes);
            }
            prop_assert_eq!(backend.read_at(0, 64).unwrap(), model);
        }
    }
}
