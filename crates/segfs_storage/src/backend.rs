//! Storage backend trait definition.

use crate::error::StorageResult;

/// A random-access byte store used as the filesystem's block device.
///
/// The device has a fixed size chosen when it is created (see
/// [`StorageBackend::set_len`]). Writes never extend it: a log-structured
/// filesystem only ever overwrites blocks that already exist.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes most recently written at that range
/// - `write_at` fails with `WritePastEnd` instead of growing the device
/// - after `sync` returns, every completed `write_at` survives power loss
/// - backends are `Send + Sync` so the constructor thread can own them
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For disk images
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of the device or
    /// an I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at `offset`, overwriting whatever was there.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of the device or
    /// an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the device size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes every completed write durable.
    ///
    /// This is the write barrier the log writer relies on: a partial segment
    /// only counts as written once `sync` has returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Resizes the device. New space reads as zeroes.
    ///
    /// Only used when formatting a fresh image.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails.
    fn set_len(&mut self, new_size: u64) -> StorageResult<()>;
}
