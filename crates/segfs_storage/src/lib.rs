//! # segfs storage
//!
//! Random-access storage backends for segfs.
//!
//! Backends are **opaque byte stores** standing in for a block device. They
//! know nothing about segments, summaries or super roots; `segfs_core` owns
//! every on-disk format decision.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and throwaway images
//! - [`FileBackend`] - A regular file used as a disk image
//!
//! ## Example
//!
//! ```rust
//! use segfs_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::with_size(4096);
//! backend.write_at(512, b"hello world").unwrap();
//! let data = backend.read_at(512, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
