//! # segfs core
//!
//! A log-structured filesystem core in the NILFS2 mould.
//!
//! All writes go to the head of an append-only log of partial segments.
//! A background segment constructor batches dirty file blocks and metadata
//! into partial segments; a partial segment ending with a super root is a
//! checkpoint. Mount recovers the latest checkpoint and rolls forward the
//! logs written after it.
//!
//! This crate provides:
//! - The on-disk format: superblock, segment summary, super root
//! - The metadata files: DAT, checkpoint file, segment usage file, ifile
//! - The segment constructor with its request queue and tickets
//! - Recovery and roll-forward at mount
//! - A segment cleaner driven through the constructor
//!
//! ## Example
//!
//! ```rust
//! use segfs_core::{Config, Filesystem, FormatOptions};
//! use segfs_storage::InMemoryBackend;
//!
//! let backend = InMemoryBackend::new();
//! let options = FormatOptions::new()
//!     .block_size(1024)
//!     .blocks_per_segment(32)
//!     .device_size(16 * 32 * 1024 + 1024);
//! Filesystem::format(Box::new(backend.share()), &options).unwrap();
//!
//! let fs = Filesystem::mount(Box::new(backend.share()), Config::default()).unwrap();
//! let ino = fs.create_file().unwrap();
//! fs.write_at(ino, 0, b"durable").unwrap();
//! let cno = fs.sync().unwrap();
//! assert!(cno.as_u64() >= 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod construct;
mod device;
mod drop_queue;
mod error;
mod file_table;
mod filesystem;
mod gc;
pub mod layout;
mod mdt;
mod metadata;
mod recovery;
mod segment;
mod stats;
mod types;

pub use config::{Config, FormatOptions};
pub use construct::{Completion, Phase, SequenceCounters, Stage, Ticket};
pub use device::BlockDevice;
pub use error::{ConstructionFailure, CoreError, CoreResult, FailureKind};
pub use filesystem::Filesystem;
pub use layout::Geometry;
pub use mdt::{Checkpoint, SegmentUsage, SufileStat};
pub use recovery::{run_recovery, RecoveryInfo};
pub use segment::{LogReader, LoggedBlock, PartialSegment};
pub use stats::{FsStats, StatsSnapshot};
pub use types::{BlockNr, Cno, Ino, SegNum, VBlockNr};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
