//! # segfs testkit
//!
//! Test utilities for segfs.
//!
//! This crate provides:
//! - Small formatted filesystems in memory or in a temporary image file
//! - A backend that fails or silently loses writes, for crash tests
//! - Property-based generators of write workloads with a reference model
//!
//! ## Usage
//!
//! ```rust,ignore
//! use segfs_testkit::prelude::*;
//!
//! #[test]
//! fn survives_a_crash() {
//!     let mut t = TestFs::new();
//!     let ino = t.create_file().unwrap();
//!     t.write_block(ino, 0, &pattern(t.geometry().block_bytes(), 7)).unwrap();
//!     t.fsync(ino).unwrap();
//!     t.crash();
//!     assert!(t.recovery_info().rolled_forward);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
