//! Core type definitions for segfs.

use serde::Serialize;
use std::fmt;

/// Physical block number on the device.
pub type BlockNr = u64;

/// Virtual block number, translated to a [`BlockNr`] by the DAT.
///
/// Zero means "no block".
pub type VBlockNr = u64;

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Ino(pub u64);

impl Ino {
    /// Disk address translation table.
    pub const DAT: Ino = Ino(3);
    /// Checkpoint file.
    pub const CPFILE: Ino = Ino(4);
    /// Segment usage file.
    pub const SUFILE: Ino = Ino(5);
    /// Inode file.
    pub const IFILE: Ino = Ino(6);
    /// First inode number handed out to regular files.
    pub const FIRST_USER: Ino = Ino(11);

    /// Creates a new inode number.
    #[must_use]
    pub const fn new(ino: u64) -> Self {
        Self(ino)
    }

    /// Returns the raw inode number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for inodes of regular user files.
    #[must_use]
    pub const fn is_regular(self) -> bool {
        self.0 >= Self::FIRST_USER.0
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{}", self.0)
    }
}

/// Segment number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SegNum(pub u64);

impl SegNum {
    /// Creates a new segment number.
    #[must_use]
    pub const fn new(segnum: u64) -> Self {
        Self(segnum)
    }

    /// Returns the raw segment number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SegNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// Checkpoint number.
///
/// Checkpoint numbers increase by one per super root and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Cno(pub u64);

impl Cno {
    /// Creates a new checkpoint number.
    #[must_use]
    pub const fn new(cno: u64) -> Self {
        Self(cno)
    }

    /// Returns the raw checkpoint number.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next checkpoint number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Cno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cno:{}", self.0)
    }
}

/// Returns true if `a` is at or after `b` in 32-bit wrap-around order.
#[must_use]
pub const fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Returns true if `a` is strictly after `b` in 32-bit wrap-around order.
#[must_use]
pub const fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Current time in seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_inodes_are_not_regular() {
        for ino in [Ino::DAT, Ino::CPFILE, Ino::SUFILE, Ino::IFILE] {
            assert!(!ino.is_regular());
        }
        assert!(Ino::FIRST_USER.is_regular());
        assert_eq!(Ino::new(12).to_string(), "ino:12");
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_ge(5, 5));
        assert!(seq_gt(6, 5));
        assert!(!seq_gt(5, 6));
        assert!(seq_gt(2, u32::MAX - 1));
        assert!(!seq_ge(u32::MAX - 1, 2));
    }

    #[test]
    fn cno_next() {
        assert_eq!(Cno::new(7).next(), Cno::new(8));
        assert_eq!(Cno::default().as_u64(), 0);
    }
}
