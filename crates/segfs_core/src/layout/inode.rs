//! The 128-byte inode record.

use super::{put_u32, put_u64, ByteReader};
use crate::error::CoreResult;

/// Size of an encoded inode record.
pub const INODE_RECORD_BYTES: usize = 128;

/// Root pointers per inode.
pub const NROOTS: usize = 12;

/// The record describes a live inode.
pub const INODE_ALLOCATED: u32 = 0x1;

/// Persistent inode: size, block count and the roots of its block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeRecord {
    /// Flag bits (`INODE_ALLOCATED`).
    pub flags: u32,
    /// File size in bytes.
    pub size: u64,
    /// Number of mapped data blocks.
    pub nblocks: u64,
    /// Last modification time (Unix seconds).
    pub mtime: u64,
    /// Root pointers; pointer `i` addresses map node block `i`.
    pub roots: [u64; NROOTS],
}

impl InodeRecord {
    /// A freshly allocated, empty inode.
    #[must_use]
    pub fn allocated(mtime: u64) -> Self {
        Self {
            flags: INODE_ALLOCATED,
            mtime,
            ..Self::default()
        }
    }

    /// Returns true if the record holds a live inode.
    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.flags & INODE_ALLOCATED != 0
    }

    /// Encodes into `buf[..INODE_RECORD_BYTES]`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.flags);
        put_u32(buf, 4, 0);
        put_u64(buf, 8, self.size);
        put_u64(buf, 16, self.nblocks);
        put_u64(buf, 24, self.mtime);
        for (i, root) in self.roots.iter().enumerate() {
            put_u64(buf, 32 + i * 8, *root);
        }
    }

    /// Decodes from the first `INODE_RECORD_BYTES` of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if `buf` is too short.
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(buf, "inode record");
        let flags = r.u32()?;
        r.skip(4)?;
        let size = r.u64()?;
        let nblocks = r.u64()?;
        let mtime = r.u64()?;
        let mut roots = [0u64; NROOTS];
        for root in &mut roots {
            *root = r.u64()?;
        }
        Ok(Self {
            flags,
            size,
            nblocks,
            mtime,
            roots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_fixed() {
        let mut rec = InodeRecord::allocated(99);
        rec.size = 5000;
        rec.roots[11] = 0xabcd;
        let mut buf = [0u8; INODE_RECORD_BYTES];
        rec.encode_into(&mut buf);
        assert_eq!(&buf[120..128], &0xabcdu64.to_le_bytes());
        assert_eq!(InodeRecord::decode(&buf).unwrap(), rec);
        assert!(InodeRecord::decode(&buf[..100]).is_err());
    }

    #[test]
    fn zeroed_record_is_free() {
        let rec = InodeRecord::decode(&[0u8; INODE_RECORD_BYTES]).unwrap();
        assert!(!rec.is_allocated());
    }
}
