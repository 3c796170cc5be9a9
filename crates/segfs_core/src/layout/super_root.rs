//! Super root: the block that seals a checkpoint.

use super::{crc32, get_u32, put_u32, put_u64, ByteReader, InodeRecord, INODE_RECORD_BYTES};
use crate::error::{CoreError, CoreResult};

/// Meaningful bytes at the start of the super root block.
pub const SUPER_ROOT_BYTES: usize = 16 + 3 * INODE_RECORD_BYTES;

const DAT_OFFSET: usize = 16;
const CPFILE_OFFSET: usize = DAT_OFFSET + INODE_RECORD_BYTES;
const SUFILE_OFFSET: usize = CPFILE_OFFSET + INODE_RECORD_BYTES;

/// Roots of the three physically mapped metadata files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperRoot {
    /// Reserved flag bits.
    pub flags: u16,
    /// Last time a non-GC construction changed regular files.
    pub nongc_ctime: u64,
    /// DAT inode.
    pub dat: InodeRecord,
    /// Checkpoint file inode.
    pub cpfile: InodeRecord,
    /// Segment usage file inode.
    pub sufile: InodeRecord,
}

impl SuperRoot {
    /// Encodes a whole block; the checksum covers every byte after it.
    #[must_use]
    pub fn encode(&self, block_size: usize, seed: u32) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        block[4..6].copy_from_slice(&(SUPER_ROOT_BYTES as u16).to_le_bytes());
        block[6..8].copy_from_slice(&self.flags.to_le_bytes());
        put_u64(&mut block, 8, self.nongc_ctime);
        self.dat.encode_into(&mut block[DAT_OFFSET..]);
        self.cpfile.encode_into(&mut block[CPFILE_OFFSET..]);
        self.sufile.encode_into(&mut block[SUFILE_OFFSET..]);
        let sum = crc32(seed, &block[4..]);
        put_u32(&mut block, 0, sum);
        block
    }

    /// Decodes and verifies a super root block.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` for a damaged block and `InvalidFormat`
    /// for an unexpected size field.
    pub fn decode(block: &[u8], seed: u32) -> CoreResult<Self> {
        if block.len() < SUPER_ROOT_BYTES {
            return Err(CoreError::invalid_format("super root block is truncated"));
        }
        let expected = get_u32(block, 0);
        let actual = crc32(seed, &block[4..]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        let mut r = ByteReader::at(block, 4, "super root");
        let bytes = r.u16()?;
        if usize::from(bytes) != SUPER_ROOT_BYTES {
            return Err(CoreError::invalid_format(format!(
                "unexpected super root size {bytes}"
            )));
        }
        let flags = r.u16()?;
        let nongc_ctime = r.u64()?;
        Ok(Self {
            flags,
            nongc_ctime,
            dat: InodeRecord::decode(&block[DAT_OFFSET..])?,
            cpfile: InodeRecord::decode(&block[CPFILE_OFFSET..])?,
            sufile: InodeRecord::decode(&block[SUFILE_OFFSET..])?,
        })
    }
}
