//! Superblock: geometry plus a pointer to the latest super root.
//!
//! Two copies exist, one at the start of block 0 and one in the last
//! `SB_BYTES` of the device. They are rewritten alternately, so a torn
//! superblock write always leaves the other copy intact.

use super::{crc32, ByteReader, Geometry};
use crate::error::{CoreError, CoreResult};
use crate::types::{BlockNr, Cno};

/// Magic bytes identifying a segfs superblock.
pub const SB_MAGIC: [u8; 4] = *b"SGFS";

/// Current format version.
pub const SB_VERSION: u16 = 1;

/// Bytes occupied by an encoded superblock.
pub const SB_BYTES: usize = 128;

/// The filesystem was unmounted cleanly.
pub const SB_STATE_CLEAN: u16 = 0x1;

/// A write failure degraded the filesystem.
pub const SB_STATE_ERROR: u16 = 0x2;

const CRC_OFFSET: usize = SB_BYTES - 4;

/// Decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// State bits (`SB_STATE_*`).
    pub state: u16,
    /// Block size in bytes.
    pub block_size: u32,
    /// Blocks per segment.
    pub blocks_per_segment: u32,
    /// Number of segments.
    pub nsegments: u64,
    /// Checksum seed.
    pub crc_seed: u32,
    /// Segments held back for the cleaner, in percent.
    pub reserved_segments_percent: u32,
    /// First block of the partial segment holding the latest known super root.
    pub last_pseg: BlockNr,
    /// Sequence number of that partial segment.
    pub last_seq: u64,
    /// Checkpoint number of that super root.
    pub last_cno: Cno,
    /// Time of the last superblock write.
    pub wtime: u64,
    /// Number of superblock writes; the higher copy wins.
    pub generation: u64,
}

impl SuperBlock {
    /// Geometry described by this superblock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the geometry is unsupported.
    pub fn geometry(&self) -> CoreResult<Geometry> {
        Geometry::new(self.block_size, self.blocks_per_segment, self.nsegments)
    }

    /// Encodes the superblock, checksum included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SB_BYTES);
        buf.extend_from_slice(&SB_MAGIC);
        buf.extend_from_slice(&SB_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.state.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.blocks_per_segment.to_le_bytes());
        buf.extend_from_slice(&self.nsegments.to_le_bytes());
        buf.extend_from_slice(&Geometry::FIRST_DATA_BLOCK.to_le_bytes());
        buf.extend_from_slice(&self.crc_seed.to_le_bytes());
        buf.extend_from_slice(&self.reserved_segments_percent.to_le_bytes());
        buf.extend_from_slice(&self.last_pseg.to_le_bytes());
        buf.extend_from_slice(&self.last_seq.to_le_bytes());
        buf.extend_from_slice(&self.last_cno.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.wtime.to_le_bytes());
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.resize(SB_BYTES, 0);
        // The superblock is not bound to a filesystem seed yet when read.
        let crc = crc32(0, &buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates a superblock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a bad magic or version and
    /// `ChecksumMismatch` for a damaged copy.
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < SB_BYTES {
            return Err(CoreError::invalid_format("superblock is truncated"));
        }
        let mut r = ByteReader::new(&buf[..SB_BYTES], "superblock");
        if r.bytes::<4>()? != SB_MAGIC {
            return Err(CoreError::invalid_format("bad superblock magic"));
        }
        let stored = u32::from_le_bytes([
            buf[CRC_OFFSET],
            buf[CRC_OFFSET + 1],
            buf[CRC_OFFSET + 2],
            buf[CRC_OFFSET + 3],
        ]);
        let actual = crc32(0, &buf[..CRC_OFFSET]);
        if stored != actual {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        let version = r.u16()?;
        if version != SB_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported superblock version {version}"
            )));
        }
        let state = r.u16()?;
        let block_size = r.u32()?;
        let blocks_per_segment = r.u32()?;
        let nsegments = r.u64()?;
        let first_data_block = r.u64()?;
        if first_data_block != Geometry::FIRST_DATA_BLOCK {
            return Err(CoreError::invalid_format(format!(
                "unexpected first data block {first_data_block}"
            )));
        }
        Ok(Self {
            state,
            block_size,
            blocks_per_segment,
            nsegments,
            crc_seed: r.u32()?,
            reserved_segments_percent: r.u32()?,
            last_pseg: r.u64()?,
            last_seq: r.u64()?,
            last_cno: Cno::new(r.u64()?),
            wtime: r.u64()?,
            generation: r.u64()?,
        })
    }

    /// Byte offsets of the primary and secondary copies on a device of
    /// `device_bytes` bytes.
    #[must_use]
    pub fn locations(device_bytes: u64) -> [u64; 2] {
        [0, device_bytes.saturating_sub(SB_BYTES as u64)]
    }

    /// Marks the state bits, preserving the others.
    pub fn set_state(&mut self, bits: u16, on: bool) {
        if on {
            self.state |= bits;
        } else {
            self.state &= !bits;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        SuperBlock {
            state: SB_STATE_CLEAN,
            block_size: 4096,
            blocks_per_segment: 64,
            nsegments: 10,
            crc_seed: 7,
            reserved_segments_percent: 5,
            last_pseg: 65,
            last_seq: 12,
            last_cno: Cno::new(4),
            wtime: 1_700_000_000,
            generation: 3,
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample();
        let buf = sb.encode();
        assert_eq!(buf.len(), SB_BYTES);
        assert_eq!(SuperBlock::decode(&buf).unwrap(), sb);
        assert_eq!(sb.geometry().unwrap().nsegments(), 10);
    }

    #[test]
    fn superblock_detects_damage() {
        let mut buf = sample().encode();
        buf[40] ^= 1;
        assert!(matches!(
            SuperBlock::decode(&buf),
            Err(CoreError::ChecksumMismatch { .. })
        ));

        let mut buf = sample().encode();
        buf[0] = b'X';
        assert!(matches!(
            SuperBlock::decode(&buf),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn state_bits() {
        let mut sb = sample();
        sb.set_state(SB_STATE_CLEAN, false);
        assert_eq!(sb.state & SB_STATE_CLEAN, 0);
        sb.set_state(SB_STATE_ERROR, true);
        assert_eq!(sb.state, SB_STATE_ERROR);
    }

    #[test]
    fn secondary_copy_sits_at_device_end() {
        let [primary, secondary] = SuperBlock::locations(1 << 20);
        assert_eq!(primary, 0);
        assert_eq!(secondary, (1 << 20) - SB_BYTES as u64);
    }
}
