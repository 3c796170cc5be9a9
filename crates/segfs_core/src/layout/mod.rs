//! On-disk format.
//!
//! Everything that is written to the device is defined here: the two
//! superblocks, the partial-segment summary, the super root and the inode
//! record shared by the ifile, the cpfile and the super root. All integers
//! are little-endian.

mod checksum;
mod inode;
mod summary;
mod super_root;
mod superblock;

pub use checksum::crc32;
pub use inode::{InodeRecord, INODE_ALLOCATED, INODE_RECORD_BYTES, NROOTS};
pub use summary::{
    seal, verify_datasum, verify_sumsum, BlockInfo, FileEntry, FileInfo, SegFlags, Summary,
    SummaryHeader, SummaryLayout, BLOCK_INFO_BYTES, FILE_INFO_BYTES, SS_MAGIC,
    SUMMARY_HEADER_BYTES,
};
pub use super_root::{SuperRoot, SUPER_ROOT_BYTES};
pub use superblock::{SuperBlock, SB_BYTES, SB_MAGIC, SB_STATE_CLEAN, SB_STATE_ERROR, SB_VERSION};

use crate::error::{CoreError, CoreResult};
use crate::types::{BlockNr, SegNum};

/// A partial segment is never started with fewer free blocks than this left
/// in its segment.
pub const PSEG_MIN_BLOCKS: u64 = 2;

/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 1024;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Smallest supported segment, in blocks.
pub const MIN_BLOCKS_PER_SEGMENT: u32 = 8;

/// Smallest supported number of segments.
pub const MIN_SEGMENTS: u64 = 4;

/// Device geometry derived from the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: u32,
    blocks_per_segment: u32,
    nsegments: u64,
}

impl Geometry {
    /// Block 0 holds the primary superblock, so segment 0 starts here.
    pub const FIRST_DATA_BLOCK: BlockNr = 1;

    /// Validates and builds a geometry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for unsupported sizes.
    pub fn new(block_size: u32, blocks_per_segment: u32, nsegments: u64) -> CoreResult<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(CoreError::invalid_format(format!(
                "unsupported block size {block_size}"
            )));
        }
        if blocks_per_segment < MIN_BLOCKS_PER_SEGMENT {
            return Err(CoreError::invalid_format(format!(
                "segments of {blocks_per_segment} blocks are too small"
            )));
        }
        if nsegments < MIN_SEGMENTS {
            return Err(CoreError::invalid_format(format!(
                "{nsegments} segments is below the minimum of {MIN_SEGMENTS}"
            )));
        }
        Ok(Self {
            block_size,
            blocks_per_segment,
            nsegments,
        })
    }

    /// Fits as many whole segments as possible into `device_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the device is too small.
    pub fn for_device(block_size: u32, blocks_per_segment: u32, device_size: u64) -> CoreResult<Self> {
        let blocks = device_size / u64::from(block_size.max(1));
        // The secondary superblock takes the block after the last segment.
        let nsegments = blocks.saturating_sub(1) / u64::from(blocks_per_segment.max(1));
        Self::new(block_size, blocks_per_segment, nsegments)
    }

    /// Block size in bytes.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Block size as a `usize`.
    #[must_use]
    pub const fn block_bytes(&self) -> usize {
        self.block_size as usize
    }

    /// Blocks per segment.
    #[must_use]
    pub const fn blocks_per_segment(&self) -> u32 {
        self.blocks_per_segment
    }

    /// Number of segments.
    #[must_use]
    pub const fn nsegments(&self) -> u64 {
        self.nsegments
    }

    /// Total number of blocks on the device, superblocks included.
    #[must_use]
    pub const fn device_blocks(&self) -> u64 {
        self.nsegments * self.blocks_per_segment as u64 + 1
    }

    /// Device size in bytes.
    #[must_use]
    pub const fn device_bytes(&self) -> u64 {
        self.device_blocks() * self.block_size as u64
    }

    /// First usable block of `segnum`.
    #[must_use]
    pub fn seg_start(&self, segnum: SegNum) -> BlockNr {
        (segnum.0 * u64::from(self.blocks_per_segment)).max(Self::FIRST_DATA_BLOCK)
    }

    /// One past the last block of `segnum`.
    #[must_use]
    pub fn seg_end(&self, segnum: SegNum) -> BlockNr {
        (segnum.0 + 1) * u64::from(self.blocks_per_segment)
    }

    /// Segment containing `blocknr`.
    #[must_use]
    pub fn segnum_of(&self, blocknr: BlockNr) -> SegNum {
        SegNum(blocknr / u64::from(self.blocks_per_segment))
    }

    /// Returns true if `blocknr` lies inside some segment.
    #[must_use]
    pub fn is_data_block(&self, blocknr: BlockNr) -> bool {
        blocknr >= Self::FIRST_DATA_BLOCK
            && blocknr < self.nsegments * u64::from(self.blocks_per_segment)
    }

    /// Byte offset of `blocknr`.
    #[must_use]
    pub fn byte_offset(&self, blocknr: BlockNr) -> u64 {
        blocknr * u64::from(self.block_size)
    }

    /// Block pointers per map node block.
    #[must_use]
    pub const fn pointers_per_node(&self) -> u64 {
        self.block_size as u64 / 8
    }

    /// Largest block offset a file can map, plus one.
    #[must_use]
    pub const fn max_file_blocks(&self) -> u64 {
        NROOTS as u64 * self.pointers_per_node()
    }

    /// Number of blocks needed to hold `bytes` bytes.
    #[must_use]
    pub fn blocks_for(&self, bytes: usize) -> u64 {
        bytes.div_ceil(self.block_bytes()) as u64
    }
}

/// Cursor over a little-endian byte buffer.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    pub(crate) fn at(buf: &'a [u8], pos: usize, what: &'static str) -> Self {
        Self { buf, pos, what }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let bytes = &self.buf[self.pos..end];
                self.pos = end;
                Ok(bytes)
            }
            None => Err(CoreError::invalid_format(format!(
                "unexpected end of {} at byte {}",
                self.what, self.pos
            ))),
        }
    }

    pub(crate) fn skip(&mut self, len: usize) -> CoreResult<()> {
        self.take(len).map(|_| ())
    }

    pub(crate) fn bytes<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }
}

/// Writes `value` at `offset` of `buf`.
pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Writes `value` at `offset` of `buf`.
pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Reads a `u64` at `offset`, treating short buffers as zero.
pub(crate) fn get_u64(buf: &[u8], offset: usize) -> u64 {
    buf.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Reads a `u32` at `offset`, treating short buffers as zero.
pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_segment_ranges() {
        let geo = Geometry::new(1024, 16, 8).unwrap();
        assert_eq!(geo.seg_start(SegNum(0)), 1);
        assert_eq!(geo.seg_end(SegNum(0)), 16);
        assert_eq!(geo.seg_start(SegNum(3)), 48);
        assert_eq!(geo.seg_end(SegNum(3)), 64);
        assert_eq!(geo.segnum_of(63), SegNum(3));
        assert_eq!(geo.device_blocks(), 129);
        assert!(geo.is_data_block(127));
        assert!(!geo.is_data_block(128));
        assert!(!geo.is_data_block(0));
    }

    #[test]
    fn geometry_rejects_bad_sizes() {
        assert!(Geometry::new(1000, 16, 8).is_err());
        assert!(Geometry::new(512, 16, 8).is_err());
        assert!(Geometry::new(4096, 4, 8).is_err());
        assert!(Geometry::new(4096, 16, 2).is_err());
    }

    #[test]
    fn geometry_for_device_leaves_room_for_superblocks() {
        let geo = Geometry::for_device(1024, 16, 1024 * (16 * 5 + 2)).unwrap();
        assert_eq!(geo.nsegments(), 5);
        assert!(geo.device_bytes() <= 1024 * (16 * 5 + 2));
    }

    #[test]
    fn byte_reader_reports_truncation() {
        let buf = [1u8, 0, 0, 0, 2];
        let mut reader = ByteReader::new(&buf, "test record");
        assert_eq!(reader.u32().unwrap(), 1);
        let err = reader.u32().unwrap_err();
        assert!(err.to_string().contains("test record"));
    }
}
