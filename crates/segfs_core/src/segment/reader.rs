//! Reads and verifies partial segments already on disk.

use crate::device::BlockDevice;
use crate::error::{CoreError, CoreResult};
use crate::layout::{
    verify_datasum, verify_sumsum, BlockInfo, FileInfo, SegFlags, Summary, SummaryHeader,
    SuperRoot, PSEG_MIN_BLOCKS,
};
use crate::types::{BlockNr, SegNum};

/// A partial segment read back from the device and verified.
#[derive(Debug, Clone)]
pub struct PartialSegment {
    start: BlockNr,
    block_size: usize,
    nsumblk: u64,
    summary: Summary,
    image: Vec<u8>,
}

/// One payload block of a partial segment with the records describing it.
#[derive(Debug, Clone, Copy)]
pub struct LoggedBlock<'a> {
    /// The file info the block belongs to.
    pub info: &'a FileInfo,
    /// The block info of the block.
    pub binfo: &'a BlockInfo,
    /// True for map node blocks.
    pub node: bool,
    /// Where the block sits on disk.
    pub blocknr: BlockNr,
    /// The block content.
    pub data: &'a [u8],
}

impl PartialSegment {
    /// First block of the partial segment.
    #[must_use]
    pub fn start(&self) -> BlockNr {
        self.start
    }

    /// One past its last block.
    #[must_use]
    pub fn end(&self) -> BlockNr {
        self.start + u64::from(self.summary.header.nblocks)
    }

    /// The summary header.
    #[must_use]
    pub fn header(&self) -> &SummaryHeader {
        &self.summary.header
    }

    /// The decoded summary.
    #[must_use]
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Returns true if the partial segment carries `flags`.
    #[must_use]
    pub fn has(&self, flags: SegFlags) -> bool {
        self.summary.header.flags.contains(flags)
    }

    /// Content of payload block `index`.
    #[must_use]
    pub fn payload_block(&self, index: usize) -> &[u8] {
        let at = (self.nsumblk as usize + index) * self.block_size;
        &self.image[at..at + self.block_size]
    }

    /// Every payload block in log order.
    pub fn blocks(&self) -> impl Iterator<Item = LoggedBlock<'_>> {
        let mut index = 0usize;
        self.summary.files.iter().flat_map(move |entry| {
            let ndata = entry.info.ndatablk as usize;
            let first = index;
            index += entry.blocks.len();
            entry.blocks.iter().enumerate().map(move |(i, binfo)| LoggedBlock {
                info: &entry.info,
                binfo,
                node: i >= ndata,
                blocknr: self.start + self.nsumblk + (first + i) as u64,
                data: self.payload_block(first + i),
            })
        })
    }

    /// Address of the super root block, if the partial segment has one.
    #[must_use]
    pub fn super_root_block(&self) -> Option<BlockNr> {
        self.has(SegFlags::SR).then(|| self.end() - 1)
    }

    /// Decodes the super root.
    ///
    /// # Errors
    ///
    /// Returns `CorruptSuperRoot` if the partial segment has none or it does
    /// not validate.
    pub fn super_root(&self, seed: u32) -> CoreResult<SuperRoot> {
        if !self.has(SegFlags::SR) {
            return Err(CoreError::corrupt_super_root(format!(
                "partial segment at {} has no super root",
                self.start
            )));
        }
        let at = self.image.len() - self.block_size;
        SuperRoot::decode(&self.image[at..], seed).map_err(|e| {
            CoreError::corrupt_super_root(format!("super root at {}: {e}", self.end() - 1))
        })
    }
}

/// Reads partial segments from the device.
pub struct LogReader<'a> {
    device: &'a BlockDevice,
    seed: u32,
}

impl<'a> LogReader<'a> {
    /// Creates a reader verifying checksums with `seed`.
    #[must_use]
    pub fn new(device: &'a BlockDevice, seed: u32) -> Self {
        Self { device, seed }
    }

    /// Reads and verifies the partial segment starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if no summary starts there or it does not fit
    /// its segment, and `ChecksumMismatch` if any byte is damaged.
    pub fn read(&self, start: BlockNr) -> CoreResult<PartialSegment> {
        let geometry = *self.device.geometry();
        let bs = geometry.block_bytes();
        if !geometry.is_data_block(start) {
            return Err(CoreError::invalid_format(format!(
                "block {start} is outside every segment"
            )));
        }
        let first = self.device.read_block(start)?;
        let header = SummaryHeader::decode(&first)?;
        let nblocks = u64::from(header.nblocks);
        let nsumblk = header.nsumblk(bs);
        let seg_end = geometry.seg_end(geometry.segnum_of(start));
        if nsumblk == 0 || nblocks < nsumblk || start + nblocks > seg_end {
            return Err(CoreError::invalid_format(format!(
                "partial segment at {start} claims {nblocks} blocks"
            )));
        }
        let image = self.device.read_blocks(start, nblocks)?;
        verify_sumsum(&image, header.sumbytes as usize, self.seed)?;
        let summary = Summary::decode(&image, bs)?;
        let expected = nsumblk + summary.payload_blocks() + u64::from(header.flags.contains(SegFlags::SR));
        if expected != nblocks {
            return Err(CoreError::invalid_format(format!(
                "partial segment at {start} describes {expected} blocks but has {nblocks}"
            )));
        }
        verify_datasum(&image, self.seed)?;
        Ok(PartialSegment {
            start,
            block_size: bs,
            nsumblk,
            summary,
            image,
        })
    }

    /// Where the partial segment following `pseg` starts if the writer kept
    /// to the same segment.
    #[must_use]
    pub fn follow_on(&self, pseg: &PartialSegment) -> Option<BlockNr> {
        let geometry = self.device.geometry();
        let seg_end = geometry.seg_end(geometry.segnum_of(pseg.start()));
        (seg_end.saturating_sub(pseg.end()) >= PSEG_MIN_BLOCKS).then(|| pseg.end())
    }

    /// Valid partial segments at the start of `segnum`, in log order.
    ///
    /// Stops at the first block that does not start a valid partial
    /// segment or whose sequence number does not follow its predecessor.
    #[must_use]
    pub fn segment(&self, segnum: SegNum) -> Vec<PartialSegment> {
        let mut out: Vec<PartialSegment> = Vec::new();
        let mut at = Some(self.device.geometry().seg_start(segnum));
        while let Some(start) = at {
            let Ok(pseg) = self.read(start) else { break };
            if out
                .last()
                .is_some_and(|prev| prev.header().seq + 1 != pseg.header().seq)
            {
                break;
            }
            at = self.follow_on(&pseg);
            out.push(pseg);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{seal, BlockInfo, FileEntry, FileInfo, Geometry};
    use crate::types::{Cno, Ino};
    use segfs_storage::InMemoryBackend;

    const SEED: u32 = 0x1234;

    fn device() -> (BlockDevice, InMemoryBackend) {
        let geo = Geometry::new(1024, 16, 4).unwrap();
        let backend = InMemoryBackend::with_size(geo.device_bytes() as usize);
        (BlockDevice::new(Box::new(backend.share()), geo), backend)
    }

    fn write_pseg(device: &BlockDevice, start: BlockNr, seq: u64, nfiles: u64) -> u64 {
        let files: Vec<FileEntry> = (0..nfiles)
            .map(|i| FileEntry {
                info: FileInfo {
                    ino: Ino::new(11 + i),
                    cno: Cno::new(1),
                    nblocks: 1,
                    ndatablk: 1,
                    size: 1024,
                },
                blocks: vec![BlockInfo {
                    blkoff: 0,
                    vblocknr: i + 1,
                }],
            })
            .collect();
        let summary = Summary {
            header: SummaryHeader {
                seq,
                nblocks: (1 + nfiles) as u32,
                flags: SegFlags::LOGBGN.union(SegFlags::LOGEND),
                ..SummaryHeader::default()
            },
            files,
        };
        let mut image = summary.encode(1024);
        let sumbytes = Summary::layout(&summary.files, 1024).bytes();
        for i in 0..nfiles {
            image.extend(vec![i as u8 + 1; 1024]);
        }
        seal(&mut image, sumbytes, SEED);
        device.write_blocks(start, &image).unwrap();
        1 + nfiles
    }

    #[test]
    fn blocks_iterate_in_log_order() {
        let (device, _) = device();
        write_pseg(&device, 1, 5, 3);
        let pseg = LogReader::new(&device, SEED).read(1).unwrap();
        let blocks: Vec<_> = pseg.blocks().map(|b| (b.info.ino.as_u64(), b.blocknr, b.data[0])).collect();
        assert_eq!(blocks, vec![(11, 2, 1), (12, 3, 2), (13, 4, 3)]);
        assert!(pseg.super_root_block().is_none());
        assert!(pseg.super_root(SEED).is_err());
    }

    #[test]
    fn any_flipped_byte_fails_validation() {
        let (device, backend) = device();
        write_pseg(&device, 1, 5, 2);
        for offset in [0usize, 9, 100, 1500, 3000] {
            backend.flip_byte(1024 + offset);
            assert!(LogReader::new(&device, SEED).read(1).is_err(), "offset {offset}");
            backend.flip_byte(1024 + offset);
        }
        assert!(LogReader::new(&device, SEED).read(1).is_ok());
    }

    #[test]
    fn wrong_seed_fails_validation() {
        let (device, _) = device();
        write_pseg(&device, 1, 5, 1);
        assert!(matches!(
            LogReader::new(&device, SEED + 1).read(1),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn segment_walk_stops_at_sequence_gap() {
        let (device, _) = device();
        let mut at = 1;
        at += write_pseg(&device, at, 10, 2);
        at += write_pseg(&device, at, 11, 1);
        write_pseg(&device, at, 3, 1);
        let psegs = LogReader::new(&device, SEED).segment(SegNum(0));
        assert_eq!(psegs.len(), 2);
        assert_eq!(psegs[1].header().seq, 11);
    }

    #[test]
    fn follow_on_respects_minimum_size() {
        let (device, _) = device();
        // Blocks 1..15 leave exactly one block in segment 0.
        write_pseg(&device, 1, 1, 14);
        let reader = LogReader::new(&device, SEED);
        let pseg = reader.read(1).unwrap();
        assert_eq!(pseg.end(), 16);
        assert_eq!(reader.follow_on(&pseg), None);
    }
}
