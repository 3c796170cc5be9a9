//! In-memory partial segment: summary records and payload blocks in log order.

use crate::layout::{
    BlockInfo, FileEntry, FileInfo, SegFlags, Summary, SummaryHeader, SummaryLayout,
    BLOCK_INFO_BYTES, FILE_INFO_BYTES,
};
use crate::types::{BlockNr, Cno, Ino, VBlockNr};
use std::sync::Arc;

/// The buffer cannot take another block; open the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferFull;

/// Where the content of a payload block comes from when it is written.
///
/// Metadata blocks are read from their caches only after the assign phase,
/// because assigning addresses changes their content.
#[derive(Debug, Clone)]
pub(crate) enum BlockSource {
    /// Bytes captured when the block was collected.
    Captured(Arc<Vec<u8>>),
    /// Data block of a metadata file.
    MetaData { ino: Ino, blkoff: u64 },
    /// Map node of a metadata file.
    MetaNode { ino: Ino, idx: usize },
    /// Map node of a regular file.
    FileNode { ino: Ino, idx: usize },
}

/// One payload block and the block info describing it.
#[derive(Debug, Clone)]
pub(crate) struct PayloadBlock {
    pub(crate) ino: Ino,
    /// Block offset, or node index for node blocks.
    pub(crate) blkoff: u64,
    /// Virtual block number; 0 for blocks of physically mapped files.
    pub(crate) vblocknr: VBlockNr,
    pub(crate) node: bool,
    pub(crate) source: BlockSource,
}

/// A partial segment being filled.
///
/// Summary records are placed as blocks are appended, so the number of
/// summary blocks, and with it every payload address, is only final once
/// the buffer stops growing.
#[derive(Debug)]
pub(crate) struct SegmentBuffer {
    start: BlockNr,
    capacity: u64,
    reserve_super_root: bool,
    header: SummaryHeader,
    layout: SummaryLayout,
    files: Vec<FileEntry>,
    payload: Vec<PayloadBlock>,
    super_root: Option<Vec<u8>>,
}

impl SegmentBuffer {
    /// Opens a partial segment at `start` with `capacity` blocks available.
    pub(crate) fn begin(
        start: BlockNr,
        capacity: u64,
        header: SummaryHeader,
        block_size: usize,
        reserve_super_root: bool,
    ) -> Self {
        Self {
            start,
            capacity,
            reserve_super_root,
            header,
            layout: SummaryLayout::new(block_size),
            files: Vec::new(),
            payload: Vec::new(),
            super_root: None,
        }
    }

    pub(crate) fn start(&self) -> BlockNr {
        self.start
    }

    pub(crate) fn seq(&self) -> u64 {
        self.header.seq
    }

    pub(crate) fn cno(&self) -> Cno {
        self.header.cno
    }

    pub(crate) fn flags(&self) -> SegFlags {
        self.header.flags
    }

    /// Sequence numbers are handed out when the chain is closed, so a
    /// buffer dropped while empty leaves no gap.
    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.header.seq = seq;
    }

    pub(crate) fn add_flags(&mut self, flags: SegFlags) {
        self.header.flags.insert(flags);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub(crate) fn payload(&self) -> &[PayloadBlock] {
        &self.payload
    }

    pub(crate) fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub(crate) fn nsumblk(&self) -> u64 {
        self.layout.blocks()
    }

    /// Blocks the partial segment occupies on disk.
    pub(crate) fn nblocks(&self) -> u64 {
        self.nsumblk() + self.payload.len() as u64 + u64::from(self.super_root.is_some())
    }

    /// One past the last block of the partial segment.
    pub(crate) fn end(&self) -> BlockNr {
        self.start + self.nblocks()
    }

    /// Disk address of payload block `index`.
    pub(crate) fn address_of(&self, index: usize) -> BlockNr {
        self.start + self.nsumblk() + index as u64
    }

    /// Disk address the super root block occupies.
    #[cfg(test)]
    pub(crate) fn super_root_address(&self) -> BlockNr {
        self.address_of(self.payload.len())
    }

    /// Appends a block to the file info of `block.ino`.
    ///
    /// A file info holds data blocks before node blocks, so a data block
    /// that follows a node block of the same file opens a new file info.
    pub(crate) fn append(&mut self, block: PayloadBlock, size: u64) -> Result<usize, BufferFull> {
        let extend = self.files.last().is_some_and(|entry| {
            entry.info.ino == block.ino && (block.node || entry.info.ndatablk == entry.info.nblocks)
        });
        let mut layout = self.layout;
        if !extend {
            layout.place(FILE_INFO_BYTES);
        }
        layout.place(BLOCK_INFO_BYTES);
        let needed = layout.blocks()
            + self.payload.len() as u64
            + 1
            + u64::from(self.reserve_super_root);
        if needed > self.capacity {
            return Err(BufferFull);
        }
        self.layout = layout;
        if !extend {
            self.files.push(FileEntry {
                info: FileInfo {
                    ino: block.ino,
                    cno: self.header.cno,
                    nblocks: 0,
                    ndatablk: 0,
                    size,
                },
                blocks: Vec::new(),
            });
        }
        if let Some(entry) = self.files.last_mut() {
            entry.info.nblocks += 1;
            if !block.node {
                entry.info.ndatablk += 1;
            }
            entry.info.size = entry.info.size.max(size);
            entry.blocks.push(BlockInfo {
                blkoff: block.blkoff,
                vblocknr: block.vblocknr,
            });
        }
        self.payload.push(block);
        Ok(self.payload.len() - 1)
    }

    /// Makes `block` the last block of the partial segment and marks it as
    /// closing a checkpoint.
    pub(crate) fn finalize_super_root(&mut self, block: Vec<u8>) {
        self.super_root = Some(block);
        self.header.flags.insert(SegFlags::SR);
    }

    pub(crate) fn super_root(&self) -> Option<&[u8]> {
        self.super_root.as_deref()
    }

    /// The summary as it will be written.
    pub(crate) fn summary(&self) -> Summary {
        let mut header = self.header;
        header.nblocks = self.nblocks() as u32;
        Summary {
            header,
            files: self.files.clone(),
        }
    }
}
