//! Partial-segment summary: header, file infos and block infos.
//!
//! A partial segment starts with its summary. The header is followed by one
//! file info per file with blocks in the partial segment, each followed by a
//! block info per block, data blocks first. Records never straddle a block
//! boundary; the unused tail of a summary block is zero padding. Payload
//! blocks follow the summary in exactly the order of their block infos.

use super::{crc32, get_u32, put_u32, put_u64, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::types::{BlockNr, Cno, Ino, VBlockNr};
use std::fmt;

/// Magic number of a summary header.
pub const SS_MAGIC: u32 = 0x5347_5353;

/// Size of the summary header.
pub const SUMMARY_HEADER_BYTES: usize = 64;

/// Size of a file info record.
pub const FILE_INFO_BYTES: usize = 32;

/// Size of a block info record.
pub const BLOCK_INFO_BYTES: usize = 16;

/// Partial-segment flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SegFlags(u16);

impl SegFlags {
    /// First partial segment of a logical segment.
    pub const LOGBGN: Self = Self(0x1);
    /// Last partial segment of a logical segment.
    pub const LOGEND: Self = Self(0x2);
    /// The last block is a super root.
    pub const SR: Self = Self(0x4);
    /// Data written by a dsync request.
    pub const SYNDT: Self = Self(0x8);
    /// Contains blocks relocated by the cleaner.
    pub const GC: Self = Self(0x10);

    /// No flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for SegFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::LOGBGN, "LOGBGN"),
            (Self::LOGEND, "LOGEND"),
            (Self::SR, "SR"),
            (Self::SYNDT, "SYNDT"),
            (Self::GC, "GC"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", if set.is_empty() { "-".to_string() } else { set.join("|") })
    }
}

/// Fixed header at the start of every partial segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SummaryHeader {
    /// CRC of the whole partial segment after this field.
    pub datasum: u32,
    /// CRC of the summary bytes after this field.
    pub sumsum: u32,
    /// Flag bits.
    pub flags: SegFlags,
    /// Log sequence number; one per partial segment.
    pub seq: u64,
    /// Creation time (Unix seconds).
    pub create: u64,
    /// First block of the segment the log continues in.
    pub next: BlockNr,
    /// Blocks in the partial segment, summary and super root included.
    pub nblocks: u32,
    /// Number of file infos.
    pub nfinfo: u32,
    /// Bytes of summary, header and padding included.
    pub sumbytes: u32,
    /// Checkpoint number the log belongs to.
    pub cno: Cno,
}

impl SummaryHeader {
    fn encode_into(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.datasum);
        put_u32(buf, 4, self.sumsum);
        put_u32(buf, 8, SS_MAGIC);
        buf[12..14].copy_from_slice(&(SUMMARY_HEADER_BYTES as u16).to_le_bytes());
        buf[14..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        put_u64(buf, 16, self.seq);
        put_u64(buf, 24, self.create);
        put_u64(buf, 32, self.next);
        put_u32(buf, 40, self.nblocks);
        put_u32(buf, 44, self.nfinfo);
        put_u32(buf, 48, self.sumbytes);
        put_u32(buf, 52, 0);
        put_u64(buf, 56, self.cno.as_u64());
    }

    /// Decodes a header, checking its magic and size fields only.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if `buf` does not start with a summary header.
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(buf, "summary header");
        let datasum = r.u32()?;
        let sumsum = r.u32()?;
        let magic = r.u32()?;
        if magic != SS_MAGIC {
            return Err(CoreError::invalid_format(format!(
                "bad summary magic {magic:08x}"
            )));
        }
        let bytes = r.u16()?;
        if usize::from(bytes) != SUMMARY_HEADER_BYTES {
            return Err(CoreError::invalid_format(format!(
                "unexpected summary header size {bytes}"
            )));
        }
        let flags = SegFlags::from_bits(r.u16()?);
        let seq = r.u64()?;
        let create = r.u64()?;
        let next = r.u64()?;
        let nblocks = r.u32()?;
        let nfinfo = r.u32()?;
        let sumbytes = r.u32()?;
        r.skip(4)?;
        let cno = Cno::new(r.u64()?);
        Ok(Self {
            datasum,
            sumsum,
            flags,
            seq,
            create,
            next,
            nblocks,
            nfinfo,
            sumbytes,
            cno,
        })
    }

    /// Number of summary blocks.
    #[must_use]
    pub fn nsumblk(&self, block_size: usize) -> u64 {
        (self.sumbytes as usize).div_ceil(block_size) as u64
    }
}

/// Per-file record in the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    /// Owning inode.
    pub ino: Ino,
    /// Checkpoint number the blocks belong to.
    pub cno: Cno,
    /// Block infos following this record.
    pub nblocks: u32,
    /// How many of them are data blocks.
    pub ndatablk: u32,
    /// File size when the blocks were collected.
    pub size: u64,
}

/// Per-block record in the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block offset for data blocks, node index for node blocks.
    pub blkoff: u64,
    /// Virtual block number, 0 for blocks of physically mapped files.
    pub vblocknr: VBlockNr,
}

/// A file info with its block infos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// The file info.
    pub info: FileInfo,
    /// Block infos, data blocks first.
    pub blocks: Vec<BlockInfo>,
}

impl FileEntry {
    /// Data block infos.
    #[must_use]
    pub fn data_blocks(&self) -> &[BlockInfo] {
        &self.blocks[..self.info.ndatablk as usize]
    }

    /// Node block infos.
    #[must_use]
    pub fn node_blocks(&self) -> &[BlockInfo] {
        &self.blocks[self.info.ndatablk as usize..]
    }
}

/// Places summary records so none straddles a block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryLayout {
    block_size: usize,
    offset: usize,
}

impl SummaryLayout {
    /// A layout holding only the header.
    #[must_use]
    pub const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            offset: SUMMARY_HEADER_BYTES,
        }
    }

    /// Reserves `size` bytes and returns where they start.
    pub fn place(&mut self, size: usize) -> usize {
        let within = self.offset % self.block_size;
        if within + size > self.block_size {
            self.offset += self.block_size - within;
        }
        let at = self.offset;
        self.offset += size;
        at
    }

    /// Bytes used so far.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.offset
    }

    /// Summary blocks needed so far.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.offset.div_ceil(self.block_size) as u64
    }
}

/// A complete decoded summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// The header.
    pub header: SummaryHeader,
    /// File infos in log order.
    pub files: Vec<FileEntry>,
}

impl Summary {
    /// Computes the layout of these records.
    #[must_use]
    pub fn layout(files: &[FileEntry], block_size: usize) -> SummaryLayout {
        let mut layout = SummaryLayout::new(block_size);
        for file in files {
            layout.place(FILE_INFO_BYTES);
            for _ in &file.blocks {
                layout.place(BLOCK_INFO_BYTES);
            }
        }
        layout
    }

    /// Payload blocks described by the file infos.
    #[must_use]
    pub fn payload_blocks(&self) -> u64 {
        self.files.iter().map(|f| u64::from(f.info.nblocks)).sum()
    }

    /// Encodes the summary into whole blocks.
    ///
    /// `nfinfo` and `sumbytes` are derived from the records; the checksum
    /// fields are written as stored and filled later by [`seal`].
    #[must_use]
    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let mut layout = Self::layout(&self.files, block_size);
        let mut buf = vec![0u8; layout.blocks() as usize * block_size];
        let mut header = self.header;
        header.nfinfo = self.files.len() as u32;
        header.sumbytes = layout.bytes() as u32;
        header.encode_into(&mut buf);

        layout = SummaryLayout::new(block_size);
        for file in &self.files {
            let at = layout.place(FILE_INFO_BYTES);
            put_u64(&mut buf, at, file.info.ino.as_u64());
            put_u64(&mut buf, at + 8, file.info.cno.as_u64());
            put_u32(&mut buf, at + 16, file.info.nblocks);
            put_u32(&mut buf, at + 20, file.info.ndatablk);
            put_u64(&mut buf, at + 24, file.info.size);
            for block in &file.blocks {
                let at = layout.place(BLOCK_INFO_BYTES);
                put_u64(&mut buf, at, block.blkoff);
                put_u64(&mut buf, at + 8, block.vblocknr);
            }
        }
        buf
    }

    /// Decodes the summary held in `buf` (at least `sumbytes` long).
    ///
    /// Checksums are not verified here.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the records are inconsistent with the
    /// header.
    pub fn decode(buf: &[u8], block_size: usize) -> CoreResult<Self> {
        let header = SummaryHeader::decode(buf)?;
        let sumbytes = header.sumbytes as usize;
        if sumbytes < SUMMARY_HEADER_BYTES || sumbytes > buf.len() {
            return Err(CoreError::invalid_format(format!(
                "summary size {sumbytes} out of range"
            )));
        }
        let body = &buf[..sumbytes];
        let mut layout = SummaryLayout::new(block_size);
        let mut files = Vec::with_capacity(header.nfinfo as usize);
        for _ in 0..header.nfinfo {
            let mut r = ByteReader::at(body, layout.place(FILE_INFO_BYTES), "file info");
            let info = FileInfo {
                ino: Ino::new(r.u64()?),
                cno: Cno::new(r.u64()?),
                nblocks: r.u32()?,
                ndatablk: r.u32()?,
                size: r.u64()?,
            };
            if info.ndatablk > info.nblocks {
                return Err(CoreError::invalid_format(format!(
                    "file info for {} has {} data blocks out of {}",
                    info.ino, info.ndatablk, info.nblocks
                )));
            }
            let mut blocks = Vec::with_capacity(info.nblocks as usize);
            for _ in 0..info.nblocks {
                let mut r = ByteReader::at(body, layout.place(BLOCK_INFO_BYTES), "block info");
                blocks.push(BlockInfo {
                    blkoff: r.u64()?,
                    vblocknr: r.u64()?,
                });
            }
            files.push(FileEntry { info, blocks });
        }
        if layout.bytes() != sumbytes {
            return Err(CoreError::invalid_format(format!(
                "summary records end at {} but header says {sumbytes}",
                layout.bytes()
            )));
        }
        Ok(Self { header, files })
    }
}

/// Fills `sumsum` then `datasum` of a complete partial-segment image.
pub fn seal(image: &mut [u8], sumbytes: usize, seed: u32) {
    let sumsum = crc32(seed, &image[8..sumbytes]);
    put_u32(image, 4, sumsum);
    let datasum = crc32(seed, &image[4..]);
    put_u32(image, 0, datasum);
}

/// Verifies `sumsum` over the summary bytes.
///
/// # Errors
///
/// Returns `ChecksumMismatch` if the summary is damaged.
pub fn verify_sumsum(summary: &[u8], sumbytes: usize, seed: u32) -> CoreResult<()> {
    let expected = get_u32(summary, 4);
    let actual = crc32(seed, &summary[8..sumbytes.min(summary.len())]);
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::ChecksumMismatch { expected, actual })
    }
}

/// Verifies `datasum` over a complete partial-segment image.
///
/// # Errors
///
/// Returns `ChecksumMismatch` if any byte of the partial segment is damaged.
pub fn verify_datasum(image: &[u8], seed: u32) -> CoreResult<()> {
    let expected = get_u32(image, 0);
    let actual = crc32(seed, &image[4..]);
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::ChecksumMismatch { expected, actual })
    }
}
