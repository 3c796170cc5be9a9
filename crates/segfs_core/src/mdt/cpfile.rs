//! Checkpoint file.
//!
//! Block 0 is a header (number of checkpoints, oldest and newest number).
//! Entries are 256 bytes and live in a ring indexed by `(cno - 1)`; once the
//! ring is full the oldest checkpoint is dropped. Each entry carries the
//! ifile's inode record as of that checkpoint.

use super::{Mapping, Mdt};
use crate::error::{CoreError, CoreResult};
use crate::layout::{get_u64, put_u64, Geometry, InodeRecord, INODE_RECORD_BYTES};
use crate::types::{Cno, Ino};
use serde::Serialize;

const CP_ENTRY_BYTES: usize = 256;
const CP_VALID: u64 = 0x1;
const CP_IFILE_OFFSET: usize = 64;

/// A checkpoint as recorded in the checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    /// Checkpoint number.
    pub cno: Cno,
    /// Creation time (Unix seconds).
    pub create: u64,
    /// Blocks written by the construction that produced it.
    pub nblk_inc: u64,
    /// Live regular files.
    pub inodes_count: u64,
    /// Mapped blocks across all regular files.
    pub blocks_count: u64,
    /// The ifile as of this checkpoint.
    #[serde(skip)]
    pub ifile: InodeRecord,
}

#[derive(Debug)]
pub(crate) struct Cpfile {
    mdt: Mdt,
    per_block: u64,
    capacity: u64,
}

impl Cpfile {
    pub(crate) fn create(geometry: Geometry) -> Self {
        Self::wrap(Mdt::create(Ino::CPFILE, Mapping::Physical, geometry), geometry)
    }

    pub(crate) fn load(
        geometry: Geometry,
        record: &InodeRecord,
        read: &mut dyn FnMut(u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Self> {
        let mdt = Mdt::load(Ino::CPFILE, Mapping::Physical, geometry, record, read)?;
        Ok(Self::wrap(mdt, geometry))
    }

    fn wrap(mdt: Mdt, geometry: Geometry) -> Self {
        let per_block = (geometry.block_bytes() / CP_ENTRY_BYTES) as u64;
        Self {
            mdt,
            per_block,
            capacity: (geometry.max_file_blocks() - 1) * per_block,
        }
    }

    pub(crate) fn mdt(&self) -> &Mdt {
        &self.mdt
    }

    pub(crate) fn mdt_mut(&mut self) -> &mut Mdt {
        &mut self.mdt
    }

    fn locate(&self, cno: Cno) -> (u64, usize) {
        let slot = (cno.as_u64() - 1) % self.capacity;
        (
            1 + slot / self.per_block,
            (slot % self.per_block) as usize * CP_ENTRY_BYTES,
        )
    }

    fn header(&self, offset: usize) -> u64 {
        self.mdt.block(0).map_or(0, |b| get_u64(b, offset))
    }

    pub(crate) fn ncheckpoints(&self) -> u64 {
        self.header(0)
    }

    /// Creates an empty entry for `cno`, dropping the oldest checkpoint if
    /// the ring is full.
    pub(crate) fn create_checkpoint(&mut self, cno: Cno, now: u64) -> CoreResult<()> {
        if cno.as_u64() == 0 {
            return Err(CoreError::invalid_operation("checkpoint numbers start at 1"));
        }
        let (mut count, mut first) = (self.header(0), self.header(8));
        let last = self.header(16);
        if count > 0 && cno.as_u64() != last + 1 {
            return Err(CoreError::protocol_violation(format!(
                "checkpoint {cno} does not follow cno:{last}"
            )));
        }
        if count == self.capacity {
            count -= 1;
            first += 1;
        }
        if count == 0 {
            first = cno.as_u64();
        }
        let (blkoff, offset) = self.locate(cno);
        let block = self.mdt.block_mut(blkoff)?;
        block[offset..offset + CP_ENTRY_BYTES].fill(0);
        put_u64(block, offset, CP_VALID);
        put_u64(block, offset + 8, cno.as_u64());
        put_u64(block, offset + 16, now);
        let header = self.mdt.block_mut(0)?;
        put_u64(header, 0, count + 1);
        put_u64(header, 8, first);
        put_u64(header, 16, cno.as_u64());
        Ok(())
    }

    /// Records the final state of checkpoint `cno`.
    pub(crate) fn fill_checkpoint(
        &mut self,
        cno: Cno,
        nblk_inc: u64,
        inodes_count: u64,
        blocks_count: u64,
        ifile: &InodeRecord,
    ) -> CoreResult<()> {
        if self.get(cno).is_none() {
            return Err(CoreError::protocol_violation(format!(
                "checkpoint {cno} was not created"
            )));
        }
        let (blkoff, offset) = self.locate(cno);
        let block = self.mdt.block_mut(blkoff)?;
        put_u64(block, offset + 24, nblk_inc);
        put_u64(block, offset + 32, inodes_count);
        put_u64(block, offset + 40, blocks_count);
        ifile.encode_into(
            &mut block[offset + CP_IFILE_OFFSET..offset + CP_IFILE_OFFSET + INODE_RECORD_BYTES],
        );
        Ok(())
    }

    /// Dirties the entry of `cno`.
    pub(crate) fn mark_entry_dirty(&mut self, cno: Cno) -> CoreResult<()> {
        let (blkoff, _) = self.locate(cno);
        self.mdt.mark_dirty(blkoff)
    }

    pub(crate) fn is_entry_collected(&self, cno: Cno) -> bool {
        self.mdt.is_collected(self.locate(cno).0)
    }

    pub(crate) fn get(&self, cno: Cno) -> Option<Checkpoint> {
        if cno.as_u64() == 0 || self.ncheckpoints() == 0 {
            return None;
        }
        if cno.as_u64() < self.header(8) || cno.as_u64() > self.header(16) {
            return None;
        }
        let (blkoff, offset) = self.locate(cno);
        let block = self.mdt.block(blkoff)?;
        if get_u64(block, offset) & CP_VALID == 0 || get_u64(block, offset + 8) != cno.as_u64() {
            return None;
        }
        let ifile = InodeRecord::decode(
            &block[offset + CP_IFILE_OFFSET..offset + CP_IFILE_OFFSET + INODE_RECORD_BYTES],
        )
        .ok()?;
        Some(Checkpoint {
            cno,
            create: get_u64(block, offset + 16),
            nblk_inc: get_u64(block, offset + 24),
            inodes_count: get_u64(block, offset + 32),
            blocks_count: get_u64(block, offset + 40),
            ifile,
        })
    }

    pub(crate) fn latest(&self) -> Option<Checkpoint> {
        self.get(Cno::new(self.header(16)))
    }

    /// Every retained checkpoint, oldest first.
    pub(crate) fn list(&self) -> Vec<Checkpoint> {
        if self.ncheckpoints() == 0 {
            return Vec::new();
        }
        (self.header(8)..=self.header(16))
            .filter_map(|cno| self.get(Cno::new(cno)))
            .collect()
    }
}
