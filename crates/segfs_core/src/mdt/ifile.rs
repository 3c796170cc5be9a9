//! Inode file.
//!
//! Block 0 is a header (next inode number, live inodes); the record of
//! inode `i` lives in block `1 + i / per_block`. The ifile's own map holds
//! virtual block numbers.

use super::{Mapping, Mdt};
use crate::error::{CoreError, CoreResult};
use crate::layout::{get_u64, put_u64, Geometry, InodeRecord, INODE_RECORD_BYTES};
use crate::types::Ino;

#[derive(Debug)]
pub(crate) struct Ifile {
    mdt: Mdt,
    per_block: u64,
}

impl Ifile {
    pub(crate) fn create(geometry: Geometry) -> CoreResult<Self> {
        let mut ifile = Self::wrap(Mdt::create(Ino::IFILE, Mapping::Virtual, geometry), geometry);
        put_u64(ifile.mdt.block_mut(0)?, 0, Ino::FIRST_USER.as_u64());
        Ok(ifile)
    }

    pub(crate) fn load(
        geometry: Geometry,
        record: &InodeRecord,
        read: &mut dyn FnMut(u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Self> {
        let mdt = Mdt::load(Ino::IFILE, Mapping::Virtual, geometry, record, read)?;
        Ok(Self::wrap(mdt, geometry))
    }

    fn wrap(mdt: Mdt, geometry: Geometry) -> Self {
        Self {
            mdt,
            per_block: (geometry.block_bytes() / INODE_RECORD_BYTES) as u64,
        }
    }

    pub(crate) fn mdt(&self) -> &Mdt {
        &self.mdt
    }

    pub(crate) fn mdt_mut(&mut self) -> &mut Mdt {
        &mut self.mdt
    }

    /// Block of the ifile holding `ino`'s record.
    pub(crate) fn block_of(&self, ino: Ino) -> u64 {
        1 + ino.as_u64() / self.per_block
    }

    /// Inode numbers whose records live in ifile block `blkoff`.
    pub(crate) fn inos_in_block(&self, blkoff: u64) -> impl Iterator<Item = Ino> {
        let first = blkoff.saturating_sub(1) * self.per_block;
        let count = if blkoff == 0 { 0 } else { self.per_block };
        (first..first + count).map(Ino::new)
    }

    fn locate(&self, ino: Ino) -> (u64, usize) {
        (
            self.block_of(ino),
            (ino.as_u64() % self.per_block) as usize * INODE_RECORD_BYTES,
        )
    }

    fn header(&self, offset: usize) -> u64 {
        self.mdt.block(0).map_or(0, |b| get_u64(b, offset))
    }

    pub(crate) fn next_ino(&self) -> Ino {
        Ino::new(self.header(0).max(Ino::FIRST_USER.as_u64()))
    }

    pub(crate) fn ninodes(&self) -> u64 {
        self.header(8)
    }

    /// Hands out a fresh inode number.
    pub(crate) fn alloc_ino(&mut self) -> CoreResult<Ino> {
        let ino = self.next_ino();
        put_u64(self.mdt.block_mut(0)?, 0, ino.as_u64() + 1);
        Ok(ino)
    }

    /// Makes sure `ino` is never handed out again.
    pub(crate) fn bump_next_ino(&mut self, ino: Ino) -> CoreResult<()> {
        if ino.as_u64() >= self.next_ino().as_u64() {
            put_u64(self.mdt.block_mut(0)?, 0, ino.as_u64() + 1);
        }
        Ok(())
    }

    pub(crate) fn read(&self, ino: Ino) -> Option<InodeRecord> {
        let (blkoff, offset) = self.locate(ino);
        let block = self.mdt.block(blkoff)?;
        InodeRecord::decode(&block[offset..offset + INODE_RECORD_BYTES])
            .ok()
            .filter(InodeRecord::is_allocated)
    }

    pub(crate) fn write(&mut self, ino: Ino, record: &InodeRecord) -> CoreResult<()> {
        if !ino.is_regular() {
            return Err(CoreError::invalid_operation(format!(
                "{ino} is reserved for metadata"
            )));
        }
        let was_live = self.read(ino).is_some();
        let (blkoff, offset) = self.locate(ino);
        let block = self.mdt.block_mut(blkoff)?;
        record.encode_into(&mut block[offset..offset + INODE_RECORD_BYTES]);
        if !was_live && record.is_allocated() {
            let n = self.ninodes();
            put_u64(self.mdt.block_mut(0)?, 8, n + 1);
        }
        self.bump_next_ino(ino)
    }

    /// Releases `ino`'s record.
    pub(crate) fn clear(&mut self, ino: Ino) -> CoreResult<()> {
        if self.read(ino).is_none() {
            return Ok(());
        }
        let (blkoff, offset) = self.locate(ino);
        let block = self.mdt.block_mut(blkoff)?;
        block[offset..offset + INODE_RECORD_BYTES].fill(0);
        let n = self.ninodes();
        put_u64(self.mdt.block_mut(0)?, 8, n.saturating_sub(1));
        Ok(())
    }

    pub(crate) fn mark_entry_dirty(&mut self, ino: Ino) -> CoreResult<()> {
        let blkoff = self.block_of(ino);
        self.mdt.mark_dirty(blkoff)?;
        self.mdt.mark_dirty(0)
    }

    pub(crate) fn is_entry_collected(&self, ino: Ino) -> bool {
        self.mdt.is_collected(self.block_of(ino)) && self.mdt.is_collected(0)
    }

    /// Every live regular inode with its record.
    pub(crate) fn inodes(&self) -> Vec<(Ino, InodeRecord)> {
        let last = self.next_ino().as_u64();
        (Ino::FIRST_USER.as_u64()..last)
            .map(Ino::new)
            .filter_map(|ino| self.read(ino).map(|r| (ino, r)))
            .collect()
    }
}
