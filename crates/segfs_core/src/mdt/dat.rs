//! Disk address translation table.
//!
//! Block 0 is a header (`next_vblocknr`, live entries). Entry `v` lives in
//! block `1 + v / per_block`. Virtual block numbers are never reused.

use super::{Mapping, Mdt};
use crate::error::{CoreError, CoreResult};
use crate::layout::{get_u64, put_u64, Geometry, InodeRecord};
use crate::types::{BlockNr, Cno, Ino, VBlockNr};

const DAT_ENTRY_BYTES: usize = 32;
const DAT_ENTRY_ALLOCATED: u64 = 0x1;

/// One translation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DatEntry {
    pub(crate) blocknr: BlockNr,
    pub(crate) start: Cno,
    pub(crate) end: Cno,
    pub(crate) allocated: bool,
}

#[derive(Debug)]
pub(crate) struct Dat {
    mdt: Mdt,
    per_block: u64,
}

impl Dat {
    pub(crate) fn create(geometry: Geometry) -> CoreResult<Self> {
        let mut dat = Self {
            mdt: Mdt::create(Ino::DAT, Mapping::Physical, geometry),
            per_block: (geometry.block_bytes() / DAT_ENTRY_BYTES) as u64,
        };
        put_u64(dat.mdt.block_mut(0)?, 0, 1);
        Ok(dat)
    }

    pub(crate) fn load(
        geometry: Geometry,
        record: &InodeRecord,
        read: &mut dyn FnMut(u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Self> {
        Ok(Self {
            mdt: Mdt::load(Ino::DAT, Mapping::Physical, geometry, record, read)?,
            per_block: (geometry.block_bytes() / DAT_ENTRY_BYTES) as u64,
        })
    }

    pub(crate) fn mdt(&self) -> &Mdt {
        &self.mdt
    }

    pub(crate) fn mdt_mut(&mut self) -> &mut Mdt {
        &mut self.mdt
    }

    fn locate(&self, vblocknr: VBlockNr) -> (u64, usize) {
        (
            1 + vblocknr / self.per_block,
            (vblocknr % self.per_block) as usize * DAT_ENTRY_BYTES,
        )
    }

    fn header(&self, offset: usize) -> u64 {
        self.mdt.block(0).map_or(0, |b| get_u64(b, offset))
    }

    pub(crate) fn next_vblocknr(&self) -> VBlockNr {
        self.header(0).max(1)
    }

    pub(crate) fn live_entries(&self) -> u64 {
        self.header(8)
    }

    /// Allocates a fresh virtual block number with no physical block yet.
    pub(crate) fn alloc(&mut self, cno: Cno) -> CoreResult<VBlockNr> {
        let vblocknr = self.next_vblocknr();
        let (blkoff, offset) = self.locate(vblocknr);
        let block = self.mdt.block_mut(blkoff)?;
        put_u64(block, offset, 0);
        put_u64(block, offset + 8, cno.as_u64());
        put_u64(block, offset + 16, u64::MAX);
        put_u64(block, offset + 24, DAT_ENTRY_ALLOCATED);
        let live = self.live_entries();
        let header = self.mdt.block_mut(0)?;
        put_u64(header, 0, vblocknr + 1);
        put_u64(header, 8, live + 1);
        Ok(vblocknr)
    }

    pub(crate) fn entry(&self, vblocknr: VBlockNr) -> Option<DatEntry> {
        if vblocknr == 0 {
            return None;
        }
        let (blkoff, offset) = self.locate(vblocknr);
        let block = self.mdt.block(blkoff)?;
        Some(DatEntry {
            blocknr: get_u64(block, offset),
            start: Cno::new(get_u64(block, offset + 8)),
            end: Cno::new(get_u64(block, offset + 16)),
            allocated: get_u64(block, offset + 24) & DAT_ENTRY_ALLOCATED != 0,
        })
    }

    /// Physical block currently backing `vblocknr`.
    pub(crate) fn translate(&self, vblocknr: VBlockNr) -> CoreResult<Option<BlockNr>> {
        match self.entry(vblocknr) {
            Some(entry) if entry.allocated => Ok(Some(entry.blocknr).filter(|b| *b != 0)),
            Some(_) | None if vblocknr < self.next_vblocknr() => Ok(None),
            _ => Err(CoreError::invalid_format(format!(
                "virtual block {vblocknr} was never allocated"
            ))),
        }
    }

    /// Dirties the block holding `vblocknr`'s entry without changing it.
    ///
    /// Called at collection time for blocks whose address will be assigned
    /// later in the same construction.
    pub(crate) fn mark_dirty(&mut self, vblocknr: VBlockNr) -> CoreResult<()> {
        let (blkoff, _) = self.locate(vblocknr);
        self.mdt.mark_dirty(blkoff)
    }

    pub(crate) fn is_entry_collected(&self, vblocknr: VBlockNr) -> bool {
        self.mdt.is_collected(self.locate(vblocknr).0)
    }

    /// Points `vblocknr` at `blocknr`.
    pub(crate) fn update(&mut self, vblocknr: VBlockNr, blocknr: BlockNr) -> CoreResult<()> {
        let (blkoff, offset) = self.locate(vblocknr);
        put_u64(self.mdt.block_mut(blkoff)?, offset, blocknr);
        Ok(())
    }

    /// Ends the life of `vblocknr` at checkpoint `cno`.
    pub(crate) fn free(&mut self, vblocknr: VBlockNr, cno: Cno) -> CoreResult<()> {
        if !self.entry(vblocknr).is_some_and(|e| e.allocated) {
            return Ok(());
        }
        let (blkoff, offset) = self.locate(vblocknr);
        let block = self.mdt.block_mut(blkoff)?;
        put_u64(block, offset + 16, cno.as_u64());
        put_u64(block, offset + 24, 0);
        let live = self.live_entries();
        put_u64(self.mdt.block_mut(0)?, 8, live.saturating_sub(1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dat() -> Dat {
        Dat::create(Geometry::new(1024, 16, 8).unwrap()).unwrap()
    }

    #[test]
    fn alloc_translate_update() {
        let mut dat = dat();
        let v1 = dat.alloc(Cno::new(1)).unwrap();
        let v2 = dat.alloc(Cno::new(1)).unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(dat.translate(v1).unwrap(), None);
        dat.update(v1, 500).unwrap();
        assert_eq!(dat.translate(v1).unwrap(), Some(500));
        assert_eq!(dat.live_entries(), 2);
        assert!(dat.translate(99).is_err());
    }

    #[test]
    fn free_ends_entry() {
        let mut dat = dat();
        let v = dat.alloc(Cno::new(1)).unwrap();
        dat.update(v, 40).unwrap();
        dat.free(v, Cno::new(3)).unwrap();
        let entry = dat.entry(v).unwrap();
        assert!(!entry.allocated);
        assert_eq!(entry.end, Cno::new(3));
        assert_eq!(dat.translate(v).unwrap(), None);
        assert_eq!(dat.live_entries(), 0);
        // Numbers are never handed out twice.
        assert_eq!(dat.alloc(Cno::new(3)).unwrap(), 2);
    }

    #[test]
    fn entries_spill_into_later_blocks() {
        let mut dat = dat();
        // 32 entries per 1 KiB block; entry 0 is unused.
        for _ in 0..40 {
            dat.alloc(Cno::new(1)).unwrap();
        }
        dat.mdt_mut().begin();
        dat.mark_dirty(33).unwrap();
        assert!(dat.mdt().is_dirty(2));
        assert!(!dat.is_entry_collected(33));
        dat.mdt_mut().mark_collected(2);
        assert!(dat.is_entry_collected(33));
    }
}
