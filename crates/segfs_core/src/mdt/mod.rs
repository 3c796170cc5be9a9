//! Metadata files.
//!
//! DAT, cpfile, sufile and ifile are ordinary files whose blocks are cached
//! in full while mounted. Every change goes through [`Mdt::block_mut`],
//! which marks the block dirty and, while a construction is running, keeps
//! its before-image so the construction can be rolled back.

mod bmap;
mod cpfile;
mod dat;
mod ifile;
mod shadow;
mod sufile;

pub(crate) use bmap::Bmap;
pub use cpfile::Checkpoint;
pub(crate) use cpfile::Cpfile;
pub(crate) use dat::Dat;
pub(crate) use ifile::Ifile;
pub(crate) use shadow::ShadowMap;
pub(crate) use sufile::Sufile;
pub use sufile::{SegmentUsage, SufileStat};

use crate::error::{CoreError, CoreResult};
use crate::layout::{Geometry, InodeRecord, INODE_ALLOCATED};
use crate::types::Ino;
use std::collections::BTreeSet;

/// How the pointers of a file's block map are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mapping {
    /// Physical block numbers (DAT, cpfile, sufile).
    Physical,
    /// Virtual block numbers translated by the DAT (ifile, regular files).
    Virtual,
}

#[derive(Debug, Clone)]
pub(crate) struct CachedBlock {
    pub(crate) data: Vec<u8>,
    pub(crate) dirty: bool,
}

/// A fully cached metadata file.
#[derive(Debug)]
pub(crate) struct Mdt {
    ino: Ino,
    mapping: Mapping,
    geometry: Geometry,
    blocks: ShadowMap<u64, CachedBlock>,
    bmap: Bmap,
    saved_bmap: Option<Bmap>,
    collected: BTreeSet<u64>,
    mtime: u64,
}

impl Mdt {
    pub(crate) fn create(ino: Ino, mapping: Mapping, geometry: Geometry) -> Self {
        Self {
            ino,
            mapping,
            geometry,
            blocks: ShadowMap::new(),
            bmap: Bmap::new(geometry.pointers_per_node()),
            saved_bmap: None,
            collected: BTreeSet::new(),
            mtime: 0,
        }
    }

    /// Loads every block of the file described by `record`.
    ///
    /// `read` fetches the block a map pointer refers to; for virtual files it
    /// translates through the DAT first.
    pub(crate) fn load(
        ino: Ino,
        mapping: Mapping,
        geometry: Geometry,
        record: &InodeRecord,
        read: &mut dyn FnMut(u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Self> {
        let mut mdt = Self::create(ino, mapping, geometry);
        mdt.bmap = Bmap::load(record, geometry.pointers_per_node(), &mut *read)?;
        for (blkoff, ptr) in mdt.bmap.mapped() {
            let data = read(ptr)?;
            mdt.blocks.insert(blkoff, CachedBlock { data, dirty: false });
        }
        mdt.mtime = record.mtime;
        Ok(mdt)
    }

    pub(crate) fn ino(&self) -> Ino {
        self.ino
    }

    pub(crate) fn mapping(&self) -> Mapping {
        self.mapping
    }

    pub(crate) fn block(&self, blkoff: u64) -> Option<&[u8]> {
        self.blocks.get(&blkoff).map(|b| b.data.as_slice())
    }

    /// Returns the block for writing, creating a zeroed one if needed.
    pub(crate) fn block_mut(&mut self, blkoff: u64) -> CoreResult<&mut Vec<u8>> {
        if blkoff >= self.geometry.max_file_blocks() {
            return Err(CoreError::out_of_space(format!(
                "{} cannot grow past {} blocks",
                self.ino,
                self.geometry.max_file_blocks()
            )));
        }
        if !self.blocks.contains_key(&blkoff) {
            self.blocks.insert(
                blkoff,
                CachedBlock {
                    data: vec![0; self.geometry.block_bytes()],
                    dirty: true,
                },
            );
        }
        let block = self
            .blocks
            .get_mut(&blkoff)
            .ok_or_else(|| CoreError::protocol_violation("cached block vanished"))?;
        block.dirty = true;
        Ok(&mut block.data)
    }

    pub(crate) fn mark_dirty(&mut self, blkoff: u64) -> CoreResult<()> {
        self.block_mut(blkoff).map(|_| ())
    }

    pub(crate) fn is_dirty(&self, blkoff: u64) -> bool {
        self.blocks.get(&blkoff).is_some_and(|b| b.dirty)
    }

    /// Dirty data blocks not yet collected, in offset order.
    pub(crate) fn uncollected_blocks(&self) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|(blkoff, b)| b.dirty && !self.collected.contains(*blkoff))
            .map(|(blkoff, _)| *blkoff)
            .collect()
    }

    pub(crate) fn mark_collected(&mut self, blkoff: u64) {
        self.collected.insert(blkoff);
    }

    pub(crate) fn is_collected(&self, blkoff: u64) -> bool {
        self.collected.contains(&blkoff)
    }

    /// True while some dirty block or node has not been collected.
    #[cfg(test)]
    pub(crate) fn has_uncollected(&self) -> bool {
        !self.uncollected_blocks().is_empty() || !self.bmap.uncollected_nodes().is_empty()
    }

    pub(crate) fn bmap(&self) -> &Bmap {
        &self.bmap
    }

    pub(crate) fn bmap_mut(&mut self) -> &mut Bmap {
        &mut self.bmap
    }

    pub(crate) fn nblocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub(crate) fn set_mtime(&mut self, mtime: u64) {
        self.mtime = mtime;
    }

    /// Inode record describing the file as currently mapped.
    pub(crate) fn record(&self) -> InodeRecord {
        let nblocks = self.blocks.keys().next_back().map_or(0, |last| last + 1);
        let mut record = InodeRecord {
            flags: INODE_ALLOCATED,
            size: nblocks * u64::from(self.geometry.block_size()),
            mtime: self.mtime,
            ..InodeRecord::default()
        };
        self.bmap.fill_record(&mut record);
        record
    }

    /// Installs a block read back from the log during roll-forward.
    pub(crate) fn replay_block(&mut self, blkoff: u64, data: Vec<u8>) -> CoreResult<()> {
        *self.block_mut(blkoff)? = data;
        Ok(())
    }

    pub(crate) fn begin(&mut self) {
        self.blocks.begin();
        self.saved_bmap = Some(self.bmap.clone());
        self.collected.clear();
    }

    /// The construction reached the device: collected blocks are clean.
    pub(crate) fn commit(&mut self) {
        self.blocks.commit();
        for blkoff in std::mem::take(&mut self.collected) {
            if let Some(block) = self.blocks.get_mut(&blkoff) {
                block.dirty = false;
            }
        }
        self.bmap.finish_construction();
        self.saved_bmap = None;
    }

    pub(crate) fn rollback(&mut self) {
        self.blocks.rollback();
        if let Some(bmap) = self.saved_bmap.take() {
            self.bmap = bmap;
        }
        self.bmap.forget_collection();
        self.collected.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(1024, 16, 8).unwrap()
    }

    #[test]
    fn block_mut_dirties_and_grows() {
        let mut mdt = Mdt::create(Ino::SUFILE, Mapping::Physical, geo());
        mdt.block_mut(2).unwrap()[0] = 9;
        assert!(mdt.is_dirty(2));
        assert_eq!(mdt.uncollected_blocks(), vec![2]);
        assert_eq!(mdt.record().size, 3 * 1024);
        assert_eq!(mdt.block(2).unwrap()[0], 9);
        assert!(mdt.block(1).is_none());
    }

    #[test]
    fn rollback_restores_blocks_and_map() {
        let mut mdt = Mdt::create(Ino::DAT, Mapping::Physical, geo());
        mdt.block_mut(0).unwrap()[0] = 1;
        mdt.begin();
        mdt.mark_collected(0);
        mdt.commit();
        assert!(!mdt.is_dirty(0));

        mdt.begin();
        mdt.block_mut(0).unwrap()[0] = 2;
        mdt.block_mut(1).unwrap();
        mdt.bmap_mut().set(0, 55).unwrap();
        mdt.rollback();

        assert_eq!(mdt.block(0).unwrap()[0], 1);
        assert!(!mdt.is_dirty(0));
        assert!(mdt.block(1).is_none());
        assert_eq!(mdt.bmap().lookup(0), None);
    }

    #[test]
    fn commit_keeps_uncollected_blocks_dirty() {
        let mut mdt = Mdt::create(Ino::DAT, Mapping::Physical, geo());
        mdt.begin();
        mdt.mark_dirty(0).unwrap();
        mdt.mark_dirty(1).unwrap();
        mdt.mark_collected(0);
        mdt.commit();
        assert!(!mdt.is_dirty(0));
        assert!(mdt.is_dirty(1));
        assert!(mdt.has_uncollected());
    }

    #[test]
    fn growth_past_map_capacity_is_out_of_space() {
        let mut mdt = Mdt::create(Ino::CPFILE, Mapping::Physical, geo());
        let max = geo().max_file_blocks();
        assert!(matches!(
            mdt.block_mut(max),
            Err(CoreError::OutOfSpace { .. })
        ));
    }
}
