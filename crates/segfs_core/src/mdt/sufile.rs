//! Segment usage file.
//!
//! Block 0 is a header (clean count, dirty count, last allocated segment);
//! usage entries follow, 16 bytes each. Segments freed by the cleaner are
//! quarantined until the construction that freed them is durable and the
//! superblock points past it, so the allocator cannot overwrite blocks the
//! previous super root still references.

use super::{Mapping, Mdt};
use crate::error::{CoreError, CoreResult};
use crate::layout::{get_u32, get_u64, put_u32, put_u64, Geometry, InodeRecord};
use crate::types::{Ino, SegNum};
use serde::Serialize;
use std::collections::BTreeSet;

const SU_ENTRY_BYTES: usize = 16;
const SU_DIRTY: u32 = 0x1;
const SU_ERROR: u32 = 0x2;

/// Usage of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SegmentUsage {
    /// Last time a partial segment was written to it.
    pub lastmod: u64,
    /// Blocks written to it since it was allocated.
    pub nblocks: u32,
    /// Raw flag bits.
    pub flags: u32,
}

impl SegmentUsage {
    /// In use by the log.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.flags & SU_DIRTY != 0
    }

    /// Unusable after a write failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.flags & SU_ERROR != 0
    }

    /// Available for allocation.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.flags & (SU_DIRTY | SU_ERROR) == 0
    }
}

/// Summary counts of the segment usage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SufileStat {
    /// Number of segments.
    pub nsegments: u64,
    /// Segments available for allocation.
    pub ncleansegs: u64,
    /// Segments in use.
    pub ndirtysegs: u64,
}

#[derive(Debug)]
pub(crate) struct Sufile {
    mdt: Mdt,
    per_block: u64,
    nsegments: u64,
    reserve: u64,
    quarantine: BTreeSet<SegNum>,
    saved_quarantine: Option<BTreeSet<SegNum>>,
}

impl Sufile {
    pub(crate) fn create(geometry: Geometry, reserve: u64) -> CoreResult<Self> {
        let mut sufile = Self::empty(
            Mdt::create(Ino::SUFILE, Mapping::Physical, geometry),
            geometry,
            reserve,
        );
        let nsegments = geometry.nsegments();
        let header = sufile.mdt.block_mut(0)?;
        put_u64(header, 0, nsegments);
        put_u64(header, 8, 0);
        put_u64(header, 16, nsegments - 1);
        Ok(sufile)
    }

    pub(crate) fn load(
        geometry: Geometry,
        reserve: u64,
        record: &InodeRecord,
        read: &mut dyn FnMut(u64) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<Self> {
        let mdt = Mdt::load(Ino::SUFILE, Mapping::Physical, geometry, record, read)?;
        Ok(Self::empty(mdt, geometry, reserve))
    }

    fn empty(mdt: Mdt, geometry: Geometry, reserve: u64) -> Self {
        Self {
            mdt,
            per_block: (geometry.block_bytes() / SU_ENTRY_BYTES) as u64,
            nsegments: geometry.nsegments(),
            reserve,
            quarantine: BTreeSet::new(),
            saved_quarantine: None,
        }
    }

    pub(crate) fn mdt(&self) -> &Mdt {
        &self.mdt
    }

    pub(crate) fn mdt_mut(&mut self) -> &mut Mdt {
        &mut self.mdt
    }

    fn locate(&self, segnum: SegNum) -> (u64, usize) {
        (
            1 + segnum.0 / self.per_block,
            (segnum.0 % self.per_block) as usize * SU_ENTRY_BYTES,
        )
    }

    fn header(&self, offset: usize) -> u64 {
        self.mdt.block(0).map_or(0, |b| get_u64(b, offset))
    }

    pub(crate) fn stat(&self) -> SufileStat {
        SufileStat {
            nsegments: self.nsegments,
            ncleansegs: self.header(0),
            ndirtysegs: self.header(8),
        }
    }

    pub(crate) fn usage(&self, segnum: SegNum) -> SegmentUsage {
        let (blkoff, offset) = self.locate(segnum);
        self.mdt.block(blkoff).map_or_else(SegmentUsage::default, |b| SegmentUsage {
            lastmod: get_u64(b, offset),
            nblocks: get_u32(b, offset + 8),
            flags: get_u32(b, offset + 12),
        })
    }

    fn write_usage(&mut self, segnum: SegNum, usage: SegmentUsage) -> CoreResult<()> {
        let (blkoff, offset) = self.locate(segnum);
        let block = self.mdt.block_mut(blkoff)?;
        put_u64(block, offset, usage.lastmod);
        put_u32(block, offset + 8, usage.nblocks);
        put_u32(block, offset + 12, usage.flags);
        Ok(())
    }

    fn adjust_counts(&mut self, clean_delta: i64) -> CoreResult<()> {
        let clean = self.header(0).saturating_add_signed(clean_delta);
        let dirty = self.header(8).saturating_add_signed(-clean_delta);
        let header = self.mdt.block_mut(0)?;
        put_u64(header, 0, clean);
        put_u64(header, 8, dirty);
        Ok(())
    }

    /// Allocates the next clean segment after the last one handed out.
    ///
    /// Ordinary constructions leave `reserve` clean segments for the cleaner;
    /// cleaning constructions may use them.
    pub(crate) fn alloc_segment(&mut self, use_reserve: bool, now: u64) -> CoreResult<SegNum> {
        let stat = self.stat();
        if !use_reserve && stat.ncleansegs <= self.reserve {
            return Err(CoreError::out_of_space(format!(
                "{} clean segments left, {} reserved for cleaning",
                stat.ncleansegs, self.reserve
            )));
        }
        let last = self.header(16);
        for step in 1..=self.nsegments {
            let segnum = SegNum((last + step) % self.nsegments);
            if !self.usage(segnum).is_clean() || self.quarantine.contains(&segnum) {
                continue;
            }
            self.write_usage(
                segnum,
                SegmentUsage {
                    lastmod: now,
                    nblocks: 0,
                    flags: SU_DIRTY,
                },
            )?;
            self.adjust_counts(-1)?;
            put_u64(self.mdt.block_mut(0)?, 16, segnum.0);
            return Ok(segnum);
        }
        Err(CoreError::out_of_space("no clean segment"))
    }

    /// Marks a segment in use without going through the allocator.
    pub(crate) fn mark_segment_used(&mut self, segnum: SegNum, now: u64) -> CoreResult<()> {
        let usage = self.usage(segnum);
        if usage.is_dirty() {
            return Ok(());
        }
        self.write_usage(
            segnum,
            SegmentUsage {
                lastmod: now,
                nblocks: usage.nblocks,
                flags: usage.flags | SU_DIRTY,
            },
        )?;
        self.adjust_counts(-1)
    }

    /// Returns a segment to the clean pool once the running construction
    /// has been committed.
    pub(crate) fn mark_segment_free(&mut self, segnum: SegNum) -> CoreResult<()> {
        if !self.usage(segnum).is_dirty() {
            return Ok(());
        }
        self.write_usage(segnum, SegmentUsage::default())?;
        self.adjust_counts(1)?;
        self.quarantine.insert(segnum);
        Ok(())
    }

    /// Accounts `nblocks` more blocks written to `segnum`.
    pub(crate) fn add_usage(&mut self, segnum: SegNum, nblocks: u32, now: u64) -> CoreResult<()> {
        let mut usage = self.usage(segnum);
        usage.nblocks = usage.nblocks.saturating_add(nblocks);
        usage.lastmod = now;
        self.write_usage(segnum, usage)
    }

    /// Dirties the entry of `segnum` so its final usage is written.
    pub(crate) fn mark_entry_dirty(&mut self, segnum: SegNum) -> CoreResult<()> {
        let (blkoff, _) = self.locate(segnum);
        self.mdt.mark_dirty(blkoff)?;
        self.mdt.mark_dirty(0)
    }

    pub(crate) fn is_entry_collected(&self, segnum: SegNum) -> bool {
        self.mdt.is_collected(self.locate(segnum).0) && self.mdt.is_collected(0)
    }

    /// Segments in use, with their usage.
    pub(crate) fn dirty_segments(&self) -> Vec<(SegNum, SegmentUsage)> {
        (0..self.nsegments)
            .map(SegNum)
            .map(|s| (s, self.usage(s)))
            .filter(|(_, u)| u.is_dirty() && !u.is_error())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_quarantined(&self, segnum: SegNum) -> bool {
        self.quarantine.contains(&segnum)
    }

    /// Segments freed by a committed construction become allocatable.
    pub(crate) fn lift_quarantine(&mut self) {
        self.quarantine.clear();
    }

    pub(crate) fn begin(&mut self) {
        self.mdt.begin();
        self.saved_quarantine = Some(self.quarantine.clone());
    }

    pub(crate) fn commit(&mut self) {
        self.mdt.commit();
        self.saved_quarantine = None;
    }

    pub(crate) fn rollback(&mut self) {
        self.mdt.rollback();
        if let Some(saved) = self.saved_quarantine.take() {
            self.quarantine = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sufile(reserve: u64) -> Sufile {
        Sufile::create(Geometry::new(1024, 16, 6).unwrap(), reserve).unwrap()
    }

    #[test]
    fn alloc_hands_out_segments_in_order() {
        let mut su = sufile(0);
        assert_eq!(su.alloc_segment(false, 1).unwrap(), SegNum(0));
        assert_eq!(su.alloc_segment(false, 1).unwrap(), SegNum(1));
        let stat = su.stat();
        assert_eq!(stat.ncleansegs, 4);
        assert_eq!(stat.ndirtysegs, 2);
        assert!(su.usage(SegNum(1)).is_dirty());
    }

    #[test]
    fn reserve_is_only_for_cleaning() {
        let mut su = sufile(2);
        for _ in 0..4 {
            su.alloc_segment(false, 1).unwrap();
        }
        assert!(matches!(
            su.alloc_segment(false, 1),
            Err(CoreError::OutOfSpace { .. })
        ));
        su.alloc_segment(true, 1).unwrap();
        su.alloc_segment(true, 1).unwrap();
        assert!(su.alloc_segment(true, 1).is_err());
    }

    #[test]
    fn freed_segments_are_quarantined() {
        let mut su = sufile(0);
        for _ in 0..6 {
            su.alloc_segment(false, 1).unwrap();
        }
        su.mark_segment_free(SegNum(2)).unwrap();
        assert!(su.is_quarantined(SegNum(2)));
        assert!(su.alloc_segment(false, 1).is_err());
        su.lift_quarantine();
        assert_eq!(su.alloc_segment(false, 1).unwrap(), SegNum(2));
    }

    #[test]
    fn rollback_restores_quarantine_and_usage() {
        let mut su = sufile(0);
        su.alloc_segment(false, 1).unwrap();
        su.begin();
        su.mark_segment_free(SegNum(0)).unwrap();
        su.alloc_segment(false, 1).unwrap();
        su.rollback();
        assert!(!su.is_quarantined(SegNum(0)));
        assert!(su.usage(SegNum(0)).is_dirty());
        assert!(su.usage(SegNum(1)).is_clean());
        assert_eq!(su.stat().ncleansegs, 5);
    }

    #[test]
    fn usage_accumulates() {
        let mut su = sufile(0);
        su.mark_segment_used(SegNum(3), 5).unwrap();
        su.mark_segment_used(SegNum(3), 5).unwrap();
        su.add_usage(SegNum(3), 10, 6).unwrap();
        su.add_usage(SegNum(3), 4, 7).unwrap();
        let usage = su.usage(SegNum(3));
        assert_eq!(usage.nblocks, 14);
        assert_eq!(usage.lastmod, 7);
        assert_eq!(su.stat().ndirtysegs, 1);
        assert_eq!(su.dirty_segments().len(), 1);
    }
}
