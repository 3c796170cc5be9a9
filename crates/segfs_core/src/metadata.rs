//! Everything the log constructor persists besides file data.
//!
//! [`Metadata`] is guarded by the metadata lock. A construction holds that
//! lock from collection to commit; foreground threads take it only to read
//! clean blocks or to allocate inodes.

use crate::device::BlockDevice;
use crate::error::{CoreError, CoreResult};
use crate::layout::{Geometry, InodeRecord, SuperBlock, SuperRoot};
use crate::mdt::{Bmap, Cpfile, Dat, Ifile, Mdt, ShadowMap, Sufile};
use crate::segment::{BlockSource, LogCursor, PartialSegment};
use crate::types::{BlockNr, Cno, Ino, SegNum};

/// Metadata files, regular-file maps and the log head.
#[derive(Debug)]
pub(crate) struct Metadata {
    geometry: Geometry,
    pub(crate) dat: Dat,
    pub(crate) cpfile: Cpfile,
    pub(crate) sufile: Sufile,
    pub(crate) ifile: Ifile,
    files: ShadowMap<Ino, Bmap>,
    pub(crate) cursor: LogCursor,
    pub(crate) next_cno: Cno,
    /// Start of the partial segment holding the latest super root.
    pub(crate) last_sr: BlockNr,
    pub(crate) last_sr_seq: u64,
    pub(crate) nongc_ctime: u64,
    pub(crate) superblock: SuperBlock,
    saved: Option<Saved>,
}

#[derive(Debug, Clone, Copy)]
struct Saved {
    cursor: LogCursor,
    next_cno: Cno,
    nongc_ctime: u64,
}

impl Metadata {
    /// Empty metadata of a freshly formatted device.
    ///
    /// Segment 0 becomes the log head and segment 1 the segment it
    /// continues in.
    pub(crate) fn format(geometry: Geometry, superblock: SuperBlock, now: u64) -> CoreResult<Self> {
        let mut sufile = Sufile::create(geometry, reserve_of(&superblock))?;
        let segnum = sufile.alloc_segment(false, now)?;
        let nextnum = sufile.alloc_segment(false, now)?;
        Ok(Self {
            geometry,
            dat: Dat::create(geometry)?,
            cpfile: Cpfile::create(geometry),
            sufile,
            ifile: Ifile::create(geometry)?,
            files: ShadowMap::new(),
            cursor: LogCursor {
                segnum,
                pseg_start: geometry.seg_start(segnum),
                nextnum,
                seq: 1,
            },
            next_cno: Cno::new(1),
            last_sr: 0,
            last_sr_seq: 0,
            nongc_ctime: now,
            superblock,
            saved: None,
        })
    }

    /// Loads the metadata sealed by the super root in `pseg`.
    pub(crate) fn load(
        device: &BlockDevice,
        superblock: SuperBlock,
        pseg: &PartialSegment,
    ) -> CoreResult<Self> {
        let geometry = *device.geometry();
        let seed = superblock.crc_seed;
        let root: SuperRoot = pseg.super_root(seed)?;
        let mut physical = |blocknr: u64| device.read_block(blocknr);
        let dat = Dat::load(geometry, &root.dat, &mut physical)?;
        let cpfile = Cpfile::load(geometry, &root.cpfile, &mut physical)?;
        let sufile = Sufile::load(geometry, reserve_of(&superblock), &root.sufile, &mut physical)?;

        let header = pseg.header();
        let checkpoint = cpfile.get(header.cno).ok_or_else(|| {
            CoreError::corrupt_super_root(format!(
                "super root at {} seals {} but the checkpoint file lacks it",
                pseg.start(),
                header.cno
            ))
        })?;
        let ifile = Ifile::load(geometry, &checkpoint.ifile, &mut |vblocknr| {
            read_virtual(device, &dat, vblocknr)
        })?;

        Ok(Self {
            geometry,
            dat,
            cpfile,
            sufile,
            ifile,
            files: ShadowMap::new(),
            cursor: LogCursor {
                segnum: geometry.segnum_of(pseg.start()),
                pseg_start: pseg.end(),
                nextnum: geometry.segnum_of(header.next),
                seq: header.seq + 1,
            },
            next_cno: header.cno.next(),
            last_sr: pseg.start(),
            last_sr_seq: header.seq,
            nongc_ctime: root.nongc_ctime,
            superblock,
            saved: None,
        })
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Latest durable checkpoint number.
    pub(crate) fn last_cno(&self) -> Cno {
        Cno::new(self.next_cno.as_u64().saturating_sub(1))
    }

    /// The metadata file `ino`.
    pub(crate) fn mdt(&self, ino: Ino) -> Option<&Mdt> {
        match ino {
            Ino::DAT => Some(self.dat.mdt()),
            Ino::CPFILE => Some(self.cpfile.mdt()),
            Ino::SUFILE => Some(self.sufile.mdt()),
            Ino::IFILE => Some(self.ifile.mdt()),
            _ => None,
        }
    }

    pub(crate) fn mdt_mut(&mut self, ino: Ino) -> Option<&mut Mdt> {
        match ino {
            Ino::DAT => Some(self.dat.mdt_mut()),
            Ino::CPFILE => Some(self.cpfile.mdt_mut()),
            Ino::SUFILE => Some(self.sufile.mdt_mut()),
            Ino::IFILE => Some(self.ifile.mdt_mut()),
            _ => None,
        }
    }

    /// Block map of regular file `ino`, loaded from its inode on first use.
    pub(crate) fn file_bmap(&mut self, device: &BlockDevice, ino: Ino) -> CoreResult<&mut Bmap> {
        if !self.files.contains_key(&ino) {
            let ppn = self.geometry.pointers_per_node();
            let bmap = match self.ifile.read(ino) {
                Some(record) => {
                    let dat = &self.dat;
                    Bmap::load(&record, ppn, &mut |vblocknr| read_virtual(device, dat, vblocknr))?
                }
                None => Bmap::new(ppn),
            };
            self.files.insert(ino, bmap);
        }
        self.files
            .get_mut(&ino)
            .ok_or_else(|| CoreError::protocol_violation(format!("map of {ino} vanished")))
    }

    #[cfg(test)]
    pub(crate) fn loaded_bmap(&self, ino: Ino) -> Option<&Bmap> {
        self.files.get(&ino)
    }

    /// Regular files whose map has dirty nodes not yet collected.
    pub(crate) fn files_with_uncollected_nodes(&self) -> Vec<Ino> {
        self.files
            .iter()
            .filter(|(_, bmap)| !bmap.uncollected_nodes().is_empty())
            .map(|(ino, _)| *ino)
            .collect()
    }

    pub(crate) fn forget_file(&mut self, ino: Ino) -> Option<Bmap> {
        self.files.remove(&ino)
    }

    /// Reads block `blkoff` of regular file `ino` from the device.
    ///
    /// Returns `None` for holes.
    pub(crate) fn read_file_block(
        &mut self,
        device: &BlockDevice,
        ino: Ino,
        blkoff: u64,
    ) -> CoreResult<Option<Vec<u8>>> {
        let Some(vblocknr) = self.file_bmap(device, ino)?.lookup(blkoff) else {
            return Ok(None);
        };
        match self.dat.translate(vblocknr)? {
            Some(blocknr) => device.read_block(blocknr).map(Some),
            None => Ok(None),
        }
    }

    /// Rewrites the inode of regular file `ino` from its map.
    pub(crate) fn write_file_record(&mut self, ino: Ino, size: u64, mtime: u64) -> CoreResult<()> {
        let mut record = InodeRecord::allocated(mtime);
        record.size = size;
        if let Some(bmap) = self.files.get(&ino) {
            bmap.fill_record(&mut record);
        } else if let Some(old) = self.ifile.read(ino) {
            record.roots = old.roots;
            record.nblocks = old.nblocks;
        }
        self.ifile.write(ino, &record)
    }

    /// Mapped blocks across all regular files.
    pub(crate) fn blocks_count(&self) -> u64 {
        self.ifile.inodes().iter().map(|(_, r)| r.nblocks).sum()
    }

    /// Content of a metadata payload block as it is now.
    pub(crate) fn resolve(&self, source: &BlockSource) -> CoreResult<Vec<u8>> {
        let bs = self.geometry.block_bytes();
        match source {
            BlockSource::Captured(data) => Ok(data.as_ref().clone()),
            BlockSource::MetaData { ino, blkoff } => self
                .mdt(*ino)
                .and_then(|mdt| mdt.block(*blkoff))
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    CoreError::protocol_violation(format!("{ino} has no block {blkoff}"))
                }),
            BlockSource::MetaNode { ino, idx } => self
                .mdt(*ino)
                .map(|mdt| mdt.bmap().node_bytes(*idx, bs))
                .ok_or_else(|| CoreError::protocol_violation(format!("{ino} is not metadata"))),
            BlockSource::FileNode { ino, idx } => self
                .files
                .get(ino)
                .map(|bmap| bmap.node_bytes(*idx, bs))
                .ok_or_else(|| CoreError::protocol_violation(format!("map of {ino} is not loaded"))),
        }
    }

    /// True while any metadata block or map node waits to be written.
    pub(crate) fn is_dirty(&self) -> bool {
        [Ino::DAT, Ino::CPFILE, Ino::SUFILE, Ino::IFILE]
            .iter()
            .filter_map(|ino| self.mdt(*ino))
            .any(|mdt| !mdt.uncollected_blocks().is_empty() || mdt.bmap().is_dirty())
            || self.files.iter().any(|(_, bmap)| bmap.is_dirty())
    }

    /// Segments a cleaning pass must leave alone.
    pub(crate) fn protected_segments(&self) -> [SegNum; 3] {
        [
            self.cursor.segnum,
            self.cursor.nextnum,
            self.geometry.segnum_of(self.last_sr),
        ]
    }

    /// Starts shadowing every change for a construction.
    pub(crate) fn begin(&mut self) {
        self.dat.mdt_mut().begin();
        self.cpfile.mdt_mut().begin();
        self.ifile.mdt_mut().begin();
        self.sufile.begin();
        self.files.begin();
        self.saved = Some(Saved {
            cursor: self.cursor,
            next_cno: self.next_cno,
            nongc_ctime: self.nongc_ctime,
        });
    }

    /// The construction is on disk.
    pub(crate) fn commit(&mut self) {
        self.dat.mdt_mut().commit();
        self.cpfile.mdt_mut().commit();
        self.ifile.mdt_mut().commit();
        self.sufile.commit();
        for ino in self.files.commit() {
            if let Some(bmap) = self.files.get_mut(&ino) {
                bmap.finish_construction();
            }
        }
        self.saved = None;
    }

    /// Undoes every change since [`Metadata::begin`].
    pub(crate) fn rollback(&mut self) {
        self.dat.mdt_mut().rollback();
        self.cpfile.mdt_mut().rollback();
        self.ifile.mdt_mut().rollback();
        self.sufile.rollback();
        self.files.rollback();
        if let Some(saved) = self.saved.take() {
            self.cursor = saved.cursor;
            self.next_cno = saved.next_cno;
            self.nongc_ctime = saved.nongc_ctime;
        }
    }

    /// Writes the older superblock copy, pointing it at the latest super
    /// root.
    pub(crate) fn write_superblock(&mut self, device: &BlockDevice, now: u64) -> CoreResult<()> {
        let last_cno = self.last_cno();
        let sb = &mut self.superblock;
        sb.last_pseg = self.last_sr;
        sb.last_seq = self.last_sr_seq;
        sb.last_cno = last_cno;
        sb.wtime = now;
        sb.generation += 1;
        device.write_superblock((sb.generation % 2) as usize, sb)
    }
}

fn reserve_of(sb: &SuperBlock) -> u64 {
    sb.nsegments * u64::from(sb.reserved_segments_percent) / 100
}

/// Reads the block that `vblocknr` currently maps to.
pub(crate) fn read_virtual(device: &BlockDevice, dat: &Dat, vblocknr: u64) -> CoreResult<Vec<u8>> {
    let blocknr = dat.translate(vblocknr)?.ok_or_else(|| {
        CoreError::invalid_format(format!("virtual block {vblocknr} has no disk block"))
    })?;
    device.read_block(blocknr)
}
