//! A single construction: collection, address assignment, write, commit.
//!
//! Every metadata change made here goes through the shadowed caches of
//! [`Metadata`], so a failure anywhere before the commit point rolls the
//! in-memory state back to what the previous construction left.

use super::{Mode, Phase, Progress, Stage};
use crate::device::BlockDevice;
use crate::error::{CoreError, CoreResult};
use crate::file_table::SnapshotFile;
use crate::gc;
use crate::layout::{Geometry, SegFlags, SummaryHeader, SuperRoot};
use crate::mdt::Mdt;
use crate::metadata::Metadata;
use crate::segment::{BlockSource, BufferFull, LogWriter, PayloadBlock, SegmentBuffer};
use crate::types::{BlockNr, Cno, Ino, SegNum, VBlockNr};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// What a committed construction wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ConstructionReport {
    /// Latest durable checkpoint once the construction is on disk.
    pub(crate) cno: Cno,
    pub(crate) checkpoint: bool,
    pub(crate) psegs: u64,
    /// Blocks written, summaries and super root included.
    pub(crate) blocks: u64,
    pub(crate) segments_cleaned: u64,
    pub(crate) relocated: u64,
    /// Start of the last partial segment written.
    pub(crate) last_pseg: BlockNr,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    /// Blocks placed in the open buffer.
    blk_cnt: u64,
    /// Data blocks placed in the open buffer.
    datablk_cnt: u64,
    /// Payload blocks placed by the whole construction.
    nblk_this_inc: u64,
}

/// Builds and writes one chain of partial segments.
pub(crate) struct Construction<'a> {
    meta: &'a mut Metadata,
    device: &'a BlockDevice,
    progress: &'a Progress,
    geometry: Geometry,
    mode: Mode,
    seed: u32,
    now: u64,
    cno: Cno,
    gc_segments: usize,
    closed: Vec<SegmentBuffer>,
    current: Option<SegmentBuffer>,
    /// Virtual blocks placed so far; the cleaner must not copy them again.
    assigned: BTreeSet<VBlockNr>,
    victims: Vec<SegNum>,
    relocated: u64,
    counters: Counters,
}

impl<'a> Construction<'a> {
    pub(crate) fn new(
        meta: &'a mut Metadata,
        device: &'a BlockDevice,
        progress: &'a Progress,
        mode: Mode,
        now: u64,
        gc_segments: usize,
    ) -> Self {
        let geometry = *meta.geometry();
        let seed = meta.superblock.crc_seed;
        let cno = meta.next_cno;
        Self {
            meta,
            device,
            progress,
            geometry,
            mode,
            seed,
            now,
            cno,
            gc_segments,
            closed: Vec::new(),
            current: None,
            assigned: BTreeSet::new(),
            victims: Vec::new(),
            relocated: 0,
            counters: Counters::default(),
        }
    }

    /// Runs the construction to the commit point, or rolls every metadata
    /// change back and returns the error.
    pub(crate) fn run(mut self, files: &[SnapshotFile]) -> CoreResult<ConstructionReport> {
        self.meta.begin();
        let chain = match self.construct(files) {
            Ok(chain) => chain,
            Err(err) => {
                self.meta.rollback();
                let stage = self.progress.abort();
                warn!(
                    target: "segfs::segctor",
                    mode = self.mode.name(),
                    cno = self.cno.0,
                    stage = ?stage,
                    error = %err,
                    "construction aborted"
                );
                return Err(err);
            }
        };
        self.meta.commit();

        let checkpoint = self.mode.is_checkpoint();
        if checkpoint {
            self.meta.write_superblock(self.device, self.now)?;
            self.meta.sufile.lift_quarantine();
        }
        let report = ConstructionReport {
            cno: self.meta.last_cno(),
            checkpoint,
            psegs: chain.len() as u64,
            blocks: chain.iter().map(SegmentBuffer::nblocks).sum(),
            segments_cleaned: self.victims.len() as u64,
            relocated: self.relocated,
            last_pseg: chain.last().map_or(0, SegmentBuffer::start),
        };
        info!(
            target: "segfs::segctor",
            mode = self.mode.name(),
            cno = report.cno.0,
            psegs = report.psegs,
            blocks = report.blocks,
            payload = self.counters.nblk_this_inc,
            cleaned = report.segments_cleaned,
            "construction committed"
        );
        Ok(report)
    }

    fn construct(&mut self, files: &[SnapshotFile]) -> CoreResult<Vec<SegmentBuffer>> {
        self.enter(Stage::Init);
        self.init()?;
        if !files.is_empty() && !self.mode.is_gc() {
            self.meta.nongc_ctime = self.now;
        }

        self.enter(Stage::File);
        self.collect_files(files)?;

        if !self.mode.is_dsync() {
            self.enter(Stage::Gc);
            self.collect_gc()?;

            self.enter(Stage::Ifile);
            self.collect_virtual_mdt(Ino::IFILE)?;

            self.enter(Stage::Dat);
            self.collect_physical_mdt(Ino::DAT)?;

            self.enter(Stage::Cpfile);
            self.collect_physical_mdt(Ino::CPFILE)?;

            self.enter(Stage::Sufile);
            for victim in self.victims.clone() {
                self.meta.sufile.mark_segment_free(victim)?;
            }
            self.collect_physical_mdt(Ino::SUFILE)?;

            // The block is reserved in every buffer; it is filled in once
            // the roots are final.
            self.enter(Stage::SuperRoot);
        }
        self.enter(Stage::Done);

        let mut chain = self.close_chain()?;
        self.assign(&mut chain)?;

        self.progress.set_phase(Phase::Writing);
        self.write(&chain)?;

        if let Some(last) = chain.last() {
            self.meta.cursor.pseg_start = last.end();
            if self.mode.is_checkpoint() {
                self.meta.last_sr = last.start();
                self.meta.last_sr_seq = last.seq();
                self.meta.next_cno = self.cno.next();
            }
        }
        Ok(chain)
    }

    fn enter(&self, stage: Stage) {
        self.progress.set_stage(stage);
        debug!(target: "segfs::segctor", stage = ?stage, mode = self.mode.name(), "stage");
    }

    fn mdt_mut(&mut self, ino: Ino) -> CoreResult<&mut Mdt> {
        self.meta
            .mdt_mut(ino)
            .ok_or_else(|| CoreError::protocol_violation(format!("{ino} is not a metadata file")))
    }

    fn alloc_segment(&mut self) -> CoreResult<SegNum> {
        self.meta.sufile.alloc_segment(self.mode.is_gc(), self.now)
    }

    fn init(&mut self) -> CoreResult<()> {
        if self.mode.is_checkpoint() {
            self.meta.cpfile.create_checkpoint(self.cno, self.now)?;
        }
        if self.meta.cursor.exhausted(&self.geometry) {
            let next = self.alloc_segment()?;
            self.meta.cursor.advance(&self.geometry, next);
        }
        if !self.mode.is_dsync() {
            self.meta.sufile.mark_entry_dirty(self.meta.cursor.segnum)?;
        }
        self.open_buffer();
        Ok(())
    }

    fn open_buffer(&mut self) {
        let cursor = self.meta.cursor;
        let mut flags = SegFlags::empty();
        if self.mode.is_dsync() {
            flags.insert(SegFlags::SYNDT);
        }
        if self.mode.is_gc() {
            flags.insert(SegFlags::GC);
        }
        let header = SummaryHeader {
            flags,
            create: self.now,
            next: cursor.next_start(&self.geometry),
            cno: self.cno,
            ..SummaryHeader::default()
        };
        self.current = Some(SegmentBuffer::begin(
            cursor.pseg_start,
            cursor.remaining(&self.geometry),
            header,
            self.geometry.block_bytes(),
            self.mode.is_checkpoint(),
        ));
        self.counters.blk_cnt = 0;
        self.counters.datablk_cnt = 0;
    }

    /// Closes the open buffer and continues in the pre-allocated segment.
    fn chain_next_segment(&mut self) -> CoreResult<()> {
        if let Some(full) = self.current.take() {
            trace!(
                target: "segfs::segctor",
                start = full.start(),
                blocks = self.counters.blk_cnt,
                data = self.counters.datablk_cnt,
                "buffer full"
            );
            if !full.is_empty() {
                self.closed.push(full);
            }
        }
        let next = self.alloc_segment()?;
        self.meta.cursor.advance(&self.geometry, next);
        if !self.mode.is_dsync() {
            self.meta.sufile.mark_entry_dirty(self.meta.cursor.segnum)?;
        }
        debug!(
            target: "segfs::segctor",
            segnum = self.meta.cursor.segnum.0,
            nextnum = next.0,
            "continuing in next segment"
        );
        self.open_buffer();
        Ok(())
    }

    fn append(&mut self, block: PayloadBlock, size: u64) -> CoreResult<()> {
        loop {
            let buffer = self
                .current
                .as_mut()
                .ok_or_else(|| CoreError::protocol_violation("no open segment buffer"))?;
            let node = block.node;
            match buffer.append(block.clone(), size) {
                Ok(_) => {
                    self.counters.blk_cnt += 1;
                    self.counters.nblk_this_inc += 1;
                    if !node {
                        self.counters.datablk_cnt += 1;
                    }
                    return Ok(());
                }
                Err(BufferFull) => {
                    let start = buffer.start();
                    let fresh = start == self.geometry.seg_start(self.geometry.segnum_of(start));
                    if buffer.is_empty() && fresh {
                        return Err(CoreError::protocol_violation(format!(
                            "block of {} does not fit an empty segment",
                            block.ino
                        )));
                    }
                    self.chain_next_segment()?;
                }
            }
        }
    }

    fn collect_files(&mut self, files: &[SnapshotFile]) -> CoreResult<()> {
        for file in files {
            if file.removed {
                if !self.mode.is_dsync() {
                    self.remove_file(file.ino)?;
                }
                continue;
            }
            for (blkoff, data) in &file.blocks {
                self.collect_file_block(file.ino, *blkoff, data, file.size)?;
            }
        }
        if self.mode.is_dsync() {
            return Ok(());
        }

        let mut sizes: BTreeMap<Ino, u64> = files
            .iter()
            .filter(|f| !f.removed)
            .map(|f| (f.ino, f.size))
            .collect();
        loop {
            let inos = self.meta.files_with_uncollected_nodes();
            if inos.is_empty() {
                break;
            }
            for ino in inos {
                let size = match sizes.get(&ino) {
                    Some(size) => *size,
                    None => {
                        let size = self.meta.ifile.read(ino).map_or(0, |r| r.size);
                        sizes.insert(ino, size);
                        size
                    }
                };
                self.collect_file_nodes(ino, size)?;
            }
        }
        for (ino, size) in sizes {
            self.meta.write_file_record(ino, size, self.now)?;
        }
        Ok(())
    }

    fn collect_file_block(
        &mut self,
        ino: Ino,
        blkoff: u64,
        data: &Arc<Vec<u8>>,
        size: u64,
    ) -> CoreResult<()> {
        let existing = self.meta.file_bmap(self.device, ino)?.lookup(blkoff);
        let vblocknr = match existing {
            Some(vblocknr) => {
                self.meta.dat.mark_dirty(vblocknr)?;
                vblocknr
            }
            None => {
                let vblocknr = self.meta.dat.alloc(self.cno)?;
                self.meta.file_bmap(self.device, ino)?.set(blkoff, vblocknr)?;
                vblocknr
            }
        };
        self.assigned.insert(vblocknr);
        self.append(
            PayloadBlock {
                ino,
                blkoff,
                vblocknr,
                node: false,
                source: BlockSource::Captured(Arc::clone(data)),
            },
            size,
        )
    }

    fn collect_file_nodes(&mut self, ino: Ino, size: u64) -> CoreResult<()> {
        let nodes = self.meta.file_bmap(self.device, ino)?.uncollected_nodes();
        for idx in nodes {
            let root = self.meta.file_bmap(self.device, ino)?.root(idx);
            let vblocknr = if root == 0 {
                let vblocknr = self.meta.dat.alloc(self.cno)?;
                self.meta.file_bmap(self.device, ino)?.set_root(idx, vblocknr);
                vblocknr
            } else {
                self.meta.dat.mark_dirty(root)?;
                root
            };
            self.meta.file_bmap(self.device, ino)?.mark_node_collected(idx);
            self.assigned.insert(vblocknr);
            self.append(
                PayloadBlock {
                    ino,
                    blkoff: idx as u64,
                    vblocknr,
                    node: true,
                    source: BlockSource::FileNode { ino, idx },
                },
                size,
            )?;
        }
        Ok(())
    }

    /// Ends the life of every block of a removed file and frees its inode.
    fn remove_file(&mut self, ino: Ino) -> CoreResult<()> {
        let bmap = self.meta.file_bmap(self.device, ino)?;
        let mapped = bmap.mapped();
        let roots = bmap.roots();
        for (_, vblocknr) in mapped {
            self.meta.dat.free(vblocknr, self.cno)?;
        }
        for root in roots.into_iter().filter(|r| *r != 0) {
            self.meta.dat.free(root, self.cno)?;
        }
        self.meta.forget_file(ino);
        self.meta.ifile.clear(ino)?;
        debug!(target: "segfs::segctor", ino = ino.0, "file removed");
        Ok(())
    }

    fn collect_gc(&mut self) -> CoreResult<()> {
        if !self.mode.is_gc() {
            return Ok(());
        }
        let mut exclude: BTreeSet<SegNum> = self.meta.protected_segments().into_iter().collect();
        exclude.extend(
            self.closed
                .iter()
                .chain(self.current.iter())
                .map(|b| self.geometry.segnum_of(b.start())),
        );
        let victims = gc::select_victims(self.meta, &exclude, self.gc_segments);
        if victims.is_empty() {
            debug!(target: "segfs::gc", "no segment to clean");
            return Ok(());
        }
        let plan = gc::scan(self.meta, self.device, self.seed, &victims, &self.assigned)?;
        let mut moved = 0u64;
        for relocation in plan.relocations {
            if !self.assigned.insert(relocation.vblocknr) {
                continue;
            }
            self.meta.dat.mark_dirty(relocation.vblocknr)?;
            self.append(
                PayloadBlock {
                    ino: relocation.ino,
                    blkoff: relocation.blkoff,
                    vblocknr: relocation.vblocknr,
                    node: relocation.node,
                    source: BlockSource::Captured(relocation.data),
                },
                relocation.size,
            )?;
            moved += 1;
        }
        self.relocated = moved + plan.redirtied;
        info!(
            target: "segfs::gc",
            victims = ?victims.iter().map(|s| s.0).collect::<Vec<_>>(),
            relocated = moved,
            redirtied = plan.redirtied,
            "cleaning segments"
        );
        self.victims = victims;
        Ok(())
    }

    /// Collects a virtually mapped metadata file until it stops changing.
    fn collect_virtual_mdt(&mut self, ino: Ino) -> CoreResult<()> {
        loop {
            let blocks = self.mdt_mut(ino)?.uncollected_blocks();
            for &blkoff in &blocks {
                let existing = self.mdt_mut(ino)?.bmap().lookup(blkoff);
                let vblocknr = match existing {
                    Some(vblocknr) => {
                        self.meta.dat.mark_dirty(vblocknr)?;
                        vblocknr
                    }
                    None => {
                        let vblocknr = self.meta.dat.alloc(self.cno)?;
                        self.mdt_mut(ino)?.bmap_mut().set(blkoff, vblocknr)?;
                        vblocknr
                    }
                };
                self.mdt_mut(ino)?.mark_collected(blkoff);
                self.assigned.insert(vblocknr);
                self.append(
                    PayloadBlock {
                        ino,
                        blkoff,
                        vblocknr,
                        node: false,
                        source: BlockSource::MetaData { ino, blkoff },
                    },
                    0,
                )?;
            }
            let nodes = self.mdt_mut(ino)?.bmap().uncollected_nodes();
            for &idx in &nodes {
                let root = self.mdt_mut(ino)?.bmap().root(idx);
                let vblocknr = if root == 0 {
                    let vblocknr = self.meta.dat.alloc(self.cno)?;
                    self.mdt_mut(ino)?.bmap_mut().set_root(idx, vblocknr);
                    vblocknr
                } else {
                    self.meta.dat.mark_dirty(root)?;
                    root
                };
                self.mdt_mut(ino)?.bmap_mut().mark_node_collected(idx);
                self.assigned.insert(vblocknr);
                self.append(
                    PayloadBlock {
                        ino,
                        blkoff: idx as u64,
                        vblocknr,
                        node: true,
                        source: BlockSource::MetaNode { ino, idx },
                    },
                    0,
                )?;
            }
            if blocks.is_empty() && nodes.is_empty() {
                return Ok(());
            }
        }
    }

    /// Collects a physically mapped metadata file until it stops changing.
    ///
    /// Data block pointers are only known after the assign phase, so the
    /// nodes holding them are dirtied now.
    fn collect_physical_mdt(&mut self, ino: Ino) -> CoreResult<()> {
        loop {
            let blocks = self.mdt_mut(ino)?.uncollected_blocks();
            for &blkoff in &blocks {
                let mdt = self.mdt_mut(ino)?;
                mdt.bmap_mut().touch(blkoff)?;
                mdt.mark_collected(blkoff);
                self.append(
                    PayloadBlock {
                        ino,
                        blkoff,
                        vblocknr: 0,
                        node: false,
                        source: BlockSource::MetaData { ino, blkoff },
                    },
                    0,
                )?;
            }
            let nodes = self.mdt_mut(ino)?.bmap().uncollected_nodes();
            for &idx in &nodes {
                self.mdt_mut(ino)?.bmap_mut().mark_node_collected(idx);
                self.append(
                    PayloadBlock {
                        ino,
                        blkoff: idx as u64,
                        vblocknr: 0,
                        node: true,
                        source: BlockSource::MetaNode { ino, idx },
                    },
                    0,
                )?;
            }
            if blocks.is_empty() && nodes.is_empty() {
                return Ok(());
            }
        }
    }

    /// Hands out sequence numbers and marks the logical segment bounds.
    fn close_chain(&mut self) -> CoreResult<Vec<SegmentBuffer>> {
        let mut chain = std::mem::take(&mut self.closed);
        if let Some(open) = self.current.take() {
            if !open.is_empty() {
                chain.push(open);
            }
        }
        if chain.is_empty() {
            return Err(CoreError::protocol_violation("construction collected nothing"));
        }
        let first_seq = self.meta.cursor.seq;
        for (i, buffer) in chain.iter_mut().enumerate() {
            buffer.set_seq(first_seq + i as u64);
        }
        let last = chain.len() - 1;
        chain[0].add_flags(SegFlags::LOGBGN);
        chain[last].add_flags(SegFlags::LOGEND);
        self.meta.cursor.seq = first_seq + chain.len() as u64;
        Ok(chain)
    }

    /// Fixes every payload address and records it where it belongs.
    ///
    /// Full constructions require every changed metadata block to have been
    /// collected already; dsync leaves its metadata changes dirty.
    fn assign(&mut self, chain: &mut [SegmentBuffer]) -> CoreResult<()> {
        let strict = !self.mode.is_dsync();
        for buffer in chain.iter() {
            for (i, block) in buffer.payload().iter().enumerate() {
                let blocknr = buffer.address_of(i);
                if block.vblocknr != 0 {
                    self.meta.dat.update(block.vblocknr, blocknr)?;
                    if strict && !self.meta.dat.is_entry_collected(block.vblocknr) {
                        return Err(CoreError::protocol_violation(format!(
                            "DAT entry of virtual block {} changed after its stage",
                            block.vblocknr
                        )));
                    }
                    continue;
                }
                let mdt = self.mdt_mut(block.ino)?;
                if block.node {
                    mdt.bmap_mut().set_root(block.blkoff as usize, blocknr);
                } else {
                    mdt.bmap_mut().set(block.blkoff, blocknr)?;
                    let node = mdt.bmap().node_of(block.blkoff);
                    if strict && !mdt.bmap().is_node_collected(node) {
                        return Err(CoreError::protocol_violation(format!(
                            "map node {node} of {} changed after its stage",
                            block.ino
                        )));
                    }
                }
            }
        }

        let checkpoint = self.mode.is_checkpoint();
        let last = chain.len() - 1;
        for (i, buffer) in chain.iter().enumerate() {
            let segnum = self.geometry.segnum_of(buffer.start());
            let nblocks = buffer.nblocks() + u64::from(checkpoint && i == last);
            self.meta.sufile.add_usage(segnum, nblocks as u32, self.now)?;
            if strict && !self.meta.sufile.is_entry_collected(segnum) {
                return Err(CoreError::protocol_violation(format!(
                    "usage of {segnum} changed after the segment usage stage"
                )));
            }
        }

        if checkpoint {
            for ino in [Ino::DAT, Ino::CPFILE, Ino::SUFILE, Ino::IFILE] {
                let now = self.now;
                self.mdt_mut(ino)?.set_mtime(now);
            }
            let nblk_inc = chain.iter().map(SegmentBuffer::nblocks).sum::<u64>() + 1;
            let ifile = self.meta.ifile.mdt().record();
            let inodes = self.meta.ifile.ninodes();
            let blocks = self.meta.blocks_count();
            self.meta
                .cpfile
                .fill_checkpoint(self.cno, nblk_inc, inodes, blocks, &ifile)?;
            if !self.meta.cpfile.is_entry_collected(self.cno) {
                return Err(CoreError::protocol_violation(format!(
                    "entry of {} changed after the checkpoint stage",
                    self.cno
                )));
            }
            let root = SuperRoot {
                flags: 0,
                nongc_ctime: self.meta.nongc_ctime,
                dat: self.meta.dat.mdt().record(),
                cpfile: self.meta.cpfile.mdt().record(),
                sufile: self.meta.sufile.mdt().record(),
            };
            chain[last].finalize_super_root(root.encode(self.geometry.block_bytes(), self.seed));
        }
        Ok(())
    }

    fn write(&self, chain: &[SegmentBuffer]) -> CoreResult<()> {
        let writer = LogWriter::new(self.device, self.seed);
        let meta: &Metadata = &*self.meta;
        let mut images = Vec::with_capacity(chain.len());
        for buffer in chain {
            let image = writer.render(buffer, &mut |source| meta.resolve(source))?;
            images.push((buffer.start(), image));
        }
        writer.commit(&images)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_table::FileTable;
    use crate::layout::{InodeRecord, SuperBlock, SB_STATE_CLEAN};
    use crate::segment::LogReader;
    use segfs_storage::InMemoryBackend;

    const SEED: u32 = 0x5eed;

    fn setup(bps: u32, nsegments: u64) -> (BlockDevice, Metadata) {
        let geo = Geometry::new(1024, bps, nsegments).unwrap();
        let device = BlockDevice::new(
            Box::new(InMemoryBackend::with_size(geo.device_bytes() as usize)),
            geo,
        );
        let sb = SuperBlock {
            state: SB_STATE_CLEAN,
            block_size: 1024,
            blocks_per_segment: bps,
            nsegments,
            crc_seed: SEED,
            reserved_segments_percent: 0,
            last_pseg: 0,
            last_seq: 0,
            last_cno: Cno::new(0),
            wtime: 0,
            generation: 0,
        };
        let meta = Metadata::format(geo, sb, 1).unwrap();
        (device, meta)
    }

    fn dirty_file(meta: &mut Metadata, table: &mut FileTable, ino: u64, blocks: u64) -> Ino {
        let ino = Ino::new(ino);
        meta.ifile.write(ino, &InodeRecord::allocated(1)).unwrap();
        let handle = table.get_or_insert(ino, 0);
        {
            let mut file = handle.lock();
            for blkoff in 0..blocks {
                file.write_block(blkoff, vec![blkoff as u8 + 1; 1024]);
            }
            file.size = blocks * 1024;
        }
        table.mark_dirty(ino);
        ino
    }

    #[test]
    fn checkpoint_writes_a_sealed_logical_segment() {
        let (device, mut meta) = setup(32, 8);
        let progress = Progress::default();
        let mut table = FileTable::new();
        let ino = dirty_file(&mut meta, &mut table, 11, 3);
        let files = table.snapshot_all();

        let report = Construction::new(
            &mut meta,
            &device,
            &progress,
            Mode::Checkpoint { gc: false },
            10,
            2,
        )
        .run(&files)
        .unwrap();
        assert!(report.checkpoint);
        assert_eq!(report.cno, Cno::new(1));
        assert_eq!(report.psegs, 1);
        assert_eq!(meta.next_cno, Cno::new(2));
        assert_eq!(progress.stage(), Stage::Done);

        let pseg = LogReader::new(&device, SEED).read(1).unwrap();
        assert!(pseg.has(SegFlags::LOGBGN.union(SegFlags::LOGEND).union(SegFlags::SR)));
        assert_eq!(pseg.end(), meta.cursor.pseg_start);
        assert_eq!(meta.last_sr, 1);

        let mut loaded = Metadata::load(&device, meta.superblock.clone(), &pseg).unwrap();
        for blkoff in 0..3u64 {
            assert_eq!(
                loaded.read_file_block(&device, ino, blkoff).unwrap(),
                Some(vec![blkoff as u8 + 1; 1024])
            );
        }
        assert_eq!(loaded.read_file_block(&device, ino, 3).unwrap(), None);
        assert_eq!(loaded.ifile.read(ino).unwrap().size, 3 * 1024);
        assert_eq!(loaded.cpfile.latest().unwrap().cno, Cno::new(1));
    }

    #[test]
    fn flush_writes_no_super_root() {
        let (device, mut meta) = setup(32, 8);
        let progress = Progress::default();
        let mut table = FileTable::new();
        dirty_file(&mut meta, &mut table, 11, 1);
        let files = table.snapshot_all();

        let report = Construction::new(&mut meta, &device, &progress, Mode::Flush, 10, 2)
            .run(&files)
            .unwrap();
        assert!(!report.checkpoint);
        assert_eq!(report.cno, Cno::new(0));
        let pseg = LogReader::new(&device, SEED).read(1).unwrap();
        assert!(pseg.has(SegFlags::LOGBGN.union(SegFlags::LOGEND)));
        assert!(!pseg.has(SegFlags::SR));
        assert_eq!(meta.next_cno, Cno::new(1));
        assert!(!meta.is_dirty());
    }

    #[test]
    fn dsync_writes_only_file_data() {
        let (device, mut meta) = setup(32, 8);
        let progress = Progress::default();
        let mut table = FileTable::new();
        let ino = dirty_file(&mut meta, &mut table, 11, 4);
        let files = table.snapshot_range(ino, 1, 2);

        Construction::new(
            &mut meta,
            &device,
            &progress,
            Mode::Dsync { ino, first: 1, last: 2 },
            10,
            2,
        )
        .run(&files)
        .unwrap();
        let pseg = LogReader::new(&device, SEED).read(1).unwrap();
        assert!(pseg.has(SegFlags::SYNDT));
        let blocks: Vec<_> = pseg.blocks().map(|b| (b.info.ino, b.binfo.blkoff)).collect();
        assert_eq!(blocks, vec![(ino, 1), (ino, 2)]);
        // The DAT and the file map still have to be written.
        assert!(meta.is_dirty());
    }

    #[test]
    fn full_buffers_chain_into_new_segments() {
        let (device, mut meta) = setup(8, 16);
        let progress = Progress::default();
        let mut table = FileTable::new();
        let ino = dirty_file(&mut meta, &mut table, 11, 20);
        let files = table.snapshot_all();

        let report = Construction::new(
            &mut meta,
            &device,
            &progress,
            Mode::Checkpoint { gc: false },
            10,
            2,
        )
        .run(&files)
        .unwrap();
        assert!(report.psegs > 2);

        let reader = LogReader::new(&device, SEED);
        let geo = *device.geometry();
        let mut at = 1;
        let mut seq = None;
        let last = loop {
            let pseg = reader.read(at).unwrap();
            if let Some(prev) = seq {
                assert_eq!(pseg.header().seq, prev + 1);
                assert!(!pseg.has(SegFlags::LOGBGN));
            } else {
                assert!(pseg.has(SegFlags::LOGBGN));
            }
            seq = Some(pseg.header().seq);
            if pseg.has(SegFlags::LOGEND) {
                break pseg;
            }
            assert!(!pseg.has(SegFlags::SR));
            at = geo.seg_start(geo.segnum_of(pseg.header().next));
        };
        assert!(last.has(SegFlags::SR));

        let mut loaded = Metadata::load(&device, meta.superblock.clone(), &last).unwrap();
        for blkoff in 0..20u64 {
            assert_eq!(
                loaded.read_file_block(&device, ino, blkoff).unwrap(),
                Some(vec![blkoff as u8 + 1; 1024])
            );
        }
    }

    #[test]
    fn out_of_space_rolls_everything_back() {
        let (device, mut meta) = setup(8, 4);
        let progress = Progress::default();
        let mut table = FileTable::new();
        dirty_file(&mut meta, &mut table, 11, 40);
        let files = table.snapshot_all();
        let cursor = meta.cursor;
        let next_vblocknr = meta.dat.next_vblocknr();
        let stat = meta.sufile.stat();

        let err = Construction::new(
            &mut meta,
            &device,
            &progress,
            Mode::Checkpoint { gc: false },
            10,
            2,
        )
        .run(&files)
        .unwrap_err();
        assert!(matches!(err, CoreError::OutOfSpace { .. }));
        assert_eq!(progress.aborted_at(), Some(Stage::File));
        assert_eq!(meta.cursor, cursor);
        assert_eq!(meta.next_cno, Cno::new(1));
        assert_eq!(meta.dat.next_vblocknr(), next_vblocknr);
        assert_eq!(meta.sufile.stat().ncleansegs, stat.ncleansegs);
        assert!(meta.cpfile.latest().is_none());
    }

    #[test]
    fn running_out_of_space_in_the_dat_stage_rolls_back() {
        // Grow the file one block at a time until its data still fits but
        // the translation entries it needs no longer do.
        for blocks in 1..=200 {
            let (device, mut meta) = setup(32, 6);
            let progress = Progress::default();
            let mut table = FileTable::new();
            dirty_file(&mut meta, &mut table, 11, blocks);
            let files = table.snapshot_all();
            let cursor = meta.cursor;
            let next_vblocknr = meta.dat.next_vblocknr();
            let stat = meta.sufile.stat();

            let result = Construction::new(
                &mut meta,
                &device,
                &progress,
                Mode::Checkpoint { gc: false },
                10,
                2,
            )
            .run(&files);
            let Err(err) = result else { continue };
            assert!(matches!(err, CoreError::OutOfSpace { .. }), "{err}");
            if progress.aborted_at() != Some(Stage::Dat) {
                continue;
            }
            assert_eq!(progress.stage(), Stage::Done);
            assert_eq!(meta.cursor, cursor);
            assert_eq!(meta.next_cno, Cno::new(1));
            assert_eq!(meta.dat.next_vblocknr(), next_vblocknr);
            assert_eq!(meta.sufile.stat().ncleansegs, stat.ncleansegs);
            assert!(meta.cpfile.latest().is_none());
            return;
        }
        panic!("no file size ran out of space while collecting the DAT");
    }
}
