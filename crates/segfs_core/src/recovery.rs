//! Mount-time recovery and roll-forward.
//!
//! Recovery picks the newest super root it can validate, then walks the log
//! forward from it. Every complete logical segment written after that super
//! root is replayed into memory: file data becomes dirty page-cache data,
//! metadata blocks become dirty cache blocks. The caller then writes one
//! checkpoint to make the replayed state durable.

use crate::device::BlockDevice;
use crate::error::{CoreError, CoreResult};
use crate::layout::{SegFlags, SuperBlock};
use crate::metadata::Metadata;
use crate::segment::{LogReader, PartialSegment};
use crate::types::{unix_now, BlockNr, Cno, Ino, SegNum};
use segfs_storage::StorageBackend;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// What recovery found on the device.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RecoveryInfo {
    /// Partial segment holding the super root the mount started from.
    pub super_root: BlockNr,
    /// Its sequence number.
    pub super_root_seq: u64,
    /// Checkpoint it seals.
    pub cno: Cno,
    /// True if neither superblock led to a valid super root and the device
    /// was scanned.
    pub full_scan: bool,
    /// First partial segment of the roll-forward region.
    pub lsegs_start: Option<BlockNr>,
    /// Last partial segment of the roll-forward region.
    pub lsegs_end: Option<BlockNr>,
    /// Sequence number of `lsegs_start`.
    pub lsegs_start_seq: u64,
    /// Complete logical segments in the region.
    pub logical_segments: u64,
    /// Blocks replayed from the region.
    pub replayed_blocks: u64,
    /// Segments the region spans, marked in use before allocation resumes.
    pub used_segments: Vec<SegNum>,
    /// True if the region was replayed into memory.
    pub rolled_forward: bool,
}

impl RecoveryInfo {
    /// True if there is nothing after the super root.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.logical_segments == 0
    }
}

/// Regular-file data found in the roll-forward region.
#[derive(Debug, Clone)]
pub(crate) struct ReplayedFile {
    pub(crate) ino: Ino,
    pub(crate) size: u64,
    /// `(blkoff, data)` in log order; later entries win.
    pub(crate) blocks: Vec<(u64, Vec<u8>)>,
}

#[derive(Debug)]
pub(crate) struct Recovered {
    pub(crate) meta: Metadata,
    pub(crate) files: Vec<ReplayedFile>,
    pub(crate) info: RecoveryInfo,
}

/// Runs recovery on an unmounted backend without changing it.
///
/// # Errors
///
/// Returns `InvalidFormat` if no superblock is valid and
/// `CorruptSuperRoot` if no super root can be found.
pub fn run_recovery(backend: Box<dyn StorageBackend>) -> CoreResult<RecoveryInfo> {
    let (device, candidates) = BlockDevice::open(backend)?;
    let recovered = recover(&device, &candidates, true)?;
    Ok(recovered.info)
}

/// Finds the baseline super root and, unless `read_only`, replays the log
/// written after it.
pub(crate) fn recover(
    device: &BlockDevice,
    candidates: &[SuperBlock],
    read_only: bool,
) -> CoreResult<Recovered> {
    let (superblock, baseline, full_scan) = find_baseline(device, candidates, read_only)?;
    let seed = superblock.crc_seed;
    let reader = LogReader::new(device, seed);
    let mut meta = Metadata::load(device, superblock.clone(), &baseline)?;
    let mut baseline = baseline;

    let mut region = scan_forward(&reader, &baseline);
    // A checkpoint may have reached the log without its superblock write.
    if let Some(pos) = region.iter().rposition(|lseg| lseg_has_super_root(lseg)) {
        if let Some(sr) = region[pos].last() {
            match Metadata::load(device, superblock.clone(), sr) {
                Ok(newer) => {
                    info!(
                        target: "segfs::recovery",
                        pseg = sr.start(),
                        seq = sr.header().seq,
                        "found super root newer than the superblock"
                    );
                    meta = newer;
                    baseline = sr.clone();
                    region.drain(..=pos);
                }
                Err(err) => {
                    warn!(target: "segfs::recovery", pseg = sr.start(), error = %err, "newer super root unusable");
                    region.truncate(pos);
                }
            }
        }
    }

    let mut info = RecoveryInfo {
        super_root: baseline.start(),
        super_root_seq: baseline.header().seq,
        cno: baseline.header().cno,
        full_scan,
        logical_segments: region.len() as u64,
        ..RecoveryInfo::default()
    };
    let first = region.first().and_then(|lseg| lseg.first());
    let last = region.last().and_then(|lseg| lseg.last());
    if let (Some(first), Some(last)) = (first, last) {
        info.lsegs_start = Some(first.start());
        info.lsegs_end = Some(last.start());
        info.lsegs_start_seq = first.header().seq;
    }

    if region.is_empty() || read_only {
        if !region.is_empty() {
            info!(
                target: "segfs::recovery",
                lsegs = region.len(),
                "read-only mount; roll-forward skipped"
            );
        }
        info!(
            target: "segfs::recovery",
            pseg = info.super_root,
            cno = info.cno.0,
            "mounting at super root"
        );
        return Ok(Recovered {
            meta,
            files: Vec::new(),
            info,
        });
    }

    let files = replay(device, &mut meta, &region, &mut info)?;
    info.rolled_forward = true;
    info!(
        target: "segfs::recovery",
        pseg = info.super_root,
        cno = info.cno.0,
        lsegs = info.logical_segments,
        blocks = info.replayed_blocks,
        files = files.len(),
        "rolled forward"
    );
    Ok(Recovered { meta, files, info })
}

fn lseg_has_super_root(lseg: &[PartialSegment]) -> bool {
    lseg.last().is_some_and(|p| p.has(SegFlags::SR))
}

/// Validates the super root a superblock points at.
fn validate(device: &BlockDevice, sb: &SuperBlock) -> CoreResult<PartialSegment> {
    let pseg = LogReader::new(device, sb.crc_seed).read(sb.last_pseg)?;
    if pseg.header().seq != sb.last_seq {
        return Err(CoreError::corrupt_super_root(format!(
            "partial segment at {} has seq {}, superblock expects {}",
            sb.last_pseg,
            pseg.header().seq,
            sb.last_seq
        )));
    }
    Metadata::load(device, sb.clone(), &pseg)?;
    Ok(pseg)
}

fn find_baseline(
    device: &BlockDevice,
    candidates: &[SuperBlock],
    read_only: bool,
) -> CoreResult<(SuperBlock, PartialSegment, bool)> {
    for sb in candidates {
        match validate(device, sb) {
            Ok(pseg) => {
                debug!(
                    target: "segfs::recovery",
                    generation = sb.generation,
                    pseg = sb.last_pseg,
                    "superblock points at a valid super root"
                );
                return Ok((sb.clone(), pseg, false));
            }
            Err(err) => warn!(
                target: "segfs::recovery",
                generation = sb.generation,
                pseg = sb.last_pseg,
                error = %err,
                "super root rejected"
            ),
        }
    }
    let Some(sb) = candidates.first() else {
        return Err(CoreError::invalid_format("no valid superblock"));
    };
    if !read_only {
        return Err(CoreError::corrupt_super_root(
            "no superblock points at a valid super root; mount read-only to scan the device",
        ));
    }
    let pseg = full_scan(device, sb)?;
    Ok((sb.clone(), pseg, true))
}

/// Searches every segment for the newest super root that loads.
fn full_scan(device: &BlockDevice, sb: &SuperBlock) -> CoreResult<PartialSegment> {
    let reader = LogReader::new(device, sb.crc_seed);
    let mut found: Vec<PartialSegment> = (0..device.geometry().nsegments())
        .flat_map(|segnum| reader.segment(SegNum(segnum)))
        .filter(|pseg| pseg.has(SegFlags::SR))
        .collect();
    found.sort_by(|a, b| b.header().seq.cmp(&a.header().seq));
    info!(target: "segfs::recovery", candidates = found.len(), "scanned device for super roots");
    found
        .into_iter()
        .find(|pseg| Metadata::load(device, sb.clone(), pseg).is_ok())
        .ok_or_else(|| CoreError::corrupt_super_root("no valid super root on the device"))
}

/// Complete logical segments following `baseline`, in log order.
///
/// The walk expects the sequence number to grow by one per partial
/// segment. When the partial segment after the previous one is missing or
/// stale, it tries once at the start of the segment the previous one named
/// as its successor.
fn scan_forward(reader: &LogReader<'_>, baseline: &PartialSegment) -> Vec<Vec<PartialSegment>> {
    let mut complete: Vec<Vec<PartialSegment>> = Vec::new();
    let mut open: Vec<PartialSegment> = Vec::new();
    let mut prev = baseline.clone();
    loop {
        let expected = prev.header().seq + 1;
        let next_segment = prev.header().next;
        let mut found = None;
        for start in [reader.follow_on(&prev), Some(next_segment)].into_iter().flatten() {
            match reader.read(start) {
                Ok(pseg) if pseg.header().seq == expected => {
                    found = Some(pseg);
                    break;
                }
                Ok(pseg) => debug!(
                    target: "segfs::recovery",
                    at = start,
                    seq = pseg.header().seq,
                    expected,
                    "stale partial segment"
                ),
                Err(err) => debug!(target: "segfs::recovery", at = start, error = %err, "no partial segment"),
            }
        }
        let Some(pseg) = found else { break };
        if pseg.has(SegFlags::LOGBGN) {
            open.clear();
        }
        if !open.is_empty() || pseg.has(SegFlags::LOGBGN) {
            open.push(pseg.clone());
        }
        if pseg.has(SegFlags::LOGEND) && !open.is_empty() {
            complete.push(std::mem::take(&mut open));
        }
        prev = pseg;
    }
    if !open.is_empty() {
        warn!(
            target: "segfs::recovery",
            psegs = open.len(),
            "discarding incomplete logical segment at the end of the log"
        );
    }
    complete
}

/// Overlays the region onto `meta` and collects regular-file data.
fn replay(
    device: &BlockDevice,
    meta: &mut Metadata,
    region: &[Vec<PartialSegment>],
    info: &mut RecoveryInfo,
) -> CoreResult<Vec<ReplayedFile>> {
    let geometry = *meta.geometry();
    let mut files: BTreeMap<Ino, ReplayedFile> = BTreeMap::new();
    let mut used: BTreeSet<SegNum> = BTreeSet::new();

    for pseg in region.iter().flatten() {
        used.insert(geometry.segnum_of(pseg.start()));
        for block in pseg.blocks() {
            let ino = block.info.ino;
            let blkoff = block.binfo.blkoff;
            info.replayed_blocks += 1;
            match ino {
                Ino::DAT | Ino::CPFILE | Ino::SUFILE | Ino::IFILE => {
                    let mdt = meta.mdt_mut(ino).ok_or_else(|| {
                        CoreError::protocol_violation(format!("{ino} is not a metadata file"))
                    })?;
                    if block.node {
                        let root = if ino == Ino::IFILE {
                            block.binfo.vblocknr
                        } else {
                            block.blocknr
                        };
                        mdt.bmap_mut().install_node(blkoff as usize, root, block.data);
                    } else {
                        mdt.replay_block(blkoff, block.data.to_vec())?;
                        if ino == Ino::IFILE {
                            forget_cleared(meta, &mut files, blkoff);
                        }
                    }
                }
                _ if ino.is_regular() => {
                    if block.node {
                        meta.file_bmap(device, ino)?.install_node(
                            blkoff as usize,
                            block.binfo.vblocknr,
                            block.data,
                        );
                        continue;
                    }
                    let file = files.entry(ino).or_insert_with(|| ReplayedFile {
                        ino,
                        size: 0,
                        blocks: Vec::new(),
                    });
                    file.size = block.info.size;
                    file.blocks.push((blkoff, block.data.to_vec()));
                }
                _ => {
                    return Err(CoreError::invalid_format(format!(
                        "partial segment at {} logs a block of reserved {ino}",
                        pseg.start()
                    )))
                }
            }
        }
    }

    // Files only ever written by data syncs have no inode on disk yet.
    let now = unix_now();
    for file in files.values() {
        if meta.ifile.read(file.ino).is_none() {
            meta.write_file_record(file.ino, file.size, now)?;
        }
        meta.ifile.bump_next_ino(file.ino)?;
    }

    let last = region
        .last()
        .and_then(|lseg| lseg.last())
        .ok_or_else(|| CoreError::protocol_violation("empty roll-forward region"))?;
    let header = last.header();
    meta.cursor.segnum = geometry.segnum_of(last.start());
    meta.cursor.pseg_start = last.end();
    meta.cursor.nextnum = geometry.segnum_of(header.next);
    meta.cursor.seq = header.seq + 1;
    used.insert(meta.cursor.segnum);
    used.insert(meta.cursor.nextnum);
    for segnum in &used {
        meta.sufile.mark_segment_used(*segnum, now)?;
    }
    info.used_segments = used.into_iter().collect();

    Ok(files.into_values().collect())
}

/// Drops replayed data of inodes that a replayed ifile block cleared.
fn forget_cleared(meta: &mut Metadata, files: &mut BTreeMap<Ino, ReplayedFile>, blkoff: u64) {
    let cleared: Vec<Ino> = meta
        .ifile
        .inos_in_block(blkoff)
        .filter(|ino| ino.is_regular() && meta.ifile.read(*ino).is_none())
        .collect();
    for ino in cleared {
        if files.remove(&ino).is_some() {
            debug!(target: "segfs::recovery", ino = ino.0, "replayed file was removed later");
        }
        meta.forget_file(ino);
    }
}
