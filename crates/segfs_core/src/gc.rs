//! Segment cleaner.
//!
//! A cleaning construction picks victim segments, finds the blocks in them
//! that are still referenced, and rewrites those at the log head. Victims
//! are freed in the segment usage stage of the same construction and stay
//! quarantined until its super root is durable.

use crate::device::BlockDevice;
use crate::error::CoreResult;
use crate::layout::NROOTS;
use crate::metadata::Metadata;
use crate::segment::{LogReader, LoggedBlock};
use crate::types::{BlockNr, Ino, SegNum, VBlockNr};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// A live regular-file block that moves to the log head.
#[derive(Debug, Clone)]
pub(crate) struct GcRelocation {
    pub(crate) ino: Ino,
    /// Block offset, or node index for node blocks.
    pub(crate) blkoff: u64,
    pub(crate) vblocknr: VBlockNr,
    pub(crate) node: bool,
    pub(crate) size: u64,
    pub(crate) data: Arc<Vec<u8>>,
}

/// Outcome of scanning the victims.
#[derive(Debug, Default)]
pub(crate) struct GcPlan {
    pub(crate) relocations: Vec<GcRelocation>,
    /// Live metadata blocks re-dirtied in their caches.
    pub(crate) redirtied: u64,
}

/// Picks up to `max` in-use segments, least recently written first.
pub(crate) fn select_victims(
    meta: &Metadata,
    exclude: &BTreeSet<SegNum>,
    max: usize,
) -> Vec<SegNum> {
    let mut candidates: Vec<_> = meta
        .sufile
        .dirty_segments()
        .into_iter()
        .filter(|(segnum, _)| !exclude.contains(segnum))
        .collect();
    candidates.sort_by_key(|(segnum, usage)| (usage.lastmod, *segnum));
    candidates.into_iter().take(max).map(|(s, _)| s).collect()
}

/// Walks every victim and sorts its live blocks.
///
/// Virtual blocks already placed by this construction are skipped; they
/// were rewritten from the page cache.
pub(crate) fn scan(
    meta: &mut Metadata,
    device: &BlockDevice,
    seed: u32,
    victims: &[SegNum],
    assigned: &BTreeSet<VBlockNr>,
) -> CoreResult<GcPlan> {
    let reader = LogReader::new(device, seed);
    let mut plan = GcPlan::default();
    for &victim in victims {
        let psegs = reader.segment(victim);
        debug!(target: "segfs::gc", segnum = victim.0, psegs = psegs.len(), "scanning victim");
        for pseg in &psegs {
            for block in pseg.blocks() {
                if is_live_metadata(meta, &block)? {
                    plan.redirtied += 1;
                    continue;
                }
                if !block.info.ino.is_regular() || assigned.contains(&block.binfo.vblocknr) {
                    continue;
                }
                if translates_to(meta, block.binfo.vblocknr, block.blocknr) {
                    trace!(
                        target: "segfs::gc",
                        ino = block.info.ino.0,
                        blkoff = block.binfo.blkoff,
                        node = block.node,
                        from = block.blocknr,
                        "live block"
                    );
                    plan.relocations.push(GcRelocation {
                        ino: block.info.ino,
                        blkoff: block.binfo.blkoff,
                        vblocknr: block.binfo.vblocknr,
                        node: block.node,
                        size: block.info.size,
                        data: Arc::new(block.data.to_vec()),
                    });
                }
            }
        }
    }
    Ok(plan)
}

fn translates_to(meta: &Metadata, vblocknr: VBlockNr, blocknr: BlockNr) -> bool {
    vblocknr != 0 && matches!(meta.dat.translate(vblocknr), Ok(Some(at)) if at == blocknr)
}

/// Re-dirties a live metadata block so the construction rewrites it.
fn is_live_metadata(meta: &mut Metadata, block: &LoggedBlock<'_>) -> CoreResult<bool> {
    let ino = block.info.ino;
    let blkoff = block.binfo.blkoff;
    match ino {
        Ino::IFILE => {
            if !translates_to(meta, block.binfo.vblocknr, block.blocknr) {
                return Ok(false);
            }
            let mdt = meta.ifile.mdt_mut();
            if block.node {
                mdt.bmap_mut().mark_node_dirty(blkoff as usize);
            } else {
                mdt.mark_dirty(blkoff)?;
            }
            Ok(true)
        }
        Ino::DAT | Ino::CPFILE | Ino::SUFILE => {
            let Some(mdt) = meta.mdt_mut(ino) else {
                return Ok(false);
            };
            if block.node {
                let idx = blkoff as usize;
                if idx >= NROOTS || mdt.bmap().root(idx) != block.blocknr {
                    return Ok(false);
                }
                mdt.bmap_mut().mark_node_dirty(idx);
            } else {
                if mdt.bmap().lookup(blkoff) != Some(block.blocknr) {
                    return Ok(false);
                }
                mdt.mark_dirty(blkoff)?;
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Geometry, SuperBlock, SB_STATE_CLEAN};
    use crate::types::Cno;

    fn metadata() -> Metadata {
        let geo = Geometry::new(1024, 16, 8).unwrap();
        let sb = SuperBlock {
            state: SB_STATE_CLEAN,
            block_size: 1024,
            blocks_per_segment: 16,
            nsegments: 8,
            crc_seed: 7,
            reserved_segments_percent: 0,
            last_pseg: 0,
            last_seq: 0,
            last_cno: Cno::new(0),
            wtime: 0,
            generation: 0,
        };
        Metadata::format(geo, sb, 1).unwrap()
    }

    #[test]
    fn victims_are_oldest_first_and_skip_excluded() {
        let mut meta = metadata();
        assert_eq!(meta.sufile.alloc_segment(false, 50).unwrap(), SegNum(2));
        assert_eq!(meta.sufile.alloc_segment(false, 20).unwrap(), SegNum(3));

        let exclude: BTreeSet<_> = [SegNum(0)].into_iter().collect();
        assert_eq!(select_victims(&meta, &exclude, 2), vec![SegNum(1), SegNum(3)]);
        assert_eq!(select_victims(&meta, &exclude, 10).len(), 3);
        assert!(select_victims(&meta, &exclude, 0).is_empty());
    }

    #[test]
    fn unmapped_virtual_blocks_are_dead() {
        let mut meta = metadata();
        assert!(!translates_to(&meta, 0, 5));
        let v = meta.dat.alloc(Cno::new(1)).unwrap();
        assert!(!translates_to(&meta, v, 5));
        meta.dat.update(v, 5).unwrap();
        assert!(translates_to(&meta, v, 5));
        assert!(!translates_to(&meta, v, 6));
        // Numbers past the end of the table are not an error here.
        assert!(!translates_to(&meta, v + 1000, 5));
    }
}
