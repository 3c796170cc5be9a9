//! Log head position and the allocation of the next partial segment.

use crate::layout::{Geometry, PSEG_MIN_BLOCKS};
use crate::types::{BlockNr, SegNum};

/// Position of the log head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogCursor {
    /// Segment the next partial segment is written to.
    pub(crate) segnum: SegNum,
    /// First block of the next partial segment.
    pub(crate) pseg_start: BlockNr,
    /// Segment the log continues in once `segnum` is full.
    pub(crate) nextnum: SegNum,
    /// Sequence number of the next partial segment.
    pub(crate) seq: u64,
}

impl LogCursor {
    /// Blocks left in the current segment.
    pub(crate) fn remaining(&self, geometry: &Geometry) -> u64 {
        geometry.seg_end(self.segnum).saturating_sub(self.pseg_start)
    }

    /// True when no partial segment fits in the current segment.
    pub(crate) fn exhausted(&self, geometry: &Geometry) -> bool {
        self.remaining(geometry) < PSEG_MIN_BLOCKS
    }

    /// Moves to the start of `nextnum`, which is replaced by `new_next`.
    pub(crate) fn advance(&mut self, geometry: &Geometry, new_next: SegNum) {
        self.segnum = self.nextnum;
        self.pseg_start = geometry.seg_start(self.segnum);
        self.nextnum = new_next;
    }

    /// First block of the segment the log continues in.
    pub(crate) fn next_start(&self, geometry: &Geometry) -> BlockNr {
        geometry.seg_start(self.nextnum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_to_next_segment() {
        let geo = Geometry::new(1024, 16, 8).unwrap();
        let mut cursor = LogCursor {
            segnum: SegNum(0),
            pseg_start: 1,
            nextnum: SegNum(3),
            seq: 1,
        };
        assert_eq!(cursor.remaining(&geo), 15);
        cursor.pseg_start = 15;
        assert!(cursor.exhausted(&geo));
        cursor.advance(&geo, SegNum(4));
        assert_eq!(cursor.segnum, SegNum(3));
        assert_eq!(cursor.pseg_start, 48);
        assert_eq!(cursor.next_start(&geo), 64);
        assert!(!cursor.exhausted(&geo));
    }
}
