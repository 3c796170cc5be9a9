//! Filesystem statistics.
//!
//! Counters are atomic and can be read while a construction is running.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters of one mounted filesystem.
#[derive(Debug, Default)]
pub struct FsStats {
    /// Blocks written by foreground writes.
    blocks_dirtied: AtomicU64,
    /// Constructions that reached the device.
    constructions: AtomicU64,
    /// Constructions that sealed a super root.
    checkpoints: AtomicU64,
    /// Data-sync constructions.
    dsyncs: AtomicU64,
    /// Constructions that failed before or during I/O.
    failures: AtomicU64,
    /// Partial segments written.
    psegs_written: AtomicU64,
    /// Blocks written to the log, summaries included.
    blocks_written: AtomicU64,
    /// Segments reclaimed by the cleaner.
    segments_cleaned: AtomicU64,
    /// Live blocks the cleaner moved.
    blocks_relocated: AtomicU64,
    /// Blocks replayed at mount.
    blocks_replayed: AtomicU64,
}

impl FsStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_dirtied(&self, blocks: u64) {
        self.blocks_dirtied.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn record_construction(&self, checkpoint: bool, dsync: bool, psegs: u64, blocks: u64) {
        self.constructions.fetch_add(1, Ordering::Relaxed);
        if checkpoint {
            self.checkpoints.fetch_add(1, Ordering::Relaxed);
        }
        if dsync {
            self.dsyncs.fetch_add(1, Ordering::Relaxed);
        }
        self.psegs_written.fetch_add(psegs, Ordering::Relaxed);
        self.blocks_written.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cleaning(&self, segments: u64, relocated: u64) {
        self.segments_cleaned.fetch_add(segments, Ordering::Relaxed);
        self.blocks_relocated.fetch_add(relocated, Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self, blocks: u64) {
        self.blocks_replayed.fetch_add(blocks, Ordering::Relaxed);
    }

    /// Returns the number of constructions that sealed a super root.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns the number of failed constructions.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_dirtied: self.blocks_dirtied.load(Ordering::Relaxed),
            constructions: self.constructions.load(Ordering::Relaxed),
            checkpoints: self.checkpoints(),
            dsyncs: self.dsyncs.load(Ordering::Relaxed),
            failures: self.failures(),
            psegs_written: self.psegs_written.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            segments_cleaned: self.segments_cleaned.load(Ordering::Relaxed),
            blocks_relocated: self.blocks_relocated.load(Ordering::Relaxed),
            blocks_replayed: self.blocks_replayed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`FsStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Blocks written by foreground writes.
    pub blocks_dirtied: u64,
    /// Constructions that reached the device.
    pub constructions: u64,
    /// Constructions that sealed a super root.
    pub checkpoints: u64,
    /// Data-sync constructions.
    pub dsyncs: u64,
    /// Failed constructions.
    pub failures: u64,
    /// Partial segments written.
    pub psegs_written: u64,
    /// Blocks written to the log.
    pub blocks_written: u64,
    /// Segments reclaimed by the cleaner.
    pub segments_cleaned: u64,
    /// Live blocks moved by the cleaner.
    pub blocks_relocated: u64,
    /// Blocks replayed at mount.
    pub blocks_replayed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = FsStats::new();
        stats.record_dirtied(3);
        stats.record_construction(true, false, 2, 40);
        stats.record_construction(false, true, 1, 3);
        stats.record_failure();
        stats.record_cleaning(2, 17);

        let snap = stats.snapshot();
        assert_eq!(snap.blocks_dirtied, 3);
        assert_eq!(snap.constructions, 2);
        assert_eq!(snap.checkpoints, 1);
        assert_eq!(snap.dsyncs, 1);
        assert_eq!(snap.psegs_written, 3);
        assert_eq!(snap.blocks_written, 43);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.segments_cleaned, 2);
        assert_eq!(snap.blocks_relocated, 17);
    }
}
