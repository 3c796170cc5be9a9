//! Collection stages and constructor phases.
//!
//! Both are published through atomics so that readers never need the
//! metadata lock a running construction holds.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Collection stages, in the order a construction runs them.
///
/// Later stages record the addresses chosen for earlier ones, so a
/// construction never goes back to an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum Stage {
    /// Checkpoint entry creation and log head setup.
    Init = 0,
    /// Dirty regular files.
    File = 1,
    /// Live blocks of cleaned segments.
    Gc = 2,
    /// Inode file.
    Ifile = 3,
    /// Virtual block translation table.
    Dat = 4,
    /// Checkpoint file.
    Cpfile = 5,
    /// Segment usage file.
    Sufile = 6,
    /// Super root.
    SuperRoot = 7,
    /// Collection finished.
    Done = 8,
}

impl Stage {
    /// Stage following `self`; `Done` is terminal.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Init => Self::File,
            Self::File => Self::Gc,
            Self::Gc => Self::Ifile,
            Self::Ifile => Self::Dat,
            Self::Dat => Self::Cpfile,
            Self::Cpfile => Self::Sufile,
            Self::Sufile => Self::SuperRoot,
            Self::SuperRoot | Self::Done => Self::Done,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::File,
            2 => Self::Gc,
            3 => Self::Ifile,
            4 => Self::Dat,
            5 => Self::Cpfile,
            6 => Self::Sufile,
            7 => Self::SuperRoot,
            _ => Self::Done,
        }
    }
}

/// Phase of the segment constructor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Phase {
    /// Waiting for a request or the timer.
    Idle = 0,
    /// Taking a snapshot of the dirty set.
    Accepting = 1,
    /// Running the collection stages.
    Collecting = 2,
    /// Writing the buffer chain.
    Writing = 3,
    /// Stopped.
    Quit = 4,
}

impl Phase {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Accepting,
            2 => Self::Collecting,
            3 => Self::Writing,
            _ => Self::Quit,
        }
    }
}

const NO_STAGE: u8 = u8::MAX;

/// Phase and stage, readable from any thread.
#[derive(Debug)]
pub(crate) struct Progress {
    phase: AtomicU8,
    stage: AtomicU8,
    /// Stage the last aborted construction stopped in.
    aborted: AtomicU8,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            stage: AtomicU8::new(Stage::Done as u8),
            aborted: AtomicU8::new(NO_STAGE),
        }
    }
}

impl Progress {
    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    pub(crate) fn aborted_at(&self) -> Option<Stage> {
        match self.aborted.load(Ordering::Acquire) {
            NO_STAGE => None,
            value => Some(Stage::from_u8(value)),
        }
    }

    /// Records the running stage as aborted and resets it to `Done`.
    pub(crate) fn abort(&self) -> Stage {
        let stage = self.stage.swap(Stage::Done as u8, Ordering::AcqRel);
        self.aborted.store(stage, Ordering::Release);
        Stage::from_u8(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_only_move_forward() {
        let mut stage = Stage::Init;
        let mut seen = vec![stage];
        while stage != Stage::Done {
            let next = stage.next();
            assert!(next > stage);
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(Stage::Done.next(), Stage::Done);
    }

    #[test]
    fn progress_round_trips_through_atomics() {
        let progress = Progress::default();
        assert_eq!(progress.phase(), Phase::Idle);
        assert_eq!(progress.stage(), Stage::Done);

        progress.set_phase(Phase::Writing);
        progress.set_stage(Stage::Cpfile);
        assert_eq!(progress.phase(), Phase::Writing);
        assert_eq!(progress.stage(), Stage::Cpfile);
        assert_eq!(progress.aborted_at(), None);

        assert_eq!(progress.abort(), Stage::Cpfile);
        assert_eq!(progress.stage(), Stage::Done);
        assert_eq!(progress.aborted_at(), Some(Stage::Cpfile));
    }
}
