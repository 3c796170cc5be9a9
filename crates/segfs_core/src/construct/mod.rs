//! The segment constructor.
//!
//! A construction turns a snapshot of the dirty set into a chain of partial
//! segments. [`Stage`] orders the collection, the request queue hands out
//! tickets, and the constructor thread runs one construction per batch of
//! accepted requests.

mod construction;
mod request;
mod segctor;
mod stage;

pub(crate) use construction::{Construction, ConstructionReport};
pub(crate) use request::{Request, ScState, FLAG_DEGRADED, FLAG_HALT, FLAG_QUIT};
pub use request::{Completion, SequenceCounters, Ticket};
pub(crate) use segctor::{run_construction, settle, spawn_segctor, SegctorHandle, Shared};
pub(crate) use stage::Progress;
pub use stage::{Phase, Stage};

use crate::types::Ino;

/// What a construction writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Everything dirty, sealed by a super root. `gc` adds a cleaning pass.
    Checkpoint { gc: bool },
    /// Everything dirty, without a super root.
    Flush,
    /// Only the in-range data blocks of one file.
    Dsync { ino: Ino, first: u64, last: u64 },
}

impl Mode {
    pub(crate) const fn is_checkpoint(self) -> bool {
        matches!(self, Self::Checkpoint { .. })
    }

    pub(crate) const fn is_dsync(self) -> bool {
        matches!(self, Self::Dsync { .. })
    }

    pub(crate) const fn is_gc(self) -> bool {
        matches!(self, Self::Checkpoint { gc: true })
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Checkpoint { gc: false } => "checkpoint",
            Self::Checkpoint { gc: true } => "checkpoint+gc",
            Self::Flush => "flush",
            Self::Dsync { .. } => "dsync",
        }
    }
}
