//! Request queue shared by foreground threads and the constructor.
//!
//! Foreground threads queue a request kind and receive a [`Ticket`]; the
//! constructor accepts everything queued so far in one batch, runs a single
//! construction for it and completes every ticket up to the accepted one.

use super::Mode;
use crate::config::Config;
use crate::error::{ConstructionFailure, CoreError, CoreResult, FailureKind};
use crate::file_table::FileTable;
use crate::types::{seq_ge, seq_gt, Cno, Ino};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Stop after the current cycle.
pub(crate) const FLAG_QUIT: u32 = 0x01;
/// With `FLAG_QUIT`: stop without a final checkpoint.
pub(crate) const FLAG_HALT: u32 = 0x02;
/// Regular files changed since the last super root.
pub(crate) const FLAG_HAVE_DELTA: u32 = 0x04;
/// A logical segment without super root was written since the last one.
pub(crate) const FLAG_UNCLOSED: u32 = 0x08;
/// The last construction ran out of segments; clean before the next one.
pub(crate) const FLAG_FS_FULL: u32 = 0x10;
/// A write failed; the filesystem is read-only until remounted.
pub(crate) const FLAG_DEGRADED: u32 = 0x20;

/// Result delivered to every ticket a construction covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Completion {
    /// Latest durable checkpoint when the construction finished.
    pub cno: Cno,
    /// Segments freed by a cleaning pass.
    pub segments_cleaned: u64,
}

pub(crate) type Reply = Result<Completion, ConstructionFailure>;

/// The request, accepted and done sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceCounters {
    /// Last ticket handed out.
    pub request: u32,
    /// Last ticket taken by a construction.
    pub accepted: u32,
    /// Last ticket whose construction finished.
    pub done: u32,
}

/// Handle on a queued request.
///
/// The completion is delivered over a channel, so a waiter that starts
/// waiting after its construction finished still gets the result.
#[derive(Debug)]
pub struct Ticket {
    seq: u32,
    rx: Receiver<Reply>,
}

impl Ticket {
    /// Sequence number of the request.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Blocks until a construction covering this ticket finished.
    ///
    /// # Errors
    ///
    /// Returns the construction's error, or `Shutdown` if the constructor
    /// stopped without serving the ticket.
    pub fn wait(self) -> CoreResult<Completion> {
        match self.rx.recv() {
            Ok(reply) => reply.map_err(CoreError::from),
            Err(_) => Err(CoreError::Shutdown),
        }
    }

    /// Like [`Ticket::wait`], giving up after `timeout`.
    ///
    /// The construction keeps running when the wait gives up.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` on timeout, otherwise as [`Ticket::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> CoreResult<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(reply) => reply.map_err(CoreError::from),
            Err(RecvTimeoutError::Timeout) => Err(CoreError::Interrupted),
            Err(RecvTimeoutError::Disconnected) => Err(CoreError::Shutdown),
        }
    }
}

/// A request kind as issued by a foreground thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    /// sync(2): write a super root if anything changed.
    Checkpoint,
    /// Write a super root even if nothing changed.
    ForcedCheckpoint,
    /// Write dirty blocks; a super root only if one is overdue.
    Flush,
    /// Make one file's blocks in `[first, last]` durable.
    Dsync { ino: Ino, first: u64, last: u64 },
    /// Run a cleaning pass.
    Gc,
}

/// Request kinds accepted together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Pending {
    pub(crate) checkpoint: bool,
    pub(crate) forced: bool,
    pub(crate) flush: bool,
    pub(crate) gc: bool,
    pub(crate) timer: bool,
    pub(crate) dsync: Option<(Ino, u64, u64)>,
    /// Dsync requests for more than one file were merged into a flush.
    dsync_spread: bool,
}

impl Pending {
    fn add(&mut self, request: Request) {
        match request {
            Request::Checkpoint => self.checkpoint = true,
            Request::ForcedCheckpoint => self.forced = true,
            Request::Flush => self.flush = true,
            Request::Gc => self.gc = true,
            Request::Dsync { first, last, .. } if first > last => {}
            Request::Dsync { ino, first, last } => match self.dsync {
                None if !self.dsync_spread => self.dsync = Some((ino, first, last)),
                Some((queued, lo, hi)) if queued == ino => {
                    self.dsync = Some((ino, lo.min(first), hi.max(last)));
                }
                _ => {
                    self.dsync = None;
                    self.dsync_spread = true;
                    self.flush = true;
                }
            },
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The dsync target if it is the only thing asked for.
    fn dsync_only(&self) -> Option<(Ino, u64, u64)> {
        let alone = !(self.checkpoint || self.forced || self.flush || self.gc || self.timer);
        self.dsync.filter(|_| alone)
    }
}

/// Everything guarded by the state lock.
#[derive(Debug)]
pub(crate) struct ScState {
    seq_request: u32,
    seq_accepted: u32,
    seq_done: u32,
    pub(crate) pending: Pending,
    waiters: Vec<(u32, Sender<Reply>)>,
    pub(crate) files: FileTable,
    flags: u32,
    pub(crate) last_checkpoint: Instant,
    /// Latest durable checkpoint, for requests that need no construction.
    pub(crate) last_cno: Cno,
}

impl ScState {
    pub(crate) fn new(files: FileTable, last_cno: Cno) -> Self {
        Self {
            seq_request: 0,
            seq_accepted: 0,
            seq_done: 0,
            pending: Pending::default(),
            waiters: Vec::new(),
            files,
            flags: 0,
            last_checkpoint: Instant::now(),
            last_cno,
        }
    }

    pub(crate) fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub(crate) fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub(crate) fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags
    }

    /// True if changes exist that no super root covers yet.
    pub(crate) fn has_unwritten_changes(&self) -> bool {
        self.files.has_dirty_files() || self.has_flag(FLAG_HAVE_DELTA | FLAG_UNCLOSED)
    }

    /// Queues `request` and hands out the next ticket.
    pub(crate) fn request(&mut self, request: Request) -> Ticket {
        self.seq_request = self.seq_request.wrapping_add(1);
        let (tx, rx) = bounded(1);
        self.waiters.push((self.seq_request, tx));
        self.pending.add(request);
        Ticket {
            seq: self.seq_request,
            rx,
        }
    }

    /// True if a ticket was handed out that no construction has taken.
    pub(crate) fn has_requests(&self) -> bool {
        seq_gt(self.seq_request, self.seq_accepted) || !self.pending.is_empty()
    }

    /// Takes every queued request as one batch.
    pub(crate) fn accept(&mut self) -> (u32, Pending) {
        self.seq_accepted = self.seq_request;
        (self.seq_accepted, std::mem::take(&mut self.pending))
    }

    /// Completes every ticket up to and including `seq`.
    pub(crate) fn complete(&mut self, seq: u32, reply: &Reply) {
        if seq_gt(seq, self.seq_done) {
            self.seq_done = seq;
        }
        let done = self.seq_done;
        self.waiters.retain(|(ticket, tx)| {
            if seq_ge(done, *ticket) {
                // The waiter may have dropped its ticket.
                let _ = tx.try_send(reply.clone());
                false
            } else {
                true
            }
        });
    }

    /// Fails every outstanding ticket.
    pub(crate) fn fail_outstanding(&mut self, kind: FailureKind, message: &str) {
        let failure = ConstructionFailure {
            kind,
            message: message.to_string(),
        };
        self.seq_accepted = self.seq_request;
        self.complete(self.seq_request, &Err(failure));
    }

    pub(crate) fn counters(&self) -> SequenceCounters {
        SequenceCounters {
            request: self.seq_request,
            accepted: self.seq_accepted,
            done: self.seq_done,
        }
    }
}

/// Inputs to the mode decision besides the pending kinds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirtyState {
    pub(crate) files: bool,
    pub(crate) blocks: u64,
    pub(crate) checkpoint_age: Duration,
}

/// Picks the construction mode for an accepted batch, or `None` if no
/// construction is needed.
pub(crate) fn decide(pending: &Pending, flags: u32, dirty: DirtyState, config: &Config) -> Option<Mode> {
    let delta = flags & (FLAG_HAVE_DELTA | FLAG_UNCLOSED) != 0;
    let anything = dirty.files || delta;
    let overdue =
        dirty.checkpoint_age >= config.max_checkpoint_age || dirty.blocks > config.dirty_watermark;

    if pending.gc || flags & FLAG_FS_FULL != 0 {
        return Some(Mode::Checkpoint { gc: true });
    }
    if pending.forced {
        return Some(Mode::Checkpoint { gc: false });
    }
    if pending.checkpoint {
        return anything.then_some(Mode::Checkpoint { gc: false });
    }
    if let Some((ino, first, last)) = pending.dsync_only() {
        if !dirty.files {
            return None;
        }
        return Some(if overdue {
            Mode::Checkpoint { gc: false }
        } else {
            Mode::Dsync { ino, first, last }
        });
    }
    if pending.flush || pending.dsync.is_some() {
        return match (dirty.files, overdue) {
            (true, true) => Some(Mode::Checkpoint { gc: false }),
            (true, false) => Some(Mode::Flush),
            (false, true) if delta => Some(Mode::Checkpoint { gc: false }),
            (false, _) => None,
        };
    }
    if pending.timer {
        return anything.then_some(Mode::Checkpoint { gc: false });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirty(files: bool, blocks: u64, age_secs: u64) -> DirtyState {
        DirtyState {
            files,
            blocks,
            checkpoint_age: Duration::from_secs(age_secs),
        }
    }

    fn config() -> Config {
        Config::default()
            .max_checkpoint_age(Duration::from_secs(60))
            .dirty_watermark(100)
    }

    fn pending(requests: &[Request]) -> Pending {
        let mut p = Pending::default();
        for r in requests {
            p.add(*r);
        }
        p
    }

    #[test]
    fn tickets_complete_in_batches() {
        let mut state = ScState::new(FileTable::new(), Cno::new(0));
        let t1 = state.request(Request::Flush);
        let t2 = state.request(Request::Checkpoint);
        assert_eq!((t1.seq(), t2.seq()), (1, 2));

        let (seq, accepted) = state.accept();
        assert_eq!(seq, 2);
        assert!(accepted.flush && accepted.checkpoint);
        let t3 = state.request(Request::Flush);

        let done = Completion {
            cno: Cno::new(4),
            segments_cleaned: 0,
        };
        state.complete(seq, &Ok(done));
        assert_eq!(t1.wait().unwrap(), done);
        assert_eq!(t2.wait().unwrap(), done);
        assert!(matches!(
            t3.wait_timeout(Duration::from_millis(10)),
            Err(CoreError::Interrupted)
        ));
        assert_eq!(
            state.counters(),
            SequenceCounters {
                request: 3,
                accepted: 2,
                done: 2
            }
        );
    }

    #[test]
    fn done_never_moves_backwards() {
        let mut state = ScState::new(FileTable::new(), Cno::new(0));
        for _ in 0..5 {
            state.request(Request::Flush);
        }
        state.complete(5, &Ok(Completion { cno: Cno::new(1), segments_cleaned: 0 }));
        state.complete(3, &Ok(Completion { cno: Cno::new(1), segments_cleaned: 0 }));
        assert_eq!(state.counters().done, 5);
    }

    #[test]
    fn counters_wrap() {
        let mut state = ScState::new(FileTable::new(), Cno::new(0));
        state.seq_request = u32::MAX;
        state.seq_accepted = u32::MAX;
        state.seq_done = u32::MAX;
        let ticket = state.request(Request::Flush);
        assert_eq!(ticket.seq(), 0);
        assert!(state.has_requests());
        let (seq, _) = state.accept();
        state.complete(seq, &Ok(Completion { cno: Cno::new(1), segments_cleaned: 0 }));
        assert_eq!(state.counters().done, 0);
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn failures_reach_every_covered_ticket() {
        let mut state = ScState::new(FileTable::new(), Cno::new(0));
        let a = state.request(Request::Checkpoint);
        let b = state.request(Request::Dsync { ino: Ino::new(11), first: 0, last: 3 });
        state.fail_outstanding(FailureKind::Io, "device gone");
        assert!(matches!(a.wait(), Err(CoreError::Io(_))));
        assert!(matches!(b.wait(), Err(CoreError::Io(_))));
    }

    #[test]
    fn inverted_dsync_range_is_ignored() {
        let p = pending(&[Request::Dsync { ino: Ino::new(11), first: 5, last: 1 }]);
        assert!(p.is_empty());
        let p = pending(&[
            Request::Dsync { ino: Ino::new(11), first: 0, last: 2 },
            Request::Dsync { ino: Ino::new(11), first: 9, last: 3 },
        ]);
        assert_eq!(p.dsync, Some((Ino::new(11), 0, 2)));
    }

    #[test]
    fn unserved_tickets_still_complete() {
        let mut state = ScState::new(FileTable::new(), Cno::new(0));
        let ticket = state.request(Request::Dsync { ino: Ino::new(11), first: 5, last: 1 });
        assert!(state.has_requests());
        let (seq, accepted) = state.accept();
        assert!(accepted.is_empty());
        state.complete(seq, &Ok(Completion { cno: Cno::new(1), segments_cleaned: 0 }));
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn dsync_for_two_files_becomes_a_flush() {
        let p = pending(&[
            Request::Dsync { ino: Ino::new(11), first: 0, last: 1 },
            Request::Dsync { ino: Ino::new(11), first: 4, last: 6 },
        ]);
        assert_eq!(p.dsync, Some((Ino::new(11), 0, 6)));
        let p = pending(&[
            Request::Dsync { ino: Ino::new(11), first: 0, last: 1 },
            Request::Dsync { ino: Ino::new(12), first: 0, last: 1 },
            Request::Dsync { ino: Ino::new(11), first: 0, last: 1 },
        ]);
        assert_eq!(p.dsync, None);
        assert!(p.flush);
        assert_eq!(decide(&p, 0, dirty(true, 1, 0), &config()), Some(Mode::Flush));
    }

    #[test]
    fn mode_decision() {
        let cfg = config();
        let cp = Mode::Checkpoint { gc: false };

        // Explicit sync only writes when something changed.
        let sync = pending(&[Request::Checkpoint]);
        assert_eq!(decide(&sync, 0, dirty(true, 1, 0), &cfg), Some(cp));
        assert_eq!(decide(&sync, FLAG_UNCLOSED, dirty(false, 0, 0), &cfg), Some(cp));
        assert_eq!(decide(&sync, 0, dirty(false, 0, 0), &cfg), None);

        let forced = pending(&[Request::ForcedCheckpoint]);
        assert_eq!(decide(&forced, 0, dirty(false, 0, 0), &cfg), Some(cp));

        let gc = pending(&[Request::Gc]);
        assert_eq!(
            decide(&gc, 0, dirty(false, 0, 0), &cfg),
            Some(Mode::Checkpoint { gc: true })
        );
        let flush = pending(&[Request::Flush]);
        assert_eq!(
            decide(&flush, FLAG_FS_FULL, dirty(true, 1, 0), &cfg),
            Some(Mode::Checkpoint { gc: true })
        );

        // Flushes upgrade when a checkpoint is overdue.
        assert_eq!(decide(&flush, 0, dirty(true, 1, 0), &cfg), Some(Mode::Flush));
        assert_eq!(decide(&flush, 0, dirty(true, 1, 61), &cfg), Some(cp));
        assert_eq!(decide(&flush, 0, dirty(true, 101, 0), &cfg), Some(cp));
        assert_eq!(decide(&flush, 0, dirty(false, 0, 0), &cfg), None);

        let ino = Ino::new(11);
        let dsync = pending(&[Request::Dsync { ino, first: 0, last: 9 }]);
        assert_eq!(
            decide(&dsync, 0, dirty(true, 2, 0), &cfg),
            Some(Mode::Dsync { ino, first: 0, last: 9 })
        );
        assert_eq!(decide(&dsync, 0, dirty(true, 2, 120), &cfg), Some(cp));
        assert_eq!(decide(&dsync, 0, dirty(false, 0, 0), &cfg), None);

        let mut timer = Pending::default();
        timer.timer = true;
        assert_eq!(decide(&timer, 0, dirty(false, 0, 0), &cfg), None);
        assert_eq!(decide(&timer, FLAG_HAVE_DELTA, dirty(false, 0, 0), &cfg), Some(cp));
        assert_eq!(decide(&timer, 0, dirty(true, 1, 0), &cfg), Some(cp));
    }
}
