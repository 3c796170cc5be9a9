//! The segment constructor thread.
//!
//! One thread per mounted filesystem. It sleeps until a request arrives or
//! its timer fires, takes every queued request as one batch, runs a single
//! construction for the batch and completes the batch's tickets.

use super::request::{decide, DirtyState, Reply, FLAG_FS_FULL, FLAG_HAVE_DELTA, FLAG_UNCLOSED};
use super::{
    Completion, Construction, ConstructionReport, Mode, Phase, Progress, Request, ScState, Ticket,
    FLAG_DEGRADED, FLAG_HALT, FLAG_QUIT,
};
use crate::config::Config;
use crate::device::BlockDevice;
use crate::error::{ConstructionFailure, CoreError, CoreResult, FailureKind};
use crate::file_table::{FileTable, SnapshotFile};
use crate::metadata::Metadata;
use crate::stats::FsStats;
use crate::types::{unix_now, Ino};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// State shared by foreground threads, the constructor and the drop queue.
///
/// Lock order: `state` before any file lock, `meta` before any file lock,
/// `state` before `meta`. Nothing takes `state` while holding `meta`.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) device: BlockDevice,
    pub(crate) config: Config,
    pub(crate) state: Mutex<ScState>,
    pub(crate) wake: Condvar,
    pub(crate) meta: Mutex<Metadata>,
    pub(crate) progress: Progress,
    pub(crate) stats: FsStats,
}

impl Shared {
    pub(crate) fn new(device: BlockDevice, config: Config, meta: Metadata, files: FileTable) -> Self {
        let last_cno = meta.last_cno();
        Self {
            device,
            config,
            state: Mutex::new(ScState::new(files, last_cno)),
            wake: Condvar::new(),
            meta: Mutex::new(meta),
            progress: Progress::default(),
            stats: FsStats::new(),
        }
    }

    /// Queues a request and wakes the constructor.
    pub(crate) fn request(&self, request: Request) -> Ticket {
        let ticket = self.state.lock().request(request);
        self.wake.notify_all();
        ticket
    }

    /// Asks the constructor to stop; with `halt` it skips the final
    /// checkpoint.
    pub(crate) fn stop(&self, halt: bool) {
        let mut state = self.state.lock();
        state.set_flag(FLAG_QUIT);
        if halt {
            state.set_flag(FLAG_HALT);
        }
        drop(state);
        self.wake.notify_all();
    }
}

/// Join handle of the constructor thread.
#[derive(Debug)]
pub(crate) struct SegctorHandle {
    thread: Option<JoinHandle<()>>,
}

impl SegctorHandle {
    /// Waits for the thread to exit. Later calls return immediately.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(target: "segfs::segctor", "segment constructor panicked");
            }
        }
    }
}

/// Starts the constructor thread.
pub(crate) fn spawn_segctor(shared: Arc<Shared>, drops: Sender<Ino>) -> CoreResult<SegctorHandle> {
    let thread = thread::Builder::new()
        .name("segctord".to_string())
        .spawn(move || run(&shared, &drops))?;
    Ok(SegctorHandle {
        thread: Some(thread),
    })
}

fn run(shared: &Shared, drops: &Sender<Ino>) {
    info!(
        target: "segfs::segctor",
        interval_ms = shared.config.interval.as_millis() as u64,
        "segment constructor started"
    );
    let mut state = shared.state.lock();
    loop {
        if state.has_flag(FLAG_QUIT) {
            break;
        }
        if !state.has_requests() {
            shared.progress.set_phase(Phase::Idle);
            let deadline = Instant::now() + shared.config.interval;
            let timed_out = shared.wake.wait_until(&mut state, deadline).timed_out();
            if state.has_flag(FLAG_QUIT) {
                break;
            }
            if timed_out {
                state.pending.timer = true;
            } else if !state.has_requests() {
                continue;
            }
        }
        cycle(shared, &mut state, Some(drops));
    }

    if state.has_flag(FLAG_HALT) {
        debug!(target: "segfs::segctor", "halted without final checkpoint");
    } else if !state.has_flag(FLAG_DEGRADED) {
        state.pending.timer = true;
        cycle(shared, &mut state, Some(drops));
    }
    state.fail_outstanding(FailureKind::Shutdown, "segment constructor stopped");
    shared.progress.set_phase(Phase::Quit);
    info!(target: "segfs::segctor", "segment constructor stopped");
}

/// Serves one batch of requests. Called with the state lock held; the lock
/// is released while the construction runs.
fn cycle(shared: &Shared, state: &mut MutexGuard<'_, ScState>, drops: Option<&Sender<Ino>>) {
    shared.progress.set_phase(Phase::Accepting);
    let (seq, pending) = state.accept();

    if shared.config.read_only || state.has_flag(FLAG_DEGRADED) {
        let failure = ConstructionFailure::from(&CoreError::ReadOnly);
        state.complete(seq, &Err(failure));
        return;
    }

    let dirty = DirtyState {
        files: state.files.has_dirty_files(),
        blocks: state.files.ndirty_blocks(),
        checkpoint_age: state.last_checkpoint.elapsed(),
    };
    let Some(mode) = decide(&pending, state.flags(), dirty, &shared.config) else {
        let done = Completion {
            cno: state.last_cno,
            segments_cleaned: 0,
        };
        state.complete(seq, &Ok(done));
        return;
    };

    let files = match mode {
        Mode::Dsync { ino, first, last } => state.files.snapshot_range(ino, first, last),
        _ => state.files.snapshot_all(),
    };
    if mode.is_dsync() && files.is_empty() {
        let done = Completion {
            cno: state.last_cno,
            segments_cleaned: 0,
        };
        state.complete(seq, &Ok(done));
        return;
    }
    debug!(
        target: "segfs::segctor",
        seq,
        mode = mode.name(),
        files = files.len(),
        "accepted requests"
    );

    shared.progress.set_phase(Phase::Collecting);
    let result = MutexGuard::unlocked(state, || run_construction(shared, mode, &files));
    let reply = settle(state, mode, &files, result, drops);
    shared.progress.set_phase(Phase::Idle);
    state.complete(seq, &reply);
}

/// Runs one construction under the metadata lock and records its outcome.
pub(crate) fn run_construction(
    shared: &Shared,
    mode: Mode,
    files: &[SnapshotFile],
) -> CoreResult<ConstructionReport> {
    let mut meta = shared.meta.lock();
    let result = Construction::new(
        &mut meta,
        &shared.device,
        &shared.progress,
        mode,
        unix_now(),
        shared.config.gc_segments_per_pass,
    )
    .run(files);
    match &result {
        Ok(report) => {
            shared.stats.record_construction(
                report.checkpoint,
                mode.is_dsync(),
                report.psegs,
                report.blocks,
            );
            if mode.is_gc() {
                shared
                    .stats
                    .record_cleaning(report.segments_cleaned, report.relocated);
            }
        }
        Err(_) => shared.stats.record_failure(),
    }
    result
}

/// Applies the outcome of a construction to the file table and flags.
///
/// On success the taken blocks are released and files waiting to be
/// dropped are handed to the drop queue. On failure every taken block that
/// was not rewritten meanwhile becomes dirty again.
pub(crate) fn settle(
    state: &mut ScState,
    mode: Mode,
    files: &[SnapshotFile],
    result: CoreResult<ConstructionReport>,
    drops: Option<&Sender<Ino>>,
) -> Reply {
    match result {
        Ok(report) => {
            for snap in files {
                let mut file = snap.handle.lock();
                file.finish();
                if mode.is_dsync() {
                    // The inode still has to follow the data.
                    file.attr_dirty = true;
                    drop(file);
                    state.files.mark_dirty(snap.ino);
                    continue;
                }
                let droppable = (file.removed || file.evict_requested) && file.is_clean();
                drop(file);
                if let (true, Some(tx)) = (droppable, drops) {
                    // The queue is gone only during shutdown.
                    let _ = tx.send(snap.ino);
                }
            }
            if report.checkpoint {
                state.clear_flag(FLAG_HAVE_DELTA | FLAG_UNCLOSED);
                state.last_checkpoint = Instant::now();
                state.last_cno = report.cno;
            } else if mode.is_dsync() {
                state.set_flag(FLAG_HAVE_DELTA);
            } else {
                state.set_flag(FLAG_HAVE_DELTA | FLAG_UNCLOSED);
            }
            if mode.is_gc() {
                state.clear_flag(FLAG_FS_FULL);
            }
            Ok(Completion {
                cno: state.last_cno,
                segments_cleaned: report.segments_cleaned,
            })
        }
        Err(err) => {
            let mut restored = 0;
            for snap in files {
                restored += snap.handle.lock().restore();
                state.files.mark_dirty(snap.ino);
            }
            state.files.add_dirty_blocks(restored);
            match &err {
                CoreError::OutOfSpace { .. } => {
                    warn!(target: "segfs::segctor", "log is full; next construction cleans");
                    state.set_flag(FLAG_FS_FULL);
                }
                e if e.is_io() => {
                    error!(target: "segfs::segctor", error = %e, "write failed; filesystem degraded");
                    state.set_flag(FLAG_DEGRADED);
                }
                _ => {}
            }
            Err(ConstructionFailure::from(&err))
        }
    }
}
