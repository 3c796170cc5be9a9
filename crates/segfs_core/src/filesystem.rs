//! Filesystem facade: format, mount, file I/O and the request API.

use crate::config::{Config, FormatOptions};
use crate::construct::{
    run_construction, settle, spawn_segctor, Completion, Mode, Phase, Request, ScState,
    SegctorHandle, SequenceCounters, Shared, Stage, Ticket, FLAG_DEGRADED,
};
use crate::device::BlockDevice;
use crate::drop_queue::DropQueue;
use crate::error::{CoreError, CoreResult};
use crate::file_table::{FileHandle, FileTable};
use crate::layout::{Geometry, InodeRecord, SuperBlock, SB_STATE_CLEAN};
use crate::mdt::{Checkpoint, SegmentUsage, SufileStat};
use crate::metadata::Metadata;
use crate::recovery::{self, RecoveryInfo};
use crate::stats::StatsSnapshot;
use crate::types::{unix_now, Cno, Ino, SegNum};
use segfs_storage::StorageBackend;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A mounted filesystem.
///
/// Foreground calls only touch in-memory state and queue requests; the
/// segment constructor thread does every log write.
///
/// # Example
///
/// ```rust
/// use segfs_core::{Config, Filesystem, FormatOptions};
/// use segfs_storage::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// let options = FormatOptions::new()
///     .block_size(1024)
///     .blocks_per_segment(32)
///     .device_size(16 * 32 * 1024 + 1024);
/// Filesystem::format(Box::new(backend.share()), &options).unwrap();
///
/// let fs = Filesystem::mount(Box::new(backend.share()), Config::default()).unwrap();
/// let ino = fs.create_file().unwrap();
/// fs.write_at(ino, 0, b"hello").unwrap();
/// fs.fsync(ino).unwrap();
/// fs.unmount().unwrap();
/// ```
pub struct Filesystem {
    shared: Arc<Shared>,
    segctor: Option<SegctorHandle>,
    drops: Option<DropQueue>,
    recovery: RecoveryInfo,
    stopped: bool,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("geometry", self.shared.device.geometry())
            .field("read_only", &self.shared.config.read_only)
            .field("counters", &self.sequence_counters())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Writes an empty filesystem to `backend`.
    ///
    /// The backend is resized to the formatted size and zeroed first, so
    /// nothing of an earlier image can be mistaken for log data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for unsupported options and any error of the
    /// backend.
    pub fn format(mut backend: Box<dyn StorageBackend>, options: &FormatOptions) -> CoreResult<Geometry> {
        let geometry = Geometry::for_device(
            options.block_size,
            options.blocks_per_segment,
            options.device_size,
        )?;
        if options.reserved_segments_percent > 50 {
            return Err(CoreError::invalid_format(format!(
                "reserving {}% of segments leaves too little for the log",
                options.reserved_segments_percent
            )));
        }
        backend.set_len(0)?;
        backend.set_len(geometry.device_bytes())?;

        let now = unix_now();
        let superblock = SuperBlock {
            state: 0,
            block_size: options.block_size,
            blocks_per_segment: options.blocks_per_segment,
            nsegments: geometry.nsegments(),
            crc_seed: options.crc_seed,
            reserved_segments_percent: options.reserved_segments_percent,
            last_pseg: 0,
            last_seq: 0,
            last_cno: Cno::new(0),
            wtime: now,
            generation: 0,
        };
        let meta = Metadata::format(geometry, superblock, now)?;
        let device = BlockDevice::new(backend, geometry);
        let shared = Shared::new(device, Config::default(), meta, FileTable::new());
        let report = run_construction(&shared, Mode::Checkpoint { gc: false }, &[])?;

        let mut meta = shared.meta.lock();
        meta.superblock.set_state(SB_STATE_CLEAN, true);
        meta.write_superblock(&shared.device, now)?;
        info!(
            target: "segfs::segctor",
            block_size = options.block_size,
            blocks_per_segment = options.blocks_per_segment,
            nsegments = geometry.nsegments(),
            cno = report.cno.0,
            "formatted"
        );
        Ok(geometry)
    }

    /// Mounts the filesystem on `backend`, rolling the log forward if the
    /// last unmount was not clean.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if no superblock is valid, `CorruptSuperRoot`
    /// if no super root is (read-write mounts), and any I/O error of the
    /// roll-forward checkpoint.
    pub fn mount(backend: Box<dyn StorageBackend>, config: Config) -> CoreResult<Self> {
        let (device, candidates) = BlockDevice::open(backend)?;
        let recovered = recovery::recover(&device, &candidates, config.read_only)?;
        let info = recovered.info;

        let mut table = FileTable::new();
        for file in recovered.files {
            let handle = table.get_or_insert(file.ino, file.size);
            let mut state = handle.lock();
            state.size = file.size;
            state.attr_dirty = true;
            let mut added = 0;
            for (blkoff, data) in file.blocks {
                if state.write_block(blkoff, data) {
                    added += 1;
                }
            }
            drop(state);
            table.add_dirty_blocks(added);
            table.mark_dirty(file.ino);
        }

        let read_only = config.read_only;
        let shared = Arc::new(Shared::new(device, config, recovered.meta, table));
        shared.stats.record_replayed(info.replayed_blocks);

        if read_only {
            info!(target: "segfs::recovery", cno = info.cno.0, "mounted read-only");
            return Ok(Self {
                shared,
                segctor: None,
                drops: None,
                recovery: info,
                stopped: false,
            });
        }

        if info.rolled_forward {
            let mode = Mode::Checkpoint { gc: false };
            let files = shared.state.lock().files.snapshot_all();
            let result = run_construction(&shared, mode, &files);
            let mut state = shared.state.lock();
            settle(&mut state, mode, &files, result, None)?;
            info!(
                target: "segfs::recovery",
                cno = state.last_cno.0,
                "roll-forward done"
            );
        }
        {
            let mut meta = shared.meta.lock();
            meta.superblock.set_state(SB_STATE_CLEAN, false);
            meta.write_superblock(&shared.device, unix_now())?;
        }

        let drops = DropQueue::spawn(Arc::clone(&shared))?;
        let tx = drops.sender().ok_or(CoreError::Shutdown)?;
        let segctor = spawn_segctor(Arc::clone(&shared), tx)?;
        info!(
            target: "segfs::recovery",
            cno = info.cno.0,
            rolled_forward = info.rolled_forward,
            "mounted"
        );
        Ok(Self {
            shared,
            segctor: Some(segctor),
            drops: Some(drops),
            recovery: info,
            stopped: false,
        })
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.shared.config.read_only || self.stopped {
            return Err(CoreError::ReadOnly);
        }
        if self.shared.state.lock().has_flag(FLAG_DEGRADED) {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }

    fn block_bytes(&self) -> usize {
        self.shared.device.geometry().block_bytes()
    }

    /// Size recorded in the inode of `ino`.
    fn inode_size(&self, ino: Ino) -> CoreResult<u64> {
        if !ino.is_regular() {
            return Err(CoreError::NotFound { ino: ino.0 });
        }
        self.shared
            .meta
            .lock()
            .ifile
            .read(ino)
            .map(|record| record.size)
            .ok_or(CoreError::NotFound { ino: ino.0 })
    }

    /// The in-memory state of `ino`, loading it from its inode if needed.
    fn handle(&self, state: &mut ScState, ino: Ino) -> CoreResult<FileHandle> {
        if let Some(handle) = state.files.get(ino) {
            return Ok(handle);
        }
        let size = self.inode_size(ino)?;
        Ok(state.files.get_or_insert(ino, size))
    }

    /// Creates an empty regular file.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` on read-only or degraded mounts.
    pub fn create_file(&self) -> CoreResult<Ino> {
        self.check_writable()?;
        let ino = {
            let mut meta = self.shared.meta.lock();
            let ino = meta.ifile.alloc_ino()?;
            meta.ifile.write(ino, &InodeRecord::allocated(unix_now()))?;
            ino
        };
        let mut state = self.shared.state.lock();
        let handle = state.files.get_or_insert(ino, 0);
        handle.lock().attr_dirty = true;
        state.files.mark_dirty(ino);
        Ok(ino)
    }

    /// Removes a file. Its blocks are released by the next construction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file does not exist.
    pub fn remove_file(&self, ino: Ino) -> CoreResult<()> {
        self.check_writable()?;
        let mut state = self.shared.state.lock();
        let handle = self.handle(&mut state, ino)?;
        let mut file = handle.lock();
        if file.removed {
            return Err(CoreError::NotFound { ino: ino.0 });
        }
        let discarded = file.dirty.len() as u64;
        file.dirty.clear();
        file.removed = true;
        file.attr_dirty = true;
        drop(file);
        state.files.sub_dirty_blocks(discarded);
        state.files.mark_dirty(ino);
        Ok(())
    }

    /// Releases the in-memory state of a file once it is clean.
    pub fn evict(&self, ino: Ino) {
        let Some(handle) = self.shared.state.lock().files.get(ino) else {
            return;
        };
        handle.lock().evict_requested = true;
        if let Some(drops) = &self.drops {
            drops.send(ino);
        }
    }

    /// Replaces block `blkoff` of a file. `data` must be exactly one block.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for a wrong buffer size, `FileTooLarge`
    /// past the block map's reach and `NotFound` for unknown files.
    pub fn write_block(&self, ino: Ino, blkoff: u64, data: &[u8]) -> CoreResult<()> {
        let bs = self.block_bytes();
        if data.len() != bs {
            return Err(CoreError::invalid_operation(format!(
                "block writes take {bs} bytes, got {}",
                data.len()
            )));
        }
        self.store_block(ino, blkoff, data.to_vec(), (blkoff + 1) * bs as u64)
    }

    fn store_block(&self, ino: Ino, blkoff: u64, data: Vec<u8>, end: u64) -> CoreResult<()> {
        self.check_writable()?;
        if blkoff >= self.shared.device.geometry().max_file_blocks() {
            return Err(CoreError::FileTooLarge { blkoff });
        }
        let pressure = {
            let mut state = self.shared.state.lock();
            let handle = self.handle(&mut state, ino)?;
            let mut file = handle.lock();
            if file.removed {
                return Err(CoreError::NotFound { ino: ino.0 });
            }
            let newly_dirty = file.write_block(blkoff, data);
            file.size = file.size.max(end);
            file.evict_requested = false;
            drop(file);
            if newly_dirty {
                state.files.add_dirty_blocks(1);
            }
            state.files.mark_dirty(ino);
            state.files.ndirty_blocks() > self.shared.config.dirty_watermark
        };
        self.shared.stats.record_dirtied(1);
        if pressure {
            // Background flush; nobody waits for it.
            drop(self.shared.request(Request::Flush));
        }
        Ok(())
    }

    /// Reads block `blkoff` of a file. Holes read as zeros.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown files and device errors.
    pub fn read_block(&self, ino: Ino, blkoff: u64) -> CoreResult<Vec<u8>> {
        let handle = {
            let mut state = self.shared.state.lock();
            self.handle(&mut state, ino)?
        };
        {
            let file = handle.lock();
            if file.removed {
                return Err(CoreError::NotFound { ino: ino.0 });
            }
            if let Some(data) = file.cached(blkoff) {
                return Ok(data.as_ref().clone());
            }
        }
        let mut meta = self.shared.meta.lock();
        let block = meta.read_file_block(&self.shared.device, ino, blkoff)?;
        Ok(block.unwrap_or_else(|| vec![0; self.block_bytes()]))
    }

    /// Writes `data` at byte `offset`, extending the file as needed.
    ///
    /// # Errors
    ///
    /// As [`Filesystem::write_block`]; `FileTooLarge` when the write would
    /// end past the largest byte offset.
    pub fn write_at(&self, ino: Ino, offset: u64, data: &[u8]) -> CoreResult<()> {
        let bs = self.block_bytes() as u64;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(CoreError::FileTooLarge { blkoff: offset / bs })?;
        let mut pos = offset;
        while pos < end {
            let blkoff = pos / bs;
            let within = (pos % bs) as usize;
            let take = ((bs as usize) - within).min((end - pos) as usize);
            let src = &data[(pos - offset) as usize..(pos - offset) as usize + take];
            let block = if take == bs as usize {
                src.to_vec()
            } else {
                let mut block = self.read_block(ino, blkoff)?;
                block[within..within + take].copy_from_slice(src);
                block
            };
            self.store_block(ino, blkoff, block, pos + take as u64)?;
            pos += take as u64;
        }
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`, stopping at the end of the file.
    ///
    /// # Errors
    ///
    /// As [`Filesystem::read_block`].
    pub fn read_at(&self, ino: Ino, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let size = self.file_size(ino)?;
        let end = size.min(offset.saturating_add(len as u64));
        let bs = self.block_bytes() as u64;
        let mut out = Vec::with_capacity(end.saturating_sub(offset) as usize);
        let mut pos = offset;
        while pos < end {
            let block = self.read_block(ino, pos / bs)?;
            let within = (pos % bs) as usize;
            let take = ((bs as usize) - within).min((end - pos) as usize);
            out.extend_from_slice(&block[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Current size of a file in bytes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown files.
    pub fn file_size(&self, ino: Ino) -> CoreResult<u64> {
        if let Some(handle) = self.shared.state.lock().files.get(ino) {
            let file = handle.lock();
            if file.removed {
                return Err(CoreError::NotFound { ino: ino.0 });
            }
            return Ok(file.size);
        }
        self.inode_size(ino)
    }

    /// Makes every written block of a file durable.
    ///
    /// # Errors
    ///
    /// Returns the error of the construction that served the request.
    pub fn fsync(&self, ino: Ino) -> CoreResult<()> {
        self.fsync_range(ino, 0, u64::MAX)
    }

    /// Makes the written blocks `first..=last` of a file durable.
    ///
    /// # Errors
    ///
    /// As [`Filesystem::fsync`], and `InvalidOperation` when `first > last`.
    pub fn fsync_range(&self, ino: Ino, first: u64, last: u64) -> CoreResult<()> {
        self.check_writable()?;
        if first > last {
            return Err(CoreError::invalid_operation(format!(
                "fsync range {first}..={last} is empty"
            )));
        }
        self.file_size(ino)?;
        self.shared
            .request(Request::Dsync { ino, first, last })
            .wait()
            .map(|_| ())
    }

    /// Writes a checkpoint if anything changed, and returns the latest
    /// checkpoint number.
    ///
    /// # Errors
    ///
    /// Returns the error of the construction that served the request.
    pub fn sync(&self) -> CoreResult<Cno> {
        self.check_writable()?;
        self.shared.request(Request::Checkpoint).wait().map(|c| c.cno)
    }

    /// Queues a construction: a checkpoint if `sync`, else a flush.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` on read-only or degraded mounts.
    pub fn request_construction(&self, sync: bool) -> CoreResult<Ticket> {
        self.check_writable()?;
        let request = if sync { Request::Checkpoint } else { Request::Flush };
        Ok(self.shared.request(request))
    }

    /// Blocks until the construction covering `ticket` finished.
    ///
    /// # Errors
    ///
    /// Returns the construction's error.
    pub fn wait_for_ticket(&self, ticket: Ticket) -> CoreResult<Completion> {
        ticket.wait()
    }

    /// Like [`Filesystem::wait_for_ticket`] but gives up after `timeout`
    /// with `Interrupted`; the construction itself keeps running.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` on timeout or the construction's error.
    pub fn wait_for_ticket_timeout(&self, ticket: &Ticket, timeout: Duration) -> CoreResult<Completion> {
        ticket.wait_timeout(timeout)
    }

    /// Writes a checkpoint even if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns the construction's error.
    pub fn force_checkpoint_now(&self) -> CoreResult<Cno> {
        self.check_writable()?;
        self.shared
            .request(Request::ForcedCheckpoint)
            .wait()
            .map(|c| c.cno)
    }

    /// Runs one cleaning pass and returns how many segments it freed.
    ///
    /// # Errors
    ///
    /// Returns the construction's error.
    pub fn clean_segments(&self) -> CoreResult<u64> {
        self.check_writable()?;
        self.shared
            .request(Request::Gc)
            .wait()
            .map(|c| c.segments_cleaned)
    }

    /// Retained checkpoints, oldest first.
    #[must_use]
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.shared.meta.lock().cpfile.list()
    }

    /// Usage of every segment, indexed by segment number.
    #[must_use]
    pub fn segment_usage(&self) -> Vec<SegmentUsage> {
        let meta = self.shared.meta.lock();
        (0..meta.geometry().nsegments())
            .map(|segnum| meta.sufile.usage(SegNum(segnum)))
            .collect()
    }

    /// Clean and dirty segment counts.
    #[must_use]
    pub fn sufile_stat(&self) -> SufileStat {
        self.shared.meta.lock().sufile.stat()
    }

    /// Latest durable checkpoint.
    #[must_use]
    pub fn last_cno(&self) -> Cno {
        self.shared.state.lock().last_cno
    }

    /// The request, accepted and done counters.
    #[must_use]
    pub fn sequence_counters(&self) -> SequenceCounters {
        self.shared.state.lock().counters()
    }

    /// What the constructor thread is doing.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.progress.phase()
    }

    /// Stage of the running construction, `Done` between constructions.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.shared.progress.stage()
    }

    /// Stage the last failed construction stopped in, if any failed.
    #[must_use]
    pub fn last_aborted_stage(&self) -> Option<Stage> {
        self.shared.progress.aborted_at()
    }

    /// Running counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// What recovery found at mount.
    #[must_use]
    pub fn recovery_info(&self) -> &RecoveryInfo {
        &self.recovery
    }

    /// True on read-only mounts and after a write failure.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.config.read_only || self.shared.state.lock().has_flag(FLAG_DEGRADED)
    }

    /// Device geometry.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        *self.shared.device.geometry()
    }

    /// Writes a final checkpoint, stops the constructor and marks the
    /// filesystem clean.
    ///
    /// # Errors
    ///
    /// Fails if changes could not be written; the filesystem is then left
    /// marked unclean and the next mount rolls forward.
    pub fn unmount(mut self) -> CoreResult<()> {
        self.shutdown(false)
    }

    /// Stops the constructor without writing anything more, as if power
    /// was lost.
    pub fn halt(mut self) {
        if let Err(err) = self.shutdown(true) {
            warn!(target: "segfs::segctor", error = %err, "halt");
        }
    }

    fn shutdown(&mut self, halt: bool) -> CoreResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        if let Some(mut segctor) = self.segctor.take() {
            self.shared.stop(halt);
            segctor.join();
        }
        if let Some(mut drops) = self.drops.take() {
            drops.shutdown();
        }
        if halt || self.shared.config.read_only {
            return Ok(());
        }

        let state = self.shared.state.lock();
        if state.has_flag(FLAG_DEGRADED) {
            return Err(CoreError::ReadOnly);
        }
        if state.has_unwritten_changes() {
            return Err(CoreError::invalid_operation(
                "final checkpoint failed; changes remain unwritten",
            ));
        }
        drop(state);
        let mut meta = self.shared.meta.lock();
        meta.superblock.set_state(SB_STATE_CLEAN, true);
        meta.write_superblock(&self.shared.device, unix_now())?;
        info!(target: "segfs::segctor", cno = meta.last_cno().0, "unmounted");
        Ok(())
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(false) {
            warn!(target: "segfs::segctor", error = %err, "unmount on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segfs_storage::InMemoryBackend;

    fn options() -> FormatOptions {
        FormatOptions::new()
            .block_size(1024)
            .blocks_per_segment(32)
            .device_size(16 * 32 * 1024 + 1024)
            .reserved_segments_percent(0)
    }

    fn formatted() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        Filesystem::format(Box::new(backend.share()), &options()).unwrap();
        backend
    }

    fn mount(backend: &InMemoryBackend) -> Filesystem {
        let config = Config::default().interval(Duration::from_secs(3600));
        Filesystem::mount(Box::new(backend.share()), config).unwrap()
    }

    #[test]
    fn format_leaves_a_clean_first_checkpoint() {
        let backend = formatted();
        let fs = mount(&backend);
        assert!(fs.recovery_info().is_clean());
        assert_eq!(fs.last_cno(), Cno::new(1));
        assert_eq!(fs.checkpoints().len(), 1);
        assert_eq!(fs.geometry().nsegments(), 16);
        fs.unmount().unwrap();
    }

    #[test]
    fn write_read_through_the_cache_and_the_log() {
        let backend = formatted();
        let fs = mount(&backend);
        let ino = fs.create_file().unwrap();
        fs.write_at(ino, 1000, b"spans two blocks").unwrap();
        assert_eq!(fs.file_size(ino).unwrap(), 1016);
        assert_eq!(fs.read_at(ino, 1000, 100).unwrap(), b"spans two blocks");
        assert_eq!(fs.read_at(ino, 0, 4).unwrap(), vec![0; 4]);

        let cno = fs.sync().unwrap();
        assert_eq!(cno, Cno::new(2));
        fs.evict(ino);
        assert_eq!(fs.read_at(ino, 1000, 16).unwrap(), b"spans two blocks");
        fs.unmount().unwrap();

        let fs = mount(&backend);
        assert!(fs.recovery_info().is_clean());
        assert_eq!(fs.read_at(ino, 1000, 16).unwrap(), b"spans two blocks");
        assert_eq!(fs.file_size(ino).unwrap(), 1016);
    }

    #[test]
    fn bad_requests_are_rejected() {
        let backend = formatted();
        let fs = mount(&backend);
        let ino = fs.create_file().unwrap();
        assert!(matches!(
            fs.write_block(ino, 0, &[0; 10]),
            Err(CoreError::InvalidOperation { .. })
        ));
        let far = fs.geometry().max_file_blocks();
        assert!(matches!(
            fs.write_block(ino, far, &[0; 1024]),
            Err(CoreError::FileTooLarge { .. })
        ));
        assert!(matches!(
            fs.read_block(Ino::new(999), 0),
            Err(CoreError::NotFound { ino: 999 })
        ));
        assert!(matches!(fs.fsync(Ino::DAT), Err(CoreError::NotFound { .. })));
        assert!(matches!(
            fs.write_at(ino, u64::MAX - 2, b"hello"),
            Err(CoreError::FileTooLarge { .. })
        ));
        assert_eq!(fs.file_size(ino).unwrap(), 0);

        fs.write_block(ino, 0, &[7; 1024]).unwrap();
        assert!(matches!(
            fs.fsync_range(ino, 5, 1),
            Err(CoreError::InvalidOperation { .. })
        ));
        fs.fsync_range(ino, 0, 0).unwrap();
        assert_eq!(fs.sync().unwrap(), fs.last_cno());
        fs.remove_file(ino).unwrap();
        assert!(matches!(fs.file_size(ino), Err(CoreError::NotFound { .. })));
        assert!(matches!(fs.remove_file(ino), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn read_only_mounts_refuse_writes() {
        let backend = formatted();
        let fs = Filesystem::mount(Box::new(backend.share()), Config::default().read_only(true))
            .unwrap();
        assert!(fs.is_read_only());
        assert!(matches!(fs.create_file(), Err(CoreError::ReadOnly)));
        assert!(matches!(fs.sync(), Err(CoreError::ReadOnly)));
        assert_eq!(fs.phase(), Phase::Idle);
        fs.unmount().unwrap();
    }

    #[test]
    fn format_rejects_bad_geometry() {
        let backend = InMemoryBackend::new();
        let bad = options().block_size(1000);
        assert!(Filesystem::format(Box::new(backend.share()), &bad).is_err());
        let bad = options().reserved_segments_percent(80);
        assert!(Filesystem::format(Box::new(backend), &bad).is_err());
    }
}
