//! Crash simulation for segfs.
//!
//! [`CrashableBackend`] wraps an in-memory device and, once armed through
//! its [`CrashSwitch`], either fails every further write or silently drops
//! it. Dropping writes models a power cut: the filesystem believes its
//! constructions reached the device, but the bytes left behind are exactly
//! those written before the cut.
//!
//! ## Usage
//!
//! ```rust
//! use segfs_storage::{InMemoryBackend, StorageBackend};
//! use segfs_testkit::CrashableBackend;
//!
//! let disk = InMemoryBackend::with_size(4096);
//! let mut backend = CrashableBackend::new(disk.share());
//! let switch = backend.switch();
//!
//! switch.lose_writes_after(1);
//! backend.write_at(0, b"kept").unwrap();
//! backend.write_at(512, b"lost").unwrap();
//! assert!(switch.tripped());
//! assert_eq!(disk.read_at(512, 4).unwrap(), vec![0; 4]);
//! ```

use segfs_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const UNLIMITED: u64 = u64::MAX;

/// What happens to writes once the switch trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashMode {
    /// Writes return an I/O error.
    FailWrites,
    /// Writes report success but never reach the device.
    LoseWrites,
}

#[derive(Debug)]
struct SwitchState {
    writes_left: AtomicU64,
    lose: AtomicBool,
    fail_sync: AtomicBool,
    tripped: AtomicBool,
    writes: AtomicU64,
}

impl Default for SwitchState {
    fn default() -> Self {
        Self {
            writes_left: AtomicU64::new(UNLIMITED),
            lose: AtomicBool::new(false),
            fail_sync: AtomicBool::new(false),
            tripped: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }
}

/// Arms a [`CrashableBackend`] from outside the filesystem that owns it.
#[derive(Debug, Clone, Default)]
pub struct CrashSwitch(Arc<SwitchState>);

impl CrashSwitch {
    /// Lets `writes` more writes through, then fails the rest.
    pub fn fail_writes_after(&self, writes: u64) {
        self.arm(writes, CrashMode::FailWrites);
    }

    /// Lets `writes` more writes through, then drops the rest.
    pub fn lose_writes_after(&self, writes: u64) {
        self.arm(writes, CrashMode::LoseWrites);
    }

    /// Makes `sync` and `flush` fail.
    pub fn set_fail_sync(&self, fail: bool) {
        self.0.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Disarms the switch.
    pub fn reset(&self) {
        self.0.writes_left.store(UNLIMITED, Ordering::SeqCst);
        self.0.fail_sync.store(false, Ordering::SeqCst);
        self.0.tripped.store(false, Ordering::SeqCst);
    }

    /// Returns true once a write was failed or dropped.
    pub fn tripped(&self) -> bool {
        self.0.tripped.load(Ordering::SeqCst)
    }

    /// Writes that reached the device.
    pub fn writes(&self) -> u64 {
        self.0.writes.load(Ordering::SeqCst)
    }

    fn arm(&self, writes: u64, mode: CrashMode) {
        self.0
            .lose
            .store(mode == CrashMode::LoseWrites, Ordering::SeqCst);
        self.0.tripped.store(false, Ordering::SeqCst);
        self.0.writes_left.store(writes, Ordering::SeqCst);
    }

    /// Consumes one write; `None` means the write goes through.
    fn take_write(&self) -> Option<CrashMode> {
        let allowed = self
            .0
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok();
        if allowed {
            return None;
        }
        self.0.tripped.store(true, Ordering::SeqCst);
        Some(if self.0.lose.load(Ordering::SeqCst) {
            CrashMode::LoseWrites
        } else {
            CrashMode::FailWrites
        })
    }
}

fn simulated(what: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("simulated crash during {what}"),
    ))
}

/// A storage backend wrapper that can simulate crashes.
#[derive(Debug)]
pub struct CrashableBackend {
    inner: InMemoryBackend,
    switch: CrashSwitch,
}

impl CrashableBackend {
    /// Wraps `inner`. Keep a [`InMemoryBackend::share`] handle to look at the
    /// device after the crash.
    pub fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            switch: CrashSwitch::default(),
        }
    }

    /// A handle that arms this backend.
    pub fn switch(&self) -> CrashSwitch {
        self.switch.clone()
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        match self.switch.take_write() {
            None => {
                self.inner.write_at(offset, data)?;
                self.switch.0.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(CrashMode::LoseWrites) => Ok(()),
            Some(CrashMode::FailWrites) => Err(simulated("write")),
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switch.0.fail_sync.load(Ordering::SeqCst) {
            return Err(simulated("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.0.fail_sync.load(Ordering::SeqCst) {
            return Err(simulated("sync"));
        }
        self.inner.sync()
    }

    fn set_len(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.set_len(new_size)
    }
}
