//! Test fixtures and filesystem helpers.
//!
//! Provides small formatted filesystems that can be cleanly remounted or
//! crashed and remounted.

use crate::crash::{CrashSwitch, CrashableBackend};
use segfs_core::{Config, Filesystem, FormatOptions, Geometry};
use segfs_storage::{FileBackend, InMemoryBackend};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Block size of the test geometries.
pub const TEST_BLOCK_SIZE: u32 = 1024;

/// Blocks per segment of the test geometries.
pub const TEST_BLOCKS_PER_SEGMENT: u32 = 32;

/// Format options for a device of `nsegments` small segments.
pub fn small_options(nsegments: u64) -> FormatOptions {
    let segment_bytes = u64::from(TEST_BLOCK_SIZE) * u64::from(TEST_BLOCKS_PER_SEGMENT);
    FormatOptions::new()
        .block_size(TEST_BLOCK_SIZE)
        .blocks_per_segment(TEST_BLOCKS_PER_SEGMENT)
        .device_size(nsegments * segment_bytes + u64::from(TEST_BLOCK_SIZE))
        .reserved_segments_percent(0)
}

/// A mount configuration whose timer never fires during a test, so every
/// construction is one the test asked for.
pub fn quiet_config() -> Config {
    Config::new()
        .interval(Duration::from_secs(3600))
        .max_checkpoint_age(Duration::from_secs(3600))
}

/// A block of `len` bytes derived from `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
        .collect()
}

/// A formatted in-memory filesystem that can be remounted or crashed.
pub struct TestFs {
    fs: Option<Filesystem>,
    disk: InMemoryBackend,
    switch: CrashSwitch,
    config: Config,
}

impl TestFs {
    /// A 16-segment filesystem mounted with [`quiet_config`].
    pub fn new() -> Self {
        Self::with_options(&small_options(16), quiet_config())
    }

    /// Formats and mounts a filesystem.
    pub fn with_options(options: &FormatOptions, config: Config) -> Self {
        let disk = InMemoryBackend::new();
        Filesystem::format(Box::new(disk.share()), options).expect("Failed to format");
        let mut fixture = Self {
            fs: None,
            disk,
            switch: CrashSwitch::default(),
            config,
        };
        fixture.mount();
        fixture
    }

    fn mount(&mut self) {
        let backend = CrashableBackend::new(self.disk.share());
        self.switch = backend.switch();
        let fs = Filesystem::mount(Box::new(backend), self.config.clone())
            .expect("Failed to mount");
        self.fs = Some(fs);
    }

    /// The mounted filesystem.
    pub fn fs(&self) -> &Filesystem {
        self.fs.as_ref().expect("filesystem is mounted")
    }

    /// Arms crashes of the current mount's device.
    pub fn switch(&self) -> &CrashSwitch {
        &self.switch
    }

    /// The device as it is now.
    pub fn disk(&self) -> &InMemoryBackend {
        &self.disk
    }

    /// Unmounts cleanly and mounts again.
    pub fn remount(&mut self) -> &Filesystem {
        if let Some(fs) = self.fs.take() {
            fs.unmount().expect("Failed to unmount");
        }
        self.mount();
        self.fs()
    }

    /// Stops the filesystem without a final checkpoint, drops every write
    /// still in flight and mounts what is left on the device.
    pub fn crash(&mut self) -> &Filesystem {
        self.switch.lose_writes_after(0);
        if let Some(fs) = self.fs.take() {
            fs.halt();
        }
        self.mount();
        self.fs()
    }

    /// Stops the filesystem and returns the device without remounting.
    pub fn into_disk(mut self) -> InMemoryBackend {
        self.switch.lose_writes_after(0);
        if let Some(fs) = self.fs.take() {
            fs.halt();
        }
        self.disk.share()
    }

    /// Recovery, stats and counters as JSON, for assertion messages.
    pub fn describe(&self) -> String {
        let fs = self.fs();
        serde_json::json!({
            "recovery": fs.recovery_info(),
            "stats": fs.stats(),
            "counters": fs.sequence_counters(),
            "segments": fs.sufile_stat(),
        })
        .to_string()
    }
}

impl Default for TestFs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestFs {
    type Target = Filesystem;

    fn deref(&self) -> &Self::Target {
        self.fs()
    }
}

/// A filesystem image in a temporary directory.
pub struct TempImage {
    path: PathBuf,
    geometry: Geometry,
    _dir: TempDir,
}

impl TempImage {
    /// Creates and formats an image file.
    pub fn new(options: &FormatOptions) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("segfs.img");
        let backend =
            FileBackend::create(&path, options.device_size).expect("Failed to create image");
        let geometry =
            Filesystem::format(Box::new(backend), options).expect("Failed to format image");
        Self {
            path,
            geometry,
            _dir: dir,
        }
    }

    /// Path of the image file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Geometry the image was formatted with.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Mounts the image.
    pub fn mount(&self, config: Config) -> Filesystem {
        let backend = FileBackend::open(&self.path).expect("Failed to open image");
        Filesystem::mount(Box::new(backend), config).expect("Failed to mount image")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_options_give_the_requested_segments() {
        let t = TestFs::with_options(&small_options(8), quiet_config());
        assert_eq!(t.geometry().nsegments(), 8);
        assert_eq!(t.geometry().block_bytes(), TEST_BLOCK_SIZE as usize);
    }

    #[test]
    fn remount_keeps_synced_data() {
        let mut t = TestFs::new();
        let ino = t.create_file().unwrap();
        t.write_block(ino, 0, &pattern(1024, 1)).unwrap();
        t.sync().unwrap();
        t.remount();
        assert!(t.recovery_info().is_clean());
        assert_eq!(t.read_block(ino, 0).unwrap(), pattern(1024, 1));
    }

    #[test]
    fn crash_loses_unsynced_data() {
        let mut t = TestFs::new();
        let ino = t.create_file().unwrap();
        t.write_block(ino, 0, &pattern(1024, 1)).unwrap();
        t.sync().unwrap();
        t.write_block(ino, 0, &pattern(1024, 2)).unwrap();
        t.crash();
        assert_eq!(t.read_block(ino, 0).unwrap(), pattern(1024, 1), "{}", t.describe());
    }

    #[test]
    fn image_files_mount_and_persist() {
        let image = TempImage::new(&small_options(8));
        {
            let fs = image.mount(quiet_config());
            let ino = fs.create_file().unwrap();
            fs.write_at(ino, 0, b"on disk").unwrap();
            fs.unmount().unwrap();
        }
        let fs = image.mount(quiet_config());
        assert_eq!(fs.read_at(segfs_core::Ino::new(11), 0, 7).unwrap(), b"on disk");
        assert_eq!(image.geometry().nsegments(), 8);
    }
}
