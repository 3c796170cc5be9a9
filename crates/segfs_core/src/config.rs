//! Format and mount configuration.

use std::time::Duration;

/// Parameters fixed when a device is formatted.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Block size in bytes. A power of two between 1 KiB and 64 KiB.
    pub block_size: u32,

    /// Blocks per segment.
    pub blocks_per_segment: u32,

    /// Total device size in bytes. The tail that does not fill a whole
    /// segment is left unused.
    pub device_size: u64,

    /// Seed for every checksum on the device.
    pub crc_seed: u32,

    /// Percentage of segments held back for the cleaner.
    pub reserved_segments_percent: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks_per_segment: 2048,
            device_size: 256 * 1024 * 1024, // 256 MiB
            crc_seed: 0x5346_4753,
            reserved_segments_percent: 5,
        }
    }
}

impl FormatOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size.
    #[must_use]
    pub const fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the number of blocks per segment.
    #[must_use]
    pub const fn blocks_per_segment(mut self, blocks: u32) -> Self {
        self.blocks_per_segment = blocks;
        self
    }

    /// Sets the device size in bytes.
    #[must_use]
    pub const fn device_size(mut self, size: u64) -> Self {
        self.device_size = size;
        self
    }

    /// Sets the checksum seed.
    #[must_use]
    pub const fn crc_seed(mut self, seed: u32) -> Self {
        self.crc_seed = seed;
        self
    }

    /// Sets the reserved segment percentage.
    #[must_use]
    pub const fn reserved_segments_percent(mut self, percent: u32) -> Self {
        self.reserved_segments_percent = percent;
        self
    }
}

/// Mount-time configuration of the segment constructor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Period of the constructor's timer.
    pub interval: Duration,

    /// A flush request is upgraded to a checkpoint once the last checkpoint
    /// is older than this.
    pub max_checkpoint_age: Duration,

    /// Dirty blocks that trigger a background flush, and upgrade a flush to
    /// a checkpoint.
    pub dirty_watermark: u64,

    /// Victim segments examined per cleaning pass.
    pub gc_segments_per_pass: usize,

    /// Mount without a segment constructor.
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_checkpoint_age: Duration::from_secs(30),
            dirty_watermark: 3600,
            gc_segments_per_pass: 2,
            read_only: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timer period.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the maximum checkpoint age.
    #[must_use]
    pub const fn max_checkpoint_age(mut self, age: Duration) -> Self {
        self.max_checkpoint_age = age;
        self
    }

    /// Sets the dirty-block watermark.
    #[must_use]
    pub const fn dirty_watermark(mut self, blocks: u64) -> Self {
        self.dirty_watermark = blocks;
        self
    }

    /// Sets how many victims one cleaning pass examines.
    #[must_use]
    pub const fn gc_segments_per_pass(mut self, segments: usize) -> Self {
        self.gc_segments_per_pass = segments;
        self
    }

    /// Sets read-only mounting.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.dirty_watermark, 3600);
        assert!(!config.read_only);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .interval(Duration::from_millis(50))
            .dirty_watermark(16)
            .read_only(true);

        assert_eq!(config.interval, Duration::from_millis(50));
        assert_eq!(config.dirty_watermark, 16);
        assert!(config.read_only);

        let opts = FormatOptions::new().block_size(1024).blocks_per_segment(64);
        assert_eq!(opts.block_size, 1024);
        assert_eq!(opts.blocks_per_segment, 64);
    }
}
