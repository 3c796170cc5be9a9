#![allow(dead_code)]

use segfs_core::{Config, Filesystem, FormatOptions};
use segfs_storage::InMemoryBackend;
use std::time::Duration;

pub const BS: usize = 1024;

pub fn options(nsegments: u64) -> FormatOptions {
    FormatOptions::new()
        .block_size(BS as u32)
        .blocks_per_segment(32)
        .device_size(nsegments * 32 * BS as u64 + BS as u64)
        .reserved_segments_percent(0)
}

pub fn config() -> Config {
    Config::new()
        .interval(Duration::from_secs(3600))
        .max_checkpoint_age(Duration::from_secs(3600))
}

pub fn format(nsegments: u64) -> InMemoryBackend {
    let disk = InMemoryBackend::new();
    Filesystem::format(Box::new(disk.share()), &options(nsegments)).unwrap();
    disk
}

pub fn mount(disk: &InMemoryBackend) -> Filesystem {
    Filesystem::mount(Box::new(disk.share()), config()).unwrap()
}

pub fn block(seed: u8) -> Vec<u8> {
    (0..BS).map(|i| seed ^ (i as u8)).collect()
}
