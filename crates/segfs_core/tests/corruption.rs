//! Damaged logs and superblocks.

mod common;

use common::{block, config, format, mount, BS};
use segfs_core::layout::{SB_BYTES, SuperBlock};
use segfs_core::{run_recovery, BlockDevice, CoreError, Filesystem, LogReader};
use segfs_storage::{InMemoryBackend, StorageBackend};

/// Writes block 0 of a file through a checkpoint, then block 1 through a
/// flush, and halts.
fn checkpoint_then_flush(disk: &InMemoryBackend) -> segfs_core::Ino {
    let fs = mount(disk);
    let ino = fs.create_file().unwrap();
    fs.write_block(ino, 0, &block(1)).unwrap();
    fs.sync().unwrap();
    fs.write_block(ino, 1, &block(2)).unwrap();
    fs.request_construction(false).unwrap().wait().unwrap();
    fs.halt();
    ino
}

#[test]
fn flipped_byte_ends_the_log_before_the_damaged_segment() {
    let disk = format(16);
    let ino = checkpoint_then_flush(&disk);
    let info = run_recovery(Box::new(disk.share())).unwrap();
    let start = info.lsegs_start.unwrap();

    // First payload block after the one-block summary.
    disk.flip_byte(((start + 1) * BS as u64 + 5) as usize);

    let info = run_recovery(Box::new(disk.share())).unwrap();
    assert_eq!(info.logical_segments, 0);
    let fs = mount(&disk);
    assert!(!fs.recovery_info().rolled_forward);
    assert_eq!(fs.read_block(ino, 0).unwrap(), block(1));
    assert_eq!(fs.read_block(ino, 1).unwrap(), vec![0; BS]);
}

#[test]
fn every_written_partial_segment_verifies() {
    let disk = format(16);
    checkpoint_then_flush(&disk);
    let (device, candidates) = BlockDevice::open(Box::new(disk.share())).unwrap();
    let reader = LogReader::new(&device, candidates[0].crc_seed);
    let psegs = reader.segment(segfs_core::SegNum::new(0));
    assert!(psegs.len() >= 2, "format and first checkpoint");
    for pair in psegs.windows(2) {
        assert_eq!(pair[0].header().seq + 1, pair[1].header().seq);
        assert_eq!(pair[0].end(), pair[1].start());
    }
    assert!(psegs[0].super_root(candidates[0].crc_seed).is_ok());
}

#[test]
fn damaged_superblock_copy_falls_back_to_the_other() {
    let disk = format(16);
    let fs = mount(&disk);
    let ino = fs.create_file().unwrap();
    fs.write_block(ino, 0, &block(3)).unwrap();
    fs.sync().unwrap();
    fs.unmount().unwrap();

    let size = disk.size().unwrap();
    let [primary, secondary] = SuperBlock::locations(size);
    let newest = {
        let a = SuperBlock::decode(&disk.read_at(primary, SB_BYTES).unwrap()).unwrap();
        let b = SuperBlock::decode(&disk.read_at(secondary, SB_BYTES).unwrap()).unwrap();
        if a.generation > b.generation {
            primary
        } else {
            secondary
        }
    };
    disk.flip_byte(newest as usize + 12);

    let fs = mount(&disk);
    assert_eq!(fs.read_block(ino, 0).unwrap(), block(3));
    fs.unmount().unwrap();
}

#[test]
fn both_superblocks_lost_is_fatal() {
    let disk = format(16);
    let size = disk.size().unwrap();
    for offset in SuperBlock::locations(size) {
        disk.flip_byte(offset as usize + 12);
    }
    let err = Filesystem::mount(Box::new(disk.share()), config()).unwrap_err();
    assert!(matches!(err, CoreError::InvalidFormat { .. }), "{err}");
    assert!(run_recovery(Box::new(disk)).is_err());
}

#[test]
fn recovery_twice_is_a_no_op() {
    let disk = format(16);
    let ino = checkpoint_then_flush(&disk);

    let fs = mount(&disk);
    assert!(fs.recovery_info().rolled_forward);
    fs.halt();
    let image = disk.data();

    let fs = Filesystem::mount(Box::new(disk.share()), config().read_only(true)).unwrap();
    assert!(fs.recovery_info().is_clean());
    assert_eq!(fs.read_block(ino, 1).unwrap(), block(2));
    drop(fs);
    assert_eq!(disk.data(), image);
}
