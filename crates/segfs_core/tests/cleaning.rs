//! Segment cleaning and running out of space.

mod common;

use common::{block, config, format, mount};
use segfs_core::{CoreError, Filesystem, Stage};

fn overwrite(fs: &Filesystem, ino: segfs_core::Ino, rounds: u8) {
    for round in 0..rounds {
        for blkoff in 0..8 {
            fs.write_block(ino, blkoff, &block(round)).unwrap();
        }
        fs.sync().unwrap();
    }
}

#[test]
fn cleaning_reclaims_overwritten_segments() {
    let disk = format(16);
    let fs = mount(&disk);
    let ino = fs.create_file().unwrap();
    overwrite(&fs, ino, 12);
    let before = fs.stats();

    let cleaned = fs.clean_segments().unwrap();
    assert!(cleaned >= 1);
    let after = fs.stats();
    assert_eq!(after.segments_cleaned, before.segments_cleaned + cleaned);
    assert_eq!(after.checkpoints, before.checkpoints + 1);
    for blkoff in 0..8 {
        assert_eq!(fs.read_block(ino, blkoff).unwrap(), block(11));
    }
    fs.unmount().unwrap();

    let fs = mount(&disk);
    assert!(fs.recovery_info().is_clean());
    for blkoff in 0..8 {
        assert_eq!(fs.read_block(ino, blkoff).unwrap(), block(11));
    }
    // The segment the format wrote to was among the oldest and is free now.
    assert!(fs.segment_usage()[0].is_clean() || fs.segment_usage()[1].is_clean());
}

#[test]
fn cleaned_space_is_reused() {
    let disk = format(8);
    let fs = Filesystem::mount(Box::new(disk.share()), config().gc_segments_per_pass(4)).unwrap();
    let ino = fs.create_file().unwrap();
    // Far more than eight segments' worth of log without the cleaner.
    for _ in 0..8 {
        overwrite(&fs, ino, 2);
        fs.clean_segments().unwrap();
    }
    let stat = fs.sufile_stat();
    assert_eq!(stat.nsegments, 8);
    assert_eq!(stat.ncleansegs + stat.ndirtysegs, 8);
    assert!(stat.ncleansegs >= 1);
    assert_eq!(fs.read_block(ino, 7).unwrap(), block(1));
    fs.unmount().unwrap();

    let fs = mount(&disk);
    assert_eq!(fs.read_block(ino, 7).unwrap(), block(1));
}

#[test]
fn cleaning_an_idle_filesystem_is_harmless() {
    let disk = format(16);
    let fs = mount(&disk);
    // Only protected segments are in use.
    assert_eq!(fs.clean_segments().unwrap(), 0);
    assert!(fs.segment_usage().iter().all(|usage| !usage.is_error()));
}

#[test]
fn running_out_of_space_keeps_the_last_checkpoint() {
    let disk = format(4);
    let fs = mount(&disk);
    assert_eq!(fs.last_aborted_stage(), None);
    let small = fs.create_file().unwrap();
    fs.write_block(small, 0, &block(1)).unwrap();
    let cno = fs.sync().unwrap();

    let big = fs.create_file().unwrap();
    for blkoff in 0..150 {
        fs.write_block(big, blkoff, &block(2)).unwrap();
    }
    let err = fs.sync().unwrap_err();
    assert!(matches!(err, CoreError::OutOfSpace { .. }), "{err}");
    assert_eq!(fs.last_aborted_stage(), Some(Stage::File));
    // Space errors do not degrade the filesystem.
    assert!(!fs.is_read_only());
    assert_eq!(fs.last_cno(), cno);
    assert_eq!(fs.read_block(big, 149).unwrap(), block(2));
    assert!(fs.stats().failures >= 1);
    fs.halt();

    let fs = mount(&disk);
    assert_eq!(fs.recovery_info().cno, cno);
    assert_eq!(fs.read_block(small, 0).unwrap(), block(1));
    assert!(matches!(fs.file_size(big), Err(CoreError::NotFound { .. })));
}

#[test]
fn running_out_of_space_after_the_file_stage_keeps_the_last_checkpoint() {
    // Find a file size whose data fits but whose DAT entries do not.
    for blocks in 60..128 {
        let disk = format(4);
        let fs = mount(&disk);
        let cno = fs.last_cno();
        let ino = fs.create_file().unwrap();
        for blkoff in 0..blocks {
            fs.write_block(ino, blkoff, &block(blkoff as u8)).unwrap();
        }
        if fs.sync().is_ok() {
            fs.halt();
            continue;
        }
        if fs.last_aborted_stage() != Some(Stage::Dat) {
            fs.halt();
            continue;
        }
        assert!(!fs.is_read_only());
        assert_eq!(fs.last_cno(), cno);
        assert_eq!(fs.read_block(ino, blocks - 1).unwrap(), block((blocks - 1) as u8));
        fs.halt();

        let fs = mount(&disk);
        assert_eq!(fs.recovery_info().cno, cno);
        assert!(matches!(fs.file_size(ino), Err(CoreError::NotFound { .. })));
        return;
    }
    panic!("no file size ran out of space while collecting the DAT");
}
