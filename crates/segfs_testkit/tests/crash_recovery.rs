//! Crash recovery tests: random workloads cut short at arbitrary points.

use proptest::prelude::*;
use segfs_core::{CoreError, Filesystem};
use segfs_testkit::prelude::*;

fn files(t: &TestFs, n: usize) -> Vec<segfs_core::Ino> {
    let files: Vec<_> = (0..n).map(|_| t.create_file().unwrap()).collect();
    t.sync().unwrap();
    files
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn durable_writes_survive_a_crash(ops in workload_strategy(3, 6, 30)) {
        let mut t = TestFs::with_options(&small_options(32), quiet_config());
        let mut model = Model::new(files(&t, 3), t.geometry().block_bytes());
        for op in ops {
            model.apply(t.fs(), op).unwrap();
        }
        model.crash();
        t.crash();
        prop_assert!(model.check(t.fs()).is_ok(), "{:?} {}", model.check(t.fs()), t.describe());

        // Recovery is idempotent: crashing again right away changes nothing.
        t.crash();
        prop_assert!(model.check(t.fs()).is_ok(), "{}", t.describe());
    }

    #[test]
    fn clean_remount_keeps_everything(ops in workload_strategy(2, 4, 20)) {
        let mut t = TestFs::with_options(&small_options(32), quiet_config());
        let mut model = Model::new(files(&t, 2), t.geometry().block_bytes());
        for op in ops {
            model.apply(t.fs(), op).unwrap();
        }
        t.remount();
        prop_assert!(t.recovery_info().is_clean());
        prop_assert!(model.check(t.fs()).is_ok(), "{}", t.describe());
    }
}

#[test]
fn power_cut_inside_a_checkpoint_leaves_old_or_new_state() {
    let bs = segfs_testkit::TEST_BLOCK_SIZE as usize;
    for cut in 0..8 {
        let mut t = TestFs::new();
        let ino = t.create_file().unwrap();
        for blkoff in 0..40 {
            t.write_block(ino, blkoff, &pattern(bs, 1)).unwrap();
        }
        t.sync().unwrap();
        for blkoff in 0..40 {
            t.write_block(ino, blkoff, &pattern(bs, 2)).unwrap();
        }
        t.switch().lose_writes_after(cut);
        t.sync().unwrap();
        t.crash();

        let first = t.read_block(ino, 0).unwrap();
        let seed = if first == pattern(bs, 1) { 1 } else { 2 };
        assert_eq!(first, pattern(bs, seed), "cut {cut}: {}", t.describe());
        for blkoff in 1..40 {
            assert_eq!(
                t.read_block(ino, blkoff).unwrap(),
                pattern(bs, seed),
                "cut {cut} block {blkoff}: {}",
                t.describe()
            );
        }
    }
}

#[test]
fn lost_checkpoint_falls_back_to_the_previous_one() {
    let bs = segfs_testkit::TEST_BLOCK_SIZE as usize;
    let mut t = TestFs::new();
    let ino = t.create_file().unwrap();
    t.write_block(ino, 0, &pattern(bs, 5)).unwrap();
    let cno = t.sync().unwrap();

    t.write_block(ino, 0, &pattern(bs, 6)).unwrap();
    t.switch().lose_writes_after(0);
    t.sync().unwrap();
    t.crash();

    assert_eq!(t.recovery_info().cno, cno);
    assert!(!t.recovery_info().rolled_forward);
    assert_eq!(t.read_block(ino, 0).unwrap(), pattern(bs, 5));
}

#[test]
fn write_failure_makes_the_filesystem_read_only() {
    let bs = segfs_testkit::TEST_BLOCK_SIZE as usize;
    let t = TestFs::new();
    let ino = t.create_file().unwrap();
    t.write_block(ino, 0, &pattern(bs, 1)).unwrap();
    t.sync().unwrap();

    t.write_block(ino, 0, &pattern(bs, 2)).unwrap();
    t.switch().fail_writes_after(0);
    let err = t.sync().unwrap_err();
    assert!(err.is_io(), "{err}");
    assert!(t.is_read_only());
    assert!(matches!(t.create_file(), Err(CoreError::ReadOnly)));
    assert!(matches!(
        t.write_block(ino, 1, &pattern(bs, 3)),
        Err(CoreError::ReadOnly)
    ));
    // Reads keep working from the cache.
    assert_eq!(t.read_block(ino, 0).unwrap(), pattern(bs, 2));

    let disk = t.into_disk();
    let fs = Filesystem::mount(Box::new(disk.share()), quiet_config()).unwrap();
    assert_eq!(fs.read_block(ino, 0).unwrap(), pattern(bs, 1));
    fs.unmount().unwrap();
}
