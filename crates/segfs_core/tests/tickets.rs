//! Concurrent requests against one constructor.

mod common;

use common::{block, format, mount};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

#[test]
fn concurrent_requests_complete_in_order() {
    let disk = format(32);
    let fs = mount(&disk);
    let files: Vec<_> = (0..4).map(|_| fs.create_file().unwrap()).collect();
    let completed = AtomicU64::new(0);

    thread::scope(|s| {
        for (t, &ino) in files.iter().enumerate() {
            let fs = &fs;
            let completed = &completed;
            s.spawn(move || {
                let mut last_done = 0u32;
                for round in 0..10u64 {
                    fs.write_block(ino, round, &block(t as u8)).unwrap();
                    let ticket = fs.request_construction(round % 3 == 0).unwrap();
                    let seq = ticket.seq();
                    fs.wait_for_ticket(ticket).unwrap();

                    let done = fs.sequence_counters().done;
                    assert!(done >= seq, "ticket {seq} returned before done reached it ({done})");
                    assert!(done >= last_done, "done moved back from {last_done} to {done}");
                    last_done = done;
                    completed.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(completed.load(Ordering::Relaxed), 40);
    let counters = fs.sequence_counters();
    assert_eq!(counters.request, counters.done);
    assert_eq!(counters.accepted, counters.done);
    // Requests queued while a construction runs share the next one.
    assert!(fs.stats().constructions <= 40);

    fs.unmount().unwrap();
    let fs = mount(&disk);
    for (t, &ino) in files.iter().enumerate() {
        for round in 0..10 {
            assert_eq!(fs.read_block(ino, round).unwrap(), block(t as u8));
        }
    }
}

#[test]
fn fsyncs_from_many_threads_are_all_durable() {
    let disk = format(32);
    let fs = mount(&disk);
    let files: Vec<_> = (0..6).map(|_| fs.create_file().unwrap()).collect();
    fs.sync().unwrap();

    thread::scope(|s| {
        for (t, &ino) in files.iter().enumerate() {
            let fs = &fs;
            s.spawn(move || {
                for blkoff in 0..4 {
                    fs.write_block(ino, blkoff, &block(t as u8 + 1)).unwrap();
                }
                fs.fsync(ino).unwrap();
            });
        }
    });
    fs.halt();

    let fs = mount(&disk);
    for (t, &ino) in files.iter().enumerate() {
        for blkoff in 0..4 {
            assert_eq!(fs.read_block(ino, blkoff).unwrap(), block(t as u8 + 1));
        }
    }
}

#[test]
fn writers_keep_going_while_the_constructor_runs() {
    let disk = format(32);
    let fs = mount(&disk);
    let ino = fs.create_file().unwrap();

    thread::scope(|s| {
        let fs = &fs;
        s.spawn(move || {
            for _ in 0..5 {
                fs.sync().unwrap();
            }
        });
        s.spawn(move || {
            for round in 0..50u64 {
                fs.write_block(ino, round % 16, &block(round as u8)).unwrap();
            }
        });
    });

    fs.unmount().unwrap();
    let fs = mount(&disk);
    for blkoff in 0..16u64 {
        let last = (34..50).find(|r| r % 16 == blkoff).unwrap();
        assert_eq!(fs.read_block(ino, blkoff).unwrap(), block(last as u8));
    }
}
