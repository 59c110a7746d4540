//! One writer fiber drives a counter up while many reader fibers spin,
//! taking the read lock between sleeps. Every observed value must be
//! in range and non-decreasing — proof that no reader ever sees a
//! partially-applied write.

use pth::fiber;
use pth::sync::RwLock;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn many_readers_never_observe_a_torn_write() {
    const WRITES: i64 = 200;
    const READERS: usize = 30;
    const READS_PER_READER: usize = 40;

    let lock = Rc::new(RwLock::new(0i64));

    let writer_lock = lock.clone();
    let writer = fiber::spawn_joinable("writer", move || {
        for _ in 0..WRITES {
            let mut guard = writer_lock.write();
            *guard += 1;
            drop(guard);
            fiber::sleep(Duration::from_micros(200));
        }
    })
    .expect("failed to spawn writer fiber");

    let mut readers = Vec::new();
    for _ in 0..READERS {
        let lock = lock.clone();
        let handle = fiber::spawn_joinable("reader", move || {
            let mut last_seen = 0i64;
            for _ in 0..READS_PER_READER {
                let guard = lock.read();
                let value = *guard;
                drop(guard);
                assert!(value >= last_seen, "rwlock exposed a value that went backwards");
                assert!((0..=WRITES).contains(&value), "rwlock exposed an out-of-range value");
                last_seen = value;
                fiber::sleep(Duration::from_micros(50));
            }
        })
        .expect("failed to spawn reader fiber");
        readers.push(handle);
    }

    while fiber::count() > 0 {
        fiber::tick();
    }

    writer.join();
    for handle in readers {
        handle.join();
    }

    let mut lock = lock;
    let total = *Rc::get_mut(&mut lock).expect("lock still shared after every fiber joined").get_mut();
    assert_eq!(total, WRITES);
}
