//! A fiber acquires a mutex, then terminates (via `fiber::exit`) while still
//! holding it — without ever reaching the code that would normally drop the
//! guard. A second fiber waiting on the same lock must still acquire it: the
//! pool-scoped release on fiber teardown has to run regardless of how the
//! fiber ends (`spec.md` §4.6/§4.7, testable property P4).

use pth::fiber;
use pth::sync::Mutex;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn mutex_held_by_a_fiber_that_exits_is_released_for_the_next_waiter() {
    let mutex = Rc::new(Mutex::new(0i64));

    let holder_mutex = mutex.clone();
    fiber::spawn(move || {
        let mut guard = holder_mutex.lock();
        *guard += 1;
        // Suspend once so the waiter below actually gets a chance to queue
        // up on the lock before this fiber terminates while still holding
        // it.
        fiber::sleep(Duration::from_millis(1));
        fiber::exit();
    })
    .expect("failed to spawn holder fiber");

    let waiter_mutex = mutex.clone();
    let waiter = fiber::spawn_joinable("waiter", move || {
        let mut guard = waiter_mutex.lock();
        *guard += 1;
        *guard
    })
    .expect("failed to spawn waiter fiber");

    while fiber::count() > 0 {
        fiber::tick();
    }

    assert_eq!(waiter.join(), 2, "waiter never acquired the lock the dead holder left behind");

    let mut mutex = mutex;
    assert_eq!(*Rc::get_mut(&mut mutex).expect("still shared").get_mut(), 2);
}

#[test]
fn rwlock_write_held_by_a_fiber_that_exits_is_released_for_a_waiting_reader() {
    use pth::sync::RwLock;

    let lock = Rc::new(RwLock::new(0i64));

    let writer_lock = lock.clone();
    fiber::spawn(move || {
        let mut guard = writer_lock.write();
        *guard = 41;
        fiber::sleep(Duration::from_millis(1));
        fiber::exit();
    })
    .expect("failed to spawn writer fiber");

    let reader_lock = lock.clone();
    let reader = fiber::spawn_joinable("reader", move || {
        let guard = reader_lock.read();
        *guard
    })
    .expect("failed to spawn reader fiber");

    while fiber::count() > 0 {
        fiber::tick();
    }

    assert_eq!(reader.join(), 41, "reader never saw the writer's value after the writer died holding the lock");
}
