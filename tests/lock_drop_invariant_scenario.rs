//! Dropping a lock while a fiber still holds it is a runtime-invariant
//! violation, not a reportable error (`spec.md` §4.6/§4.7's "on destruction,
//! holder must be none"). Each test here spawns a fiber that acquires the
//! lock and then suspends (without finishing, so the fiber's pool-scoped
//! release never runs), then drops the lock itself out from under it and
//! expects the debug assertion to fire.

use pth::fiber;
use pth::sync::{Mutex, RwLock};
use std::time::Duration;

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "mutex dropped while a fiber still held it"))]
fn mutex_dropped_while_held_is_a_bug() {
    let mutex = Box::new(Mutex::new(0i64));
    let mutex_ptr: *const Mutex<i64> = &*mutex;

    // Safety: `mutex` outlives the fiber below — it suspends on the sleep
    // immediately after locking and is never resumed again in this test
    // (dropping `mutex` at the end panics before another tick could run),
    // so nothing reads through this pointer after that suspension.
    fiber::spawn(move || {
        let guard = unsafe { &*mutex_ptr }.lock();
        fiber::sleep(Duration::from_secs(3600));
        drop(guard);
    })
    .expect("failed to spawn fiber");

    assert_eq!(fiber::count(), 1, "holder fiber should still be suspended, not finished");
    drop(mutex);
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "rwlock dropped while a fiber still held it"))]
fn rwlock_dropped_while_held_is_a_bug() {
    let lock = Box::new(RwLock::new(0i64));
    let lock_ptr: *const RwLock<i64> = &*lock;

    // Safety: see the mutex test above; same reasoning applies here.
    fiber::spawn(move || {
        let guard = unsafe { &*lock_ptr }.write();
        fiber::sleep(Duration::from_secs(3600));
        drop(guard);
    })
    .expect("failed to spawn fiber");

    assert_eq!(fiber::count(), 1, "holder fiber should still be suspended, not finished");
    drop(lock);
}
