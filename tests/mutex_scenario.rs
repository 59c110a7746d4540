//! Many fibers serialize increments to a shared counter through a mutex,
//! each holding the lock across a suspension point (a sleep) the way a
//! real critical section spanning I/O would.

use pretty_assertions::assert_eq;
use pth::fiber;
use pth::sync::Mutex;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn fifty_fibers_increment_a_mutex_protected_counter() {
    const FIBERS: usize = 50;
    const ITERATIONS: usize = 50;

    let counter = Rc::new(Mutex::new(0i64));
    let mut handles = Vec::new();

    for _ in 0..FIBERS {
        let counter = counter.clone();
        let handle = fiber::spawn_joinable("producer", move || {
            for _ in 0..ITERATIONS {
                let mut guard = counter.lock();
                let value = *guard;
                fiber::sleep(Duration::from_millis(1));
                *guard = value + 1;
            }
        })
        .expect("failed to spawn fiber");
        handles.push(handle);
    }

    while fiber::count() > 0 {
        fiber::tick();
    }
    for handle in handles {
        handle.join();
    }

    let mut counter = counter;
    let total = *Rc::get_mut(&mut counter).expect("counter still shared after every fiber joined").get_mut();
    assert_eq!(total, (FIBERS * ITERATIONS) as i64);
}
