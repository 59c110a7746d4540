//! A fiber arms a short watchdog, then sleeps far longer than it. The
//! watchdog must cut the sleep off and terminate the fiber instead of
//! letting it run to its full duration.

use pth::fiber;
use pth::fiber::watchdog;
use std::time::{Duration, Instant};

#[test]
fn watchdog_terminates_a_fiber_stuck_in_a_long_sleep() {
    fiber::spawn(|| {
        watchdog::set_timeout(Duration::from_millis(50));
        fiber::sleep(Duration::from_secs(3600));
    })
    .expect("failed to spawn fiber");

    assert_eq!(fiber::count(), 1);

    let start = Instant::now();
    while fiber::count() > 0 {
        fiber::tick();
        assert!(start.elapsed() < Duration::from_secs(5), "watchdog never fired");
    }

    assert_eq!(fiber::count(), 0);
}
