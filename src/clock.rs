//! The reactor's monotonic millisecond clock.
//!
//! A single process-wide counter, sampled at process start and refreshed
//! exactly once per reactor tick (`spec.md` §4.3). Fibers read it for
//! "wallclock-ish" timestamps; because it only changes once per tick, the
//! view of time within a tick is consistent no matter how many fibers read
//! it between a timer firing and the next kernel poll.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
static NOW_MS: AtomicU64 = AtomicU64::new(0);

/// Returns the reactor's current millisecond clock reading.
///
/// This is *not* wall-clock time; it is a monotonic counter relative to
/// process start, refreshed once per reactor tick. See [`refresh`].
#[inline]
pub fn now_ms() -> u64 {
    // Force EPOCH to be initialized (and NOW_MS seeded) even if `refresh`
    // has never been called yet, e.g. from code running before the reactor
    // has executed its first tick.
    Lazy::force(&EPOCH);
    NOW_MS.load(Ordering::Relaxed)
}

/// Resamples the clock. Called by the reactor exactly once per tick, right
/// after the kernel poll returns (`spec.md` §4.3 step 4), and once at
/// process start so that code running before the first tick sees a sane
/// value.
pub fn refresh() {
    let elapsed = EPOCH.elapsed();
    let ms = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
    NOW_MS.store(ms, Ordering::Relaxed);
}

/// Milliseconds until `deadline` as measured by [`now_ms`], or `0` if it has
/// already passed.
#[inline]
pub fn ms_until(deadline_ms: u64) -> u64 {
    deadline_ms.saturating_sub(now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn refresh_advances_monotonically() {
        refresh();
        let first = now_ms();
        sleep(Duration::from_millis(5));
        refresh();
        let second = now_ms();
        assert!(second >= first);
    }

    #[test]
    fn ms_until_saturates_at_zero() {
        refresh();
        let past = now_ms().saturating_sub(1000);
        assert_eq!(ms_until(past), 0);
    }
}
