//! Per-fiber watchdog / alarm (`pth_timeout`, `spec.md` §4.4).
//!
//! A watchdog is a reactor timer scoped to the fiber's own pool: when it
//! fires, it sets the fiber's alarm flag and resumes it directly (not
//! through a prepoll, unlike wait-queue wake-ups — there's at most one
//! watchdog per fiber, so there's no "resumed twice" hazard to guard
//! against). The fiber discovers the flag the next time it reaches a
//! suspension point inside a wrapper (`fiber::wrappers`) and terminates
//! via [`super::exit`] rather than retrying.

use std::time::Duration;

/// Arms (or re-arms) a timeout on the current fiber. When `delay` elapses
/// with the fiber still suspended at that point, its alarm flag is set and
/// it is resumed; its next suspension point then terminates it. Setting a
/// new watchdog cancels whichever one was previously armed.
pub fn set_timeout(delay: Duration) {
    let id = super::current_id();
    super::with_executor(|ex| {
        if let Some(previous) = ex.fiber_mut(id).watchdog.take() {
            ex.reactor.cancel_timer(previous);
        }
        let timer = ex.reactor.set_timer(delay, move || {
            super::raise_alarm(id);
        });
        ex.fiber_mut(id).watchdog = Some(timer);
    });
}

/// Cancels the current fiber's watchdog, if any.
pub fn clear_timeout() {
    let id = super::current_id();
    super::with_executor(|ex| {
        if let Some(timer) = ex.fiber_mut(id).watchdog.take() {
            ex.reactor.cancel_timer(timer);
        }
    });
}

/// True if the current fiber's alarm flag is set. Suspension-point
/// wrappers check this on every resume; ordinary user code doesn't need
/// to.
pub fn alarm_received() -> bool {
    super::with_current_record(|record| record.alarm_received)
}
