//! Wait queue: the suspension primitive higher-level locks are built from
//! (`spec.md` §4.5).
//!
//! Waking never resumes a sleeper inline. `wake_up`/`wake_up_one` take a
//! private copy of the (relevant part of the) sleeper list, clear it from
//! the queue, and defer the actual resumption to a one-shot prepoll
//! callback. This guarantees every fiber asleep *at the moment wake_up is
//! called* gets resumed exactly once, even if a resumed fiber immediately
//! re-enters the same queue — it does so on a fresh entry, not the one the
//! waker already consumed.

use crate::fiber::{self, FiberId};
use std::cell::RefCell;
use std::collections::VecDeque;

#[derive(Default)]
pub struct WaitQueue {
    sleepers: RefCell<VecDeque<FiberId>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends the current fiber on this queue. Returns once woken. If
    /// the fiber's watchdog fired while it was asleep, removes it from
    /// the queue (defensively — the waker should already have) and
    /// terminates the fiber instead of returning.
    pub fn sleep_on(&self) {
        let id = fiber::current_id();
        self.sleepers.borrow_mut().push_back(id);
        fiber::suspend_self();
        if fiber::watchdog::alarm_received() {
            self.sleepers.borrow_mut().retain(|&sleeper| sleeper != id);
            fiber::exit();
        }
    }

    /// Resumes every fiber currently asleep on this queue. A no-op if the
    /// queue is empty.
    pub fn wake_up(&self) {
        let woken: Vec<FiberId> = self.sleepers.borrow_mut().drain(..).collect();
        if woken.is_empty() {
            return;
        }
        fiber::with_executor(move |ex| {
            ex.reactor_mut().register_prepoll_once(move || {
                for id in woken {
                    fiber::resume(id);
                }
            });
        });
    }

    /// Resumes the fiber at the head of the queue. Calling this on an
    /// empty queue is a runtime-invariant violation (`spec.md` §7) and
    /// aborts.
    pub fn wake_up_one(&self) {
        let id = self
            .sleepers
            .borrow_mut()
            .pop_front()
            .expect("wake_up_one called on an empty wait queue");
        fiber::with_executor(move |ex| {
            ex.reactor_mut().register_prepoll_once(move || {
                fiber::resume(id);
            });
        });
    }

    pub fn is_empty(&self) -> bool {
        self.sleepers.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.sleepers.borrow().len()
    }
}
