//! Timer delta-queue (`spec.md` §3 "Timer", §4.3 step 1/6).
//!
//! Timers are kept in a min-heap ordered by absolute expiry — functionally
//! equivalent to the delta-queue the spec describes (each node effectively
//! carries the distance to the timer ahead of it; we just don't materialize
//! that distance as a stored field, since recomputing it from absolute
//! times is just as cheap and avoids re-threading the whole queue on every
//! insertion). Cancellation is lazy: a cancelled id is recorded in a set
//! and the corresponding heap node is discarded the next time it would
//! otherwise become the head, so `cancel_timer_early` and pool-scoped
//! cancellation are O(log n) instead of O(n).

use crate::clock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle to a registered timer, returned by [`TimerQueue::set_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Node {
    expiry_ms: u64,
    id: u64,
    callback: Box<dyn FnOnce()>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.expiry_ms == other.expiry_ms && self.id == other.id
    }
}
impl Eq for Node {}
impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest expiry (and,
        // among ties, the earliest-registered id) sorts to the top.
        other
            .expiry_ms
            .cmp(&self.expiry_ms)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Node>,
    cancelled: HashSet<u64>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run no earlier than `delay` from now.
    pub fn set_timer(&mut self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let expiry_ms = clock::now_ms().saturating_add(delay.as_millis().min(u64::MAX as u128) as u64);
        self.heap.push(Node {
            expiry_ms,
            id,
            callback: Box::new(callback),
        });
        TimerId(id)
    }

    /// Cancels a timer that hasn't fired yet. A no-op if it already fired
    /// or was already cancelled.
    pub fn cancel(&mut self, timer: TimerId) {
        self.cancelled.insert(timer.0);
    }

    fn prune_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.cancelled.remove(&top.id) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// Runs the callbacks of every timer whose expiry is `<= now`, removing
    /// each from the queue before its callback runs (so a callback that
    /// re-registers a timer never observes its own, already-fired, node).
    pub fn fire_due(&mut self) {
        loop {
            self.prune_cancelled();
            let due = matches!(self.heap.peek(), Some(node) if node.expiry_ms <= clock::now_ms());
            if !due {
                break;
            }
            let node = self.heap.pop().expect("checked Some above");
            (node.callback)();
        }
    }

    /// Fires exactly the current head timer, if any — used when `poll`
    /// returns a zero-descriptor timeout (`spec.md` §4.3 step 6).
    pub fn fire_head(&mut self) {
        self.prune_cancelled();
        if let Some(node) = self.heap.pop() {
            (node.callback)();
        }
    }

    /// Milliseconds until the nearest live timer expires, or `None` if the
    /// queue is empty (meaning the caller should poll with an infinite
    /// timeout).
    pub fn next_timeout_ms(&mut self) -> Option<u64> {
        self.prune_cancelled();
        self.heap.peek().map(|node| clock::ms_until(node.expiry_ms))
    }

    pub fn is_empty(&mut self) -> bool {
        self.prune_cancelled();
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_expiry_order() {
        clock::refresh();
        let mut q = TimerQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        q.set_timer(Duration::from_millis(30), move || o1.borrow_mut().push(3));
        q.set_timer(Duration::from_millis(10), move || o2.borrow_mut().push(1));
        q.set_timer(Duration::from_millis(20), move || o3.borrow_mut().push(2));

        std::thread::sleep(Duration::from_millis(40));
        clock::refresh();
        q.fire_due();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        clock::refresh();
        let mut q = TimerQueue::new();
        let fired = Rc::new(RefCell::new(false));
        let f2 = fired.clone();
        let id = q.set_timer(Duration::from_millis(5), move || *f2.borrow_mut() = true);
        q.cancel(id);
        std::thread::sleep(Duration::from_millis(10));
        clock::refresh();
        q.fire_due();
        assert!(!*fired.borrow());
    }
}
