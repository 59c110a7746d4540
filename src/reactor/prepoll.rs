//! Prepoll callbacks (`spec.md` §3 "Prepoll", §4.3 step 2).
//!
//! Guaranteed to run exactly once per reactor tick, before the kernel poll.
//! The scan is deliberately re-entrant-safe: a prepoll registered *during*
//! the scan starts with `fired = false` and therefore still runs this tick;
//! a prepoll removed during the scan is never invoked again even if the
//! scan revisits its slot, because removal is checked on every iteration,
//! not cached. This is the mechanism that makes P1 and scenario S5 hold.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrepollId(u64);

struct Entry {
    fired: Cell<bool>,
    removed: Cell<bool>,
    /// Set for entries registered via [`PrepollList::register_once`]:
    /// removed automatically right after their first run, instead of
    /// staying registered until an explicit `unregister`.
    once: bool,
    callback: RefCell<Option<Box<dyn FnMut()>>>,
}

#[derive(Default)]
pub struct PrepollList {
    entries: Vec<(u64, Rc<Entry>)>,
    next_id: u64,
}

impl PrepollList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callback: impl FnMut() + 'static) -> PrepollId {
        self.push_entry(false, Box::new(callback))
    }

    /// Registers a callback that runs at most once, then removes itself —
    /// without the double-borrow hazard of a callback unregistering its
    /// own still-running entry (`spec.md` §4.5's deferred-wakeup prepoll
    /// is built on this).
    pub fn register_once(&mut self, callback: impl FnOnce() + 'static) -> PrepollId {
        let mut callback = Some(callback);
        self.push_entry(
            true,
            Box::new(move || {
                if let Some(cb) = callback.take() {
                    cb();
                }
            }),
        )
    }

    fn push_entry(&mut self, once: bool, callback: Box<dyn FnMut()>) -> PrepollId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((
            id,
            Rc::new(Entry {
                fired: Cell::new(false),
                removed: Cell::new(false),
                once,
                callback: RefCell::new(Some(callback)),
            }),
        ));
        PrepollId(id)
    }

    pub fn unregister(&mut self, id: PrepollId) {
        if let Some((_, entry)) = self.entries.iter().find(|(eid, _)| *eid == id.0) {
            entry.removed.set(true);
            // Drop the callback's captures eagerly; the slot itself is
            // compacted out of `entries` at the end of the next `run`.
            entry.callback.borrow_mut().take();
        }
    }

    /// Runs every live prepoll exactly once, per the scan algorithm in
    /// `spec.md` §4.3 step 2, then compacts out anything unregistered
    /// during the scan.
    pub fn run(&mut self) {
        for (_, entry) in &self.entries {
            entry.fired.set(false);
        }
        loop {
            let next = self
                .entries
                .iter()
                .find(|(_, e)| !e.fired.get() && !e.removed.get())
                .map(|(_, e)| e.clone());
            let Some(entry) = next else { break };
            entry.fired.set(true);
            // Borrow the callback mutably only for the duration of the
            // call; a callback registering/unregistering other prepolls
            // touches `self.entries`, not this `RefCell`, so no conflict.
            if let Some(cb) = entry.callback.borrow_mut().as_mut() {
                cb();
            }
            if entry.once {
                entry.removed.set(true);
            }
        }
        self.entries.retain(|(_, e)| !e.removed.get());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn s5_prepoll_scenario() {
        // A removes B and registers C on its first fire. Expected this
        // tick: A runs once, B does not run, C runs once.
        let ran = StdRc::new(StdRefCell::new(Vec::<&'static str>::new()));
        let mut list = PrepollList::new();

        let list_ptr: *mut PrepollList = &mut list;
        let b_id_slot = StdRc::new(StdRefCell::new(None));

        let ran_a = ran.clone();
        let b_id_slot_a = b_id_slot.clone();
        list.register(move || {
            ran_a.borrow_mut().push("A");
            let list = unsafe { &mut *list_ptr };
            if let Some(b_id) = *b_id_slot_a.borrow() {
                list.unregister(b_id);
            }
            let ran_c = ran_a.clone();
            list.register(move || ran_c.borrow_mut().push("C"));
        });

        let ran_b = ran.clone();
        let b_id = list.register(move || ran_b.borrow_mut().push("B"));
        *b_id_slot.borrow_mut() = Some(b_id);

        list.run();
        assert_eq!(*ran.borrow(), vec!["A", "C"]);
    }

    #[test]
    fn register_once_runs_a_single_time_then_self_removes() {
        let count = StdRc::new(StdRefCell::new(0));
        let mut list = PrepollList::new();
        let count2 = count.clone();
        list.register_once(move || *count2.borrow_mut() += 1);
        assert!(!list.is_empty());
        list.run();
        assert_eq!(*count.borrow(), 1);
        assert!(list.is_empty());
        list.run();
        assert_eq!(*count.borrow(), 1, "a register_once callback never runs twice");
    }

    #[test]
    fn every_live_entry_fires_exactly_once() {
        let count = StdRc::new(StdRefCell::new(0));
        let mut list = PrepollList::new();
        for _ in 0..5 {
            let count = count.clone();
            list.register(move || *count.borrow_mut() += 1);
        }
        list.run();
        assert_eq!(*count.borrow(), 5);
        list.run();
        assert_eq!(*count.borrow(), 10);
    }
}
