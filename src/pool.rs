//! Scoped resource ownership ("pools", `spec.md` §3/§9).
//!
//! Every fiber owns a [`Pool`]; every per-fiber resource (a held lock, a
//! timer, a prepoll registration) is allocated in that pool or in a
//! subpool of it. A [`Pool`] is an `Rc`-counted scope: dropping the last
//! strong reference to it runs its release callbacks, innermost subpool
//! first. A fiber that exits while still (nominally) holding resources
//! whose guards were never dropped in the ordinary way — e.g. because the
//! fiber's own stack is torn down out from under them rather than
//! unwound — is still covered: the owning fiber's top-level pool keeps a
//! weak reference to every subpool it minted and force-releases any
//! survivor when the fiber's own pool is torn down.
//!
//! This realizes the redesign note in `spec.md` §9: "every locked critical
//! section owns a sub-scope whose drop releases the lock."

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

struct Inner {
    released: Cell<bool>,
    releases: RefCell<Vec<Box<dyn FnOnce()>>>,
    children: RefCell<Vec<Weak<Inner>>>,
}

/// A scope that runs release callbacks, depth-first, when it is torn down.
#[derive(Clone)]
pub struct Pool(Rc<Inner>);

impl Pool {
    /// Creates a new top-level pool (used for the process-wide pool and for
    /// each fiber's own pool).
    pub fn new() -> Self {
        Pool(Rc::new(Inner {
            released: Cell::new(false),
            releases: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
        }))
    }

    /// Creates a subpool of `self`. The subpool is released whenever it is
    /// dropped (its last strong reference goes away) *or* whenever `self`
    /// is released, whichever comes first.
    pub fn subpool(&self) -> Pool {
        let child = Pool::new();
        self.0.children.borrow_mut().push(Rc::downgrade(&child.0));
        child
    }

    /// Registers `f` to run when this pool is released. Callbacks run in
    /// reverse registration order (LIFO), matching ordinary `Drop` order.
    pub fn on_release<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.0.releases.borrow_mut().push(Box::new(f));
    }

    /// Explicitly releases this pool: runs every live subpool's release
    /// callbacks (depth-first) and then this pool's own, in LIFO order.
    /// Idempotent — a pool already released is a no-op.
    pub fn release(&self) {
        Self::release_inner(&self.0);
    }

    fn release_inner(inner: &Rc<Inner>) {
        if inner.released.replace(true) {
            return;
        }
        let children = std::mem::take(&mut *inner.children.borrow_mut());
        for weak in children {
            if let Some(child) = weak.upgrade() {
                Self::release_inner(&child);
            }
        }
        let callbacks = std::mem::take(&mut *inner.releases.borrow_mut());
        for cb in callbacks.into_iter().rev() {
            cb();
        }
    }

    /// True once this pool has been released (explicitly or via `Drop`).
    pub fn is_released(&self) -> bool {
        self.0.released.get()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Only the last strong reference triggers release; a parent's
        // weak-referenced bookkeeping doesn't count, and clones taken to
        // pass a pool around (e.g. `fiber::current().pool()`) shouldn't
        // release it prematurely.
        if Rc::strong_count(&self.0) == 1 {
            Self::release_inner(&self.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn release_runs_once() {
        let pool = Pool::new();
        let count = StdRc::new(StdRefCell::new(0));
        let count2 = count.clone();
        pool.on_release(move || *count2.borrow_mut() += 1);
        pool.release();
        pool.release();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn dropping_last_ref_releases() {
        let released = StdRc::new(StdRefCell::new(false));
        let released2 = released.clone();
        {
            let pool = Pool::new();
            pool.on_release(move || *released2.borrow_mut() = true);
        }
        assert!(*released.borrow());
    }

    #[test]
    fn clone_does_not_release_early() {
        let released = StdRc::new(StdRefCell::new(false));
        let released2 = released.clone();
        let pool = Pool::new();
        pool.on_release(move || *released2.borrow_mut() = true);
        let clone = pool.clone();
        drop(clone);
        assert!(!*released.borrow(), "dropping a clone must not release");
        drop(pool);
        assert!(*released.borrow());
    }

    #[test]
    fn parent_release_cascades_to_abandoned_subpool() {
        let released = StdRc::new(StdRefCell::new(false));
        let released2 = released.clone();
        let parent = Pool::new();
        let child = parent.subpool();
        child.on_release(move || *released2.borrow_mut() = true);
        // Simulate an abandoned guard: the child handle is leaked, so its
        // own Drop never fires.
        std::mem::forget(child);
        assert!(!*released.borrow());
        parent.release();
        assert!(*released.borrow());
    }

    #[test]
    fn release_order_is_depth_first_then_lifo() {
        let log = StdRc::new(StdRefCell::new(Vec::<&'static str>::new()));
        let parent = Pool::new();
        let child = parent.subpool();
        {
            let log = log.clone();
            parent.on_release(move || log.borrow_mut().push("parent"));
        }
        {
            let log = log.clone();
            child.on_release(move || log.borrow_mut().push("child"));
        }
        drop(child);
        parent.release();
        assert_eq!(*log.borrow(), vec!["child", "parent"]);
    }
}
