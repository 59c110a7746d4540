//! Fiber-aware mutex (`spec.md` §4.6), grounded on the teacher's own
//! `fiber::mutex::Mutex` — same API shape (`lock`/`try_lock`/`unlock`/
//! `into_inner`/`get_mut`/a RAII `MutexGuard`) — but with holder tracking
//! and release-on-drop implemented against this runtime's [`Pool`] and
//! [`WaitQueue`] instead of a latch FFI type.

use super::wait_queue::WaitQueue;
use crate::fiber::{self, FiberId};
use crate::pool::Pool;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::ops::{Deref, DerefMut};

pub struct Mutex<T: ?Sized> {
    holder: Cell<Option<FiberId>>,
    sleepers: WaitQueue,
    /// The subpool backing the current holder's critical section, kept
    /// just so `leave` can release it; `None` while unlocked.
    holder_scope: RefCell<Option<Pool>>,
    data: UnsafeCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            holder: Cell::new(None),
            sleepers: WaitQueue::new(),
            holder_scope: RefCell::new(None),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Non-suspending attempt to acquire the lock.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.holder.get().is_some() {
            return None;
        }
        let scope = fiber::with_current_pool(|pool| pool.subpool());
        self.holder.set(Some(fiber::current_id()));
        *self.holder_scope.borrow_mut() = Some(scope.clone());
        let mutex_ptr: *const Mutex<T> = self;
        scope.on_release(move || {
            // Safety: `scope` (and therefore this callback) cannot outlive
            // `self`'s last guard, because the guard holds `scope` alive
            // and nothing else triggers its release.
            let mutex = unsafe { &*mutex_ptr };
            mutex.holder.set(None);
            *mutex.holder_scope.borrow_mut() = None;
            if !mutex.sleepers.is_empty() {
                mutex.sleepers.wake_up_one();
            }
        });
        Some(MutexGuard { mutex: self })
    }

    /// Suspends the current fiber until the lock can be acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            self.sleepers.sleep_on();
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized> Drop for Mutex<T> {
    fn drop(&mut self) {
        debug_assert!(
            self.holder.get().is_none(),
            "mutex dropped while a fiber still held it"
        );
    }
}

impl<T: ?Sized + Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct Locked;
                impl fmt::Debug for Locked {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &Locked);
            }
        }
        d.finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        // The release callback registered in `try_lock` does the actual
        // unlocking and wake-up; releasing the subpool here just triggers
        // it. `leave`'s invariant (holder must be the releasing fiber) is
        // enforced structurally: only the fiber that created `holder_scope`
        // ever holds a `MutexGuard` referencing it.
        if let Some(scope) = self.mutex.holder_scope.borrow().clone() {
            scope.release();
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}
