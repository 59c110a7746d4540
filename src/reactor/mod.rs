//! The reactor: the sole place this runtime blocks (`spec.md` §4.3).
//!
//! Central event loop: a readiness set polled once per tick via
//! `libc::poll`, a timer delta-queue, and a list of one-shot prepoll
//! callbacks. `invoke()` runs exactly one tick, in the order the spec
//! fixes as part of its contract:
//!
//! 1. fire due timers
//! 2. run prepoll callbacks
//! 3. kernel poll (timeout = nearest timer expiry, or infinite)
//! 4. refresh the clock
//! 5. dispatch readiness callbacks, driven from the handle table
//! 6. if poll timed out, fire the head timer

mod prepoll;
mod timer;

pub use prepoll::PrepollId;
pub use timer::TimerId;

use crate::clock;
use std::os::unix::io::RawFd;
use std::time::Duration;

bitflags::bitflags! {
    /// Readiness events of interest / observed, mirroring `poll(2)`'s
    /// `POLLIN`/`POLLOUT`.
    #[derive(Default)]
    pub struct Events: libc::c_short {
        const READABLE = libc::POLLIN;
        const WRITABLE = libc::POLLOUT;
    }
}

/// Handle to a readiness registration, returned by [`Reactor::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadinessHandle(usize);

struct Registration {
    kernel_index: usize,
    callback: Box<dyn FnMut(Events)>,
    /// Distinguishes this registration from whatever else may later occupy
    /// the same slot index, once `unregister` frees it back onto
    /// `free_slots` (`dispatch_ready`'s restore path relies on this).
    generation: u64,
}

struct KernelEntry {
    pollfd: libc::pollfd,
    refcount: usize,
}

/// The readiness-driven event loop. Not `Sync`/`Send`: this runtime is
/// explicitly single-threaded (`spec.md` §5, §9's "make that restriction
/// explicit in the types").
pub struct Reactor {
    registrations: Vec<Option<Registration>>,
    free_slots: Vec<usize>,
    kernel: Vec<KernelEntry>,
    timers: timer::TimerQueue,
    prepolls: prepoll::PrepollList,
    next_generation: u64,
    _not_sync: std::marker::PhantomData<*const ()>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        clock::refresh();
        Reactor {
            registrations: Vec::new(),
            free_slots: Vec::new(),
            kernel: Vec::new(),
            timers: timer::TimerQueue::new(),
            prepolls: prepoll::PrepollList::new(),
            next_generation: 0,
            _not_sync: std::marker::PhantomData,
        }
    }

    /// Registers interest in `events` on `fd`, invoking `callback` the tick
    /// readiness is observed. Two registrations on the same `(fd, events)`
    /// share one kernel-facing `pollfd` entry.
    pub fn register(
        &mut self,
        fd: RawFd,
        events: Events,
        callback: impl FnMut(Events) + 'static,
    ) -> ReadinessHandle {
        let kernel_index = self
            .kernel
            .iter()
            .position(|k| k.pollfd.fd == fd && k.pollfd.events == events.bits())
            .unwrap_or_else(|| {
                self.kernel.push(KernelEntry {
                    pollfd: libc::pollfd {
                        fd,
                        events: events.bits(),
                        revents: 0,
                    },
                    refcount: 0,
                });
                self.kernel.len() - 1
            });
        self.kernel[kernel_index].refcount += 1;

        let generation = self.next_generation;
        self.next_generation += 1;
        let registration = Registration {
            kernel_index,
            callback: Box::new(callback),
            generation,
        };
        let slot = match self.free_slots.pop() {
            Some(i) => {
                self.registrations[i] = Some(registration);
                i
            }
            None => {
                self.registrations.push(Some(registration));
                self.registrations.len() - 1
            }
        };
        ReadinessHandle(slot)
    }

    /// Removes a registration. Idempotent-unsafe: calling this twice on the
    /// same handle, or on a handle already consumed by readiness dispatch,
    /// is a defect — `spec.md` §7 treats runtime-invariant violations as
    /// bugs, so this aborts rather than returning an error.
    pub fn unregister(&mut self, handle: ReadinessHandle) {
        let registration = self.registrations[handle.0]
            .take()
            .expect("unregister called on an invalid or already-removed handle");
        self.free_slots.push(handle.0);

        let kidx = registration.kernel_index;
        self.kernel[kidx].refcount -= 1;
        if self.kernel[kidx].refcount == 0 {
            self.kernel.remove(kidx);
            for r in self.registrations.iter_mut().flatten() {
                if r.kernel_index > kidx {
                    r.kernel_index -= 1;
                }
            }
        }
    }

    /// Schedules `callback` to run no earlier than `delay` from now.
    /// Callers that want the timer cancelled automatically when a fiber's
    /// resources are released should also call
    /// `pool.on_release(move || reactor.cancel_timer(id))`.
    pub fn set_timer(&mut self, delay: Duration, callback: impl FnOnce() + 'static) -> TimerId {
        self.timers.set_timer(delay, callback)
    }

    pub fn cancel_timer(&mut self, timer: TimerId) {
        self.timers.cancel(timer);
    }

    /// Registers a callback that runs once per tick, before the kernel
    /// poll, until unregistered.
    pub fn register_prepoll(&mut self, callback: impl FnMut() + 'static) -> PrepollId {
        self.prepolls.register(callback)
    }

    pub fn unregister_prepoll(&mut self, prepoll: PrepollId) {
        self.prepolls.unregister(prepoll)
    }

    /// Registers a callback that runs once, on the next tick's prepoll
    /// step, then removes itself. This is how wait-queue wake-ups defer
    /// resumption out of the waker's call stack (`spec.md` §4.5).
    pub fn register_prepoll_once(&mut self, callback: impl FnOnce() + 'static) -> PrepollId {
        self.prepolls.register_once(callback)
    }

    /// True if nothing is registered: no readiness interest, no live
    /// timers, no prepolls. A surviving registration at the point the last
    /// fiber exits is a defect (`spec.md` §8's "a surviving registration at
    /// process exit is a defect that must be diagnosed") — callers use
    /// this to detect it.
    pub fn is_quiescent(&mut self) -> bool {
        self.registrations.iter().all(Option::is_none) && self.timers.is_empty() && self.prepolls.is_empty()
    }

    /// Logs (at `error` level) a description of everything still
    /// registered, for the shutdown diagnostic described above.
    pub fn describe_leaked_registrations(&self) -> Vec<String> {
        self.registrations
            .iter()
            .enumerate()
            .filter_map(|(i, r)| {
                r.as_ref().map(|r| {
                    format!(
                        "readiness handle {i} on fd {}",
                        self.kernel[r.kernel_index].pollfd.fd
                    )
                })
            })
            .collect()
    }

    /// Runs exactly one reactor tick.
    pub fn invoke(&mut self) {
        self.timers.fire_due();
        self.prepolls.run();

        let timeout_ms = match self.timers.next_timeout_ms() {
            Some(ms) => ms.min(i32::MAX as u64) as libc::c_int,
            None => -1,
        };

        let rc = unsafe {
            libc::poll(
                self.kernel.as_mut_ptr(),
                self.kernel.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        clock::refresh();

        if rc > 0 {
            self.dispatch_ready();
        } else if rc == 0 {
            self.timers.fire_head();
        }
        // rc < 0: EINTR and friends are not reported to callers (`spec.md`
        // §4.3's "the reactor never returns errors to callers"); the next
        // tick simply re-polls with a freshly computed timeout.
    }

    fn dispatch_ready(&mut self) {
        // Collect (index, revents, generation) first, in handle-table
        // order, so that a callback mutating `self.registrations`/
        // `self.kernel` (most commonly: unregistering its own handle once
        // its fiber resumes) can't invalidate indices we haven't visited
        // yet.
        let ready: Vec<(usize, libc::c_short, u64)> = self
            .registrations
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r.kernel_index, r.generation)))
            .filter_map(|(i, kidx, generation)| {
                let revents = self.kernel[kidx].pollfd.revents;
                if revents != 0 {
                    Some((i, revents, generation))
                } else {
                    None
                }
            })
            .collect();

        for (i, revents, generation) in ready {
            // Swap the callback out to a no-op while it runs, sidestepping
            // the double-mutable-borrow of `self`. The callback commonly
            // unregisters its own handle and resumes a fiber that
            // re-registers on the same fd before suspending again —
            // `free_slots.pop()` can then hand slot `i` straight back out
            // to that (or any other) new registration before this call
            // returns. The generation check below is what tells the two
            // apart: only restore the saved callback if slot `i` still
            // holds the very registration we took it from, not whatever
            // now-unrelated registration happens to have landed there.
            let callback = match self.registrations.get_mut(i) {
                Some(Some(reg)) if reg.generation == generation => {
                    Some(std::mem::replace(&mut reg.callback, Box::new(|_| {})))
                }
                _ => None,
            };
            let Some(mut callback) = callback else { continue };
            callback(Events::from_bits_truncate(revents));
            if let Some(Some(reg)) = self.registrations.get_mut(i) {
                if reg.generation == generation {
                    reg.callback = callback;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn readiness_fires_on_writable_pipe() {
        let (_r, w) = {
            let mut fds = [0 as libc::c_int; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            assert_eq!(rc, 0);
            (fds[0], fds[1])
        };

        let mut reactor = Reactor::new();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let handle = reactor.register(w, Events::WRITABLE, move |events| {
            assert!(events.contains(Events::WRITABLE));
            *fired2.borrow_mut() = true;
        });
        reactor.invoke();
        assert!(*fired.borrow());
        reactor.unregister(handle);

        unsafe {
            libc::close(w);
            libc::close(_r);
        }
    }

    #[test]
    fn shared_kernel_entry_deduplicates_and_compacts() {
        let mut reactor = Reactor::new();
        let mut fds = [0 as libc::c_int; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let w = fds[1];

        let h1 = reactor.register(w, Events::WRITABLE, |_| {});
        let h2 = reactor.register(w, Events::WRITABLE, |_| {});
        assert_eq!(reactor.kernel.len(), 1);
        assert_eq!(reactor.kernel[0].refcount, 2);

        reactor.unregister(h1);
        assert_eq!(reactor.kernel.len(), 1, "kernel entry survives while one handle remains");
        reactor.unregister(h2);
        assert_eq!(reactor.kernel.len(), 0, "last handle removal compacts the kernel array");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn is_quiescent_after_everything_unregistered() {
        let mut reactor = Reactor::new();
        assert!(reactor.is_quiescent());
        let id = reactor.register_prepoll(|| {});
        assert!(!reactor.is_quiescent());
        reactor.unregister_prepoll(id);
        assert!(reactor.is_quiescent());
    }
}
