//! The machine context: the register/stack switch that underlies every
//! fiber suspension (`spec.md` §3/§4.2).
//!
//! This implements the **ucontext-style swap**, one of the two candidate
//! mechanisms the spec names (see `DESIGN.md`'s Open Question decisions):
//! `getcontext`/`makecontext`/`swapcontext` from libc. `swapcontext`
//! already gives us exactly the `swap(old, new)` primitive the spec
//! requires — atomically stash the caller's state into `old` and resume
//! `new` — so both "suspend into the reactor" and "fiber function
//! finishes, resume the caller" are the same call.
//!
//! The tricky part of the contract is "initialize arranges that the very
//! first resume calls F(A)". `makecontext` only reliably accepts a
//! zero-argument entry point across platforms (passing a 64-bit pointer
//! through its variadic `int` arguments is non-portable), so instead the
//! argument is handed off through a thread-local slot set by the resumer
//! *immediately* before the swap that performs the first resume. Because
//! this runtime is single-threaded and cooperative, nothing else can run
//! between that assignment and the swap, so there is no race: the
//! trampoline function below always finds exactly the payload meant for
//! it.

use crate::stack::Stack;
use std::cell::RefCell;
use std::mem::MaybeUninit;

/// The closure a fresh machine context runs the first time it is resumed.
pub type Entry = Box<dyn FnOnce()>;

thread_local! {
    static PENDING_ENTRY: RefCell<Option<Entry>> = RefCell::new(None);
}

/// Stashes `entry` for the trampoline to pick up. Must be called by the
/// resumer immediately before the `swap` call that performs a context's
/// *first* resume; any other ordering is a bug.
pub fn set_pending_entry(entry: Entry) {
    PENDING_ENTRY.with(|cell| {
        let previous = cell.borrow_mut().replace(entry);
        debug_assert!(
            previous.is_none(),
            "a pending fiber entry was overwritten before it ran"
        );
    });
}

extern "C" fn trampoline() {
    let entry = PENDING_ENTRY
        .with(|cell| cell.borrow_mut().take())
        .expect("machine context trampoline invoked with no pending entry");
    entry();
    // `entry` is expected to end by swapping away to the fiber's caller
    // context (see `fiber::Fiber::run_on_stack`), never by returning.
    unreachable!("fiber entry function returned instead of swapping out");
}

/// An opaque register + stack-pointer snapshot.
pub struct MachineContext {
    ctx: Box<MaybeUninit<libc::ucontext_t>>,
    /// Whether `ctx` currently holds a value written by `getcontext` or
    /// `swapcontext`, as opposed to the uninitialized state `empty()`
    /// leaves it in. Tracked so [`register_snapshot`](Self::register_snapshot)
    /// never reads uninitialized memory.
    initialized: bool,
}

impl MachineContext {
    /// A context with no saved state yet. Valid as the "old" argument of a
    /// [`swap`](Self::swap) (it will be filled in by that call) but not as
    /// a resume target until [`init`](Self::init) has been called on it.
    pub fn empty() -> Self {
        MachineContext {
            ctx: Box::new(MaybeUninit::uninit()),
            initialized: false,
        }
    }

    /// Arranges that the first resume of this context calls the entry
    /// passed to [`set_pending_entry`] (by the resumer) on `stack`, and
    /// that if that entry ever returns instead of swapping out, the
    /// process aborts via `unreachable!` rather than running off the end
    /// of a fiber stack.
    ///
    /// # Safety
    ///
    /// `stack` must outlive every resume of this context.
    pub unsafe fn init(&mut self, stack: &Stack) {
        let ucp = self.ctx.as_mut_ptr();
        let rc = libc::getcontext(ucp);
        assert_eq!(rc, 0, "getcontext failed: {}", std::io::Error::last_os_error());

        (*ucp).uc_stack.ss_sp = stack.base();
        (*ucp).uc_stack.ss_size = stack.size();
        (*ucp).uc_stack.ss_flags = 0;
        (*ucp).uc_link = std::ptr::null_mut();

        libc::makecontext(ucp, trampoline, 0);
        self.initialized = true;
    }

    /// Saves the caller's state into `self` and resumes `target`.
    ///
    /// # Safety
    ///
    /// `target` must have been produced by [`init`](Self::init) (and not
    /// yet have finished running its entry, for a first resume) or must be
    /// a context previously suspended via a `swap` that used it as `self`.
    pub unsafe fn swap(&mut self, target: &mut MachineContext) {
        let rc = libc::swapcontext(self.ctx.as_mut_ptr(), target.ctx.as_ptr());
        self.initialized = true;
        // A `-1` return means the syscall-level restore failed, which can
        // only happen if the context itself is corrupt — a runtime-invariant
        // violation, not a reportable error (`spec.md` §7).
        assert_eq!(
            rc,
            0,
            "swapcontext failed: corrupt machine context or signal mask restore error"
        );
    }

    /// The stack pointer and instruction pointer this context would resume
    /// at, on targets where the registers are reachable through
    /// `ucontext_t`. Used only by [`crate::fiber::list`]'s introspection
    /// snapshot (`spec.md` §4.4) — nothing in the runtime's control flow
    /// reads this.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn register_snapshot(&self) -> Option<(usize, usize)> {
        if !self.initialized {
            return None;
        }
        // Safety: `initialized` is only set once `getcontext`/`swapcontext`
        // has written a valid `ucontext_t` into `ctx`.
        let uc = unsafe { &*self.ctx.as_ptr() };
        let sp = uc.uc_mcontext.gregs[libc::REG_RSP as usize] as usize;
        let pc = uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        Some((sp, pc))
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    pub fn register_snapshot(&self) -> Option<(usize, usize)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackPool;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn swap_into_fresh_context_runs_entry_once() {
        let pool = StackPool::new();
        let stack = pool.allocate(256 * 1024).unwrap();

        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();

        let mut caller = MachineContext::empty();
        let mut fiber_ctx = MachineContext::empty();
        unsafe { fiber_ctx.init(&stack) };

        // The entry closure needs to swap back into `caller` once it's
        // done. Both locals outlive the `caller.swap(..)` call below (it
        // only returns once the fiber has swapped back), so reaching them
        // through raw pointers captured before the move is sound here.
        let caller_ptr: *mut MachineContext = &mut caller;
        let fiber_ctx_ptr: *mut MachineContext = &mut fiber_ctx;
        set_pending_entry(Box::new(move || {
            ran2.set(true);
            unsafe { (*fiber_ctx_ptr).swap(&mut *caller_ptr) };
        }));

        unsafe { caller.swap(&mut fiber_ctx) };
        assert!(ran.get());

        // A context whose entry already ran and swapped back out is
        // finished; its stack goes back to the pool.
        pool.release(stack);
    }

    #[test]
    fn register_snapshot_is_none_before_any_save() {
        let ctx = MachineContext::empty();
        assert_eq!(ctx.register_snapshot(), None);
    }

    #[test]
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn register_snapshot_is_some_after_init() {
        let pool = StackPool::new();
        let stack = pool.allocate(256 * 1024).unwrap();

        let mut ctx = MachineContext::empty();
        unsafe { ctx.init(&stack) };
        let (sp, pc) = ctx.register_snapshot().expect("initialized context should expose registers");
        assert_ne!(sp, 0);
        assert_ne!(pc, 0);

        pool.release(stack);
    }
}
