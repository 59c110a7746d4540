//! Fibers: user-visible cooperative tasks built on [`crate::context`] and
//! [`crate::stack`] (`spec.md` §4.4).
//!
//! A fiber is created and immediately started by [`Builder::start`] (or
//! the [`spawn`] shorthand): it runs inline, on its own stack, until its
//! first suspension point, at which point control returns to whoever
//! called `start`. Suspension happens only inside the wrappers in
//! [`wrappers`] (I/O, sleeps) or a contended lock in [`crate::sync`] —
//! never implicitly.
//!
//! The executor tracks, for every live fiber, the chain of "whoever
//! resumed me" contexts (`resume_chain`) and the stack of "who's currently
//! running, including nested starts" (`current`) — both genuine stacks,
//! not single slots, because a fiber can itself start another fiber
//! inline before its own first suspension (`spec.md` §4.4's "the core
//! guarantees this save/restore even across nested starts").

pub mod csw;
pub mod env;
pub mod exception;
pub mod watchdog;
pub mod wrappers;

pub use exception::{catch, die, exit};
pub use wrappers::*;

use crate::context::{self, MachineContext};
use crate::pool::Pool;
use crate::reactor::{Reactor, TimerId};
use crate::stack::{Stack, StackPool};
use std::cell::{RefCell, UnsafeCell};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;

const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Identifies a fiber for its whole lifetime. Small and `Copy`, as the
/// spec's "identity (small integer)" calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u32);

/// Snapshot of a fiber's observable attributes, returned by [`list`].
/// Deliberately a deep, owned copy — the contract requires listing to be
/// safe to call from any fiber at any time, which rules out handing back
/// borrows into another fiber's pool.
#[derive(Debug, Clone)]
pub struct FiberInfo {
    pub id: FiberId,
    pub name: String,
    pub stack_size: usize,
    /// The stack pointer this fiber's context would resume at, if its
    /// machine context has been saved at least once and the platform
    /// exposes it (see [`crate::context::MachineContext::register_snapshot`]).
    /// `None` for a fiber that has never yet suspended (its context is
    /// still in the pre-`init` state) or on platforms without register
    /// access through `ucontext_t`.
    pub stack_pointer: Option<usize>,
    /// The program counter this fiber's context would resume at. Same
    /// availability caveats as `stack_pointer`.
    pub program_counter: Option<usize>,
    pub language: Option<String>,
    pub timezone: Option<String>,
}

pub(crate) struct FiberRecord {
    id: FiberId,
    name: String,
    pool: Pool,
    stack: Option<Stack>,
    context: MachineContext,
    env: env::Overrides,
    alarm_received: bool,
    watchdog: Option<TimerId>,
}

pub(crate) struct Executor {
    reactor: Reactor,
    stacks: StackPool,
    root_pool: Pool,
    fibers: Vec<Option<FiberRecord>>,
    free_slots: Vec<usize>,
    next_id: u32,
    /// Stack of fibers currently "running", outermost first — has more
    /// than one entry exactly when a fiber started another fiber inline.
    current: Vec<FiberId>,
    /// Parallel stack of the context to swap back into when the fiber at
    /// the matching depth of `current` suspends.
    resume_chain: Vec<*mut MachineContext>,
}

impl Executor {
    fn new() -> Self {
        Executor {
            reactor: Reactor::new(),
            stacks: StackPool::new(),
            root_pool: Pool::new(),
            fibers: Vec::new(),
            free_slots: Vec::new(),
            next_id: 0,
            current: Vec::new(),
            resume_chain: Vec::new(),
        }
    }

    fn index_of(&self, id: FiberId) -> usize {
        self.fibers
            .iter()
            .position(|slot| matches!(slot, Some(r) if r.id == id))
            .expect("fiber id not found in executor's table")
    }

    fn fiber_mut(&mut self, id: FiberId) -> &mut FiberRecord {
        let idx = self.index_of(id);
        self.fibers[idx].as_mut().expect("fiber slot empty")
    }
}

impl Executor {
    /// The executor's reactor, for collaborators ([`crate::sync`]'s wait
    /// queue, the watchdog) that need to register timers, readiness, or
    /// deferred prepoll wake-ups.
    pub(crate) fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }
}

thread_local! {
    // Not a `RefCell`: a reactor callback dispatched from inside
    // `Reactor::invoke` (a readiness callback, a fired timer, a deferred
    // wake-up prepoll) routinely resumes a fiber, which runs until its
    // *own* next suspension point and, from inside a wrapper, calls back
    // into `with_executor` to register a new readiness interest or timer —
    // all before the outer `invoke()` call has returned. That is legitimate
    // nesting, not a bug, so a `RefCell` would panic on exactly the
    // common case. Single-threaded cooperative scheduling means these
    // nested calls are never concurrent, only re-entrant: each `&mut
    // Executor` handed to `f` is used for the duration of that call and
    // never stashed away past it, so the accesses never actually overlap.
    static EXECUTOR: UnsafeCell<Executor> = UnsafeCell::new(Executor::new());
}

pub(crate) fn with_executor<R>(f: impl FnOnce(&mut Executor) -> R) -> R {
    EXECUTOR.with(|cell| {
        // Safety: see the module-level note on `EXECUTOR` above.
        let executor = unsafe { &mut *cell.get() };
        f(executor)
    })
}

pub(crate) fn with_current_record<R>(f: impl FnOnce(&mut FiberRecord) -> R) -> R {
    with_executor(|ex| {
        let id = *ex.current.last().expect("no fiber is currently running");
        f(ex.fiber_mut(id))
    })
}

/// The fiber currently running. Panics if called outside any fiber (e.g.
/// from the process's outermost reactor-driving loop).
pub fn current() -> FiberId {
    current_id()
}

pub(crate) fn current_id() -> FiberId {
    with_executor(|ex| *ex.current.last().expect("no fiber is currently running"))
}

/// This fiber's display name.
pub fn name() -> String {
    with_current_record(|r| r.name.clone())
}

/// The current fiber's own pool — the scope that [`crate::sync`]'s lock
/// types create their per-holder subpools in.
pub fn current_pool() -> Pool {
    with_current_record(|r| r.pool.clone())
}

/// Convenience for code that just needs to derive a subpool of the
/// current fiber's pool.
pub fn with_current_pool<R>(f: impl FnOnce(&Pool) -> R) -> R {
    with_current_record(|r| f(&r.pool))
}

/// Number of fibers currently registered (not-yet-finished), including the
/// one calling this if any.
pub fn count() -> usize {
    with_executor(|ex| ex.fibers.iter().filter(|s| s.is_some()).count())
}

/// A deep-copied snapshot of every live fiber's observable attributes.
/// Safe to call from any fiber, or from outside all fibers.
pub fn list() -> Vec<FiberInfo> {
    with_executor(|ex| {
        ex.fibers
            .iter()
            .flatten()
            .map(|r| {
                let snapshot = r.context.register_snapshot();
                FiberInfo {
                    id: r.id,
                    name: r.name.clone(),
                    stack_size: r.stack.as_ref().map(|s| s.size()).unwrap_or(0),
                    stack_pointer: snapshot.map(|(sp, _)| sp),
                    program_counter: snapshot.map(|(_, pc)| pc),
                    language: r.env.language.clone(),
                    timezone: r.env.timezone.clone(),
                }
            })
            .collect()
    })
}

/// Runs exactly one reactor tick. The process's outermost loop (see
/// [`crate::server`]) calls this in a `while fiber::count() > 0` loop;
/// nothing else drives the reactor.
pub fn tick() {
    with_executor(|ex| ex.reactor.invoke());
}

/// Logs (at `error` level) any reactor registration, timer, or prepoll
/// still alive. Meant to be called once the last fiber has finished —
/// a surviving registration at that point is a defect (`spec.md` §8).
pub fn check_for_leaks_at_shutdown() {
    with_executor(|ex| {
        if !ex.reactor.is_quiescent() {
            for line in ex.reactor.describe_leaked_registrations() {
                log::error!("leaked at shutdown: {line}");
            }
        }
    });
}

pub(crate) fn raise_alarm(id: FiberId) {
    with_executor(|ex| {
        ex.fiber_mut(id).alarm_received = true;
        ex.fiber_mut(id).watchdog = None;
    });
    resume(id);
}

/// Fiber factory; configure with [`name`](Builder::name) and
/// [`stack_size`](Builder::stack_size), then [`start`](Builder::start) it.
pub struct Builder {
    name: String,
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            name: String::from("fiber"),
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Creates the fiber and runs it inline until its first suspension
    /// point (or to completion, if it never suspends).
    pub fn start<F>(self, entry: F) -> crate::error::Result<FiberId>
    where
        F: FnOnce() + 'static,
    {
        let id = with_executor(|ex| {
            let stack = ex.stacks.allocate(self.stack_size)?;
            let mut context = MachineContext::empty();
            unsafe { context.init(&stack) };
            let pool = ex.root_pool.subpool();
            let id = FiberId(ex.next_id);
            ex.next_id += 1;
            let record = FiberRecord {
                id,
                name: self.name.clone(),
                pool,
                stack: Some(stack),
                context,
                env: env::Overrides::default(),
                alarm_received: false,
                watchdog: None,
            };
            let slot = match ex.free_slots.pop() {
                Some(i) => {
                    ex.fibers[i] = Some(record);
                    i
                }
                None => {
                    ex.fibers.push(Some(record));
                    ex.fibers.len() - 1
                }
            };
            let _ = slot;
            crate::error::Result::Ok(id)
        })?;

        let name = self.name;
        context::set_pending_entry(Box::new(move || {
            run_entry(id, name, entry);
        }));
        resume(id);
        Ok(id)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for `Builder::new().start(entry)`.
pub fn spawn<F>(entry: F) -> crate::error::Result<FiberId>
where
    F: FnOnce() + 'static,
{
    Builder::new().start(entry)
}

fn run_entry(id: FiberId, name: String, entry: impl FnOnce()) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(entry));
    if let Err(payload) = outcome {
        if let Some(exception::DieSignal(msg)) = payload.downcast_ref() {
            log::error!("fiber {:?} ({name}) terminated on an uncaught die: {msg}", id);
        } else if payload.downcast_ref::<exception::ExitSignal>().is_none() {
            log::error!("fiber {:?} ({name}) panicked", id);
        }
    }
    finish_current_fiber();
}

/// Resumes fiber `id`: saves the caller's machine context and swaps into
/// the fiber's. Returns once the fiber suspends (or finishes).
pub(crate) fn resume(id: FiberId) {
    let mut caller_ctx = MachineContext::empty();
    let fiber_ctx_ptr: *mut MachineContext = with_executor(|ex| {
        ex.current.push(id);
        ex.resume_chain.push(&mut caller_ctx as *mut _);
        &mut ex.fiber_mut(id).context as *mut MachineContext
    });

    env::apply_current();
    unsafe {
        caller_ctx.swap(&mut *fiber_ctx_ptr);
    }
    env::clear_on_suspend();
    csw::bump();

    with_executor(|ex| {
        ex.current.pop();
        ex.resume_chain.pop();
    });
}

/// Suspends the current fiber, returning control to whoever most recently
/// resumed it. Called only from inside [`wrappers`] and [`crate::sync`].
pub(crate) fn suspend_self() {
    let (fiber_ctx_ptr, caller_ctx_ptr) = with_executor(|ex| {
        let id = *ex.current.last().expect("suspend_self called outside a fiber");
        let fiber_ctx_ptr = &mut ex.fiber_mut(id).context as *mut MachineContext;
        let caller_ctx_ptr = *ex
            .resume_chain
            .last()
            .expect("suspend_self called with no caller context");
        (fiber_ctx_ptr, caller_ctx_ptr)
    });
    unsafe {
        (*fiber_ctx_ptr).swap(&mut *caller_ctx_ptr);
    }
}

fn finish_current_fiber() -> ! {
    // Take the fiber's record (and therefore its stack and pool) out of the
    // executor's tables first, then drop the executor borrow before
    // releasing the pool: the release callbacks it runs (e.g. a held
    // mutex's "clear holder, wake a sleeper") call back into
    // `with_executor` themselves, and doing that after this closure has
    // already returned keeps every `with_executor` call here short and
    // non-overlapping, per its reentrancy contract.
    let (mut record, caller_ctx_ptr) = with_executor(|ex| {
        let id = *ex.current.last().expect("finish_current_fiber called outside a fiber");
        let slot_idx = ex.index_of(id);
        let mut record = ex.fibers[slot_idx].take().expect("fiber record missing at finish");
        ex.free_slots.push(slot_idx);

        // A still-armed watchdog is scoped to this fiber; if its timer
        // outlived the fiber it would later fire `raise_alarm` against a
        // slot that's already gone. Cancel it here the same way pool
        // teardown cancels every other per-fiber timer.
        if let Some(timer) = record.watchdog.take() {
            ex.reactor.cancel_timer(timer);
        }

        let caller_ctx_ptr = *ex
            .resume_chain
            .last()
            .expect("finishing fiber has no caller to return to");
        (record, caller_ctx_ptr)
    });

    let stack = record.stack.take().expect("finishing fiber has no stack");
    let mut fiber_ctx = std::mem::replace(&mut record.context, MachineContext::empty());
    record.pool.release();
    drop(record);

    with_executor(|ex| ex.stacks.release(stack));

    unsafe {
        fiber_ctx.swap(&mut *caller_ctx_ptr);
    }
    unreachable!("a finished fiber's machine context was resumed again");
}

/// A handle to a fiber's eventual result. Built on [`crate::sync::wait_queue`],
/// so waiting for completion goes through the same deferred-wakeup
/// discipline as every other suspension.
pub struct JoinHandle<T> {
    shared: Rc<JoinShared<T>>,
}

struct JoinShared<T> {
    result: RefCell<Option<T>>,
    waiters: crate::sync::wait_queue::WaitQueue,
}

/// Starts `entry` as a new fiber and returns a handle that can be
/// [`join`](JoinHandle::join)ed for its return value.
pub fn spawn_joinable<F, T>(name: impl Into<String>, entry: F) -> crate::error::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let shared = Rc::new(JoinShared {
        result: RefCell::new(None),
        waiters: crate::sync::wait_queue::WaitQueue::new(),
    });
    let shared_in_fiber = shared.clone();
    Builder::new().name(name).start(move || {
        let value = entry();
        *shared_in_fiber.result.borrow_mut() = Some(value);
        shared_in_fiber.waiters.wake_up();
    })?;
    Ok(JoinHandle { shared })
}

impl<T> JoinHandle<T> {
    /// Suspends the current fiber until the joined fiber has finished,
    /// then returns its result.
    pub fn join(self) -> T {
        loop {
            if let Some(value) = self.shared.result.borrow_mut().take() {
                return value;
            }
            self.shared.waiters.sleep_on();
        }
    }
}
