//! Synchronization primitives built from the fiber/reactor suspension
//! points (`spec.md` §4.5–§4.7): a wait queue, a mutex, and a reader/writer
//! lock. None of these are `Send`/`Sync` — they coordinate fibers on a
//! single cooperative thread, not threads.

pub mod mutex;
pub mod rwlock;
pub mod wait_queue;

pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use wait_queue::WaitQueue;
