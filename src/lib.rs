//! A cooperative-multitasking runtime for network-server processes.
//!
//! The pieces, bottom-up:
//!
//! - [`stack`]: guard-paged fiber stacks, pooled for reuse.
//! - [`context`]: the machine-context swap a fiber runs on.
//! - [`pool`]: scoped resource ownership — every fiber, and every lock
//!   it holds, lives in a [`pool::Pool`] that releases on drop or on
//!   its owning fiber's teardown.
//! - [`reactor`]: the single-threaded readiness/timer event loop this
//!   runtime blocks in — and the only place it does.
//! - [`fiber`]: fibers themselves: spawn, suspend, resume, join, plus
//!   the blocking-style syscall wrappers built on the reactor.
//! - [`sync`]: a wait queue, a mutex, and a reader/writer lock, all
//!   built from the fiber suspension points above.
//! - [`server`]: the listener/daemonization harness that ties it all
//!   together into a running process.
//!
//! None of this is `Send`/`Sync`: exactly one fiber runs at a time, on
//! one kernel thread, and the types say so.
//!
//! ```no_run
//! fn main() {
//!     pth::log::init(log::LevelFilter::Info);
//!
//!     pth::server::ServerConfig::new()
//!         .port(7878)
//!         .start(|fd| {
//!             let mut buf = [0u8; 1024];
//!             loop {
//!                 match pth::fiber::read(fd, &mut buf) {
//!                     Ok(0) | Err(_) => break,
//!                     Ok(n) => {
//!                         if pth::fiber::write(fd, &buf[..n]).is_err() {
//!                             break;
//!                         }
//!                     }
//!                 }
//!             }
//!         })
//!         .expect("failed to start server");
//!
//!     pth::server::run_until_idle();
//! }
//! ```

pub mod clock;
pub mod context;
pub mod error;
pub mod fiber;
pub mod log;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod stack;
pub mod sync;

pub use error::Result;
pub type StdResult<T, E> = std::result::Result<T, E>;
