//! Fiber stack allocation (`spec.md` §4.1).
//!
//! Stacks are `mmap`'d with a leading guard page (`PROT_NONE`) and the
//! remainder made read-write (not executable — nothing ever runs off a
//! fiber stack; `context.rs`'s `swapcontext` only repoints the stack
//! pointer), following the same mmap-then-mprotect sequence used by
//! stackful-coroutine allocators generally (see `JonasKruckenberg-k23`'s
//! `fiber` crate's `DefaultFiberStack`). Released
//! stacks are not returned to the operating system immediately: exactly one
//! region is kept in a "pending" slot, because `release` is typically
//! called on the very stack that is being released — freeing it
//! synchronously would unmap memory the running fiber's epilogue is still
//! executing on.

use crate::error::{Error, Result};
use std::cell::RefCell;

/// Minimum guard size accepted by [`StackPool::allocate`]; rounded up to
/// a whole number of pages.
pub const MIN_GUARD_SIZE: usize = 8 * 1024;

/// A fiber stack: `[base, base + size)` is the usable (readable + writable)
/// region; a guard region of at least [`MIN_GUARD_SIZE`] sits immediately
/// below `base` and is `PROT_NONE`.
#[derive(Debug)]
pub struct Stack {
    /// Address of the mapping, i.e. the start of the guard page(s).
    map_addr: *mut libc::c_void,
    /// Total mapped length (guard + usable region).
    map_len: usize,
    /// Start of the usable region.
    base: *mut libc::c_void,
    /// Length of the usable region.
    size: usize,
}

// Safety: a `Stack` is only ever touched from the single cooperative thread
// this runtime pins itself to (`spec.md` §5); it is never shared across
// threads, but the runtime's executor-local statics need it to be
// unconditionally movable between the struct that owns it.
unsafe impl Send for Stack {}

impl Stack {
    /// Top of the usable region — the initial stack pointer on platforms
    /// where the stack grows down (every target this crate supports).
    pub fn top(&self) -> *mut libc::c_void {
        // Safety: `base + size` stays within the mapping by construction.
        unsafe { self.base.add(self.size) }
    }

    /// Start of the usable region.
    pub fn base(&self) -> *mut libc::c_void {
        self.base
    }

    /// Size in bytes of the usable region.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    assert!(ps > 0, "sysconf(_SC_PAGESIZE) failed");
    ps as usize
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn map_stack(size: usize) -> Result<Stack> {
    let page = page_size();
    let guard = round_up(MIN_GUARD_SIZE, page);
    let usable = round_up(size, page);
    let map_len = guard + usable;

    // Safety: standard anonymous-mapping FFI call; arguments are checked
    // just below.
    let map_addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            map_len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if map_addr == libc::MAP_FAILED {
        return Err(Error::StackAlloc { size });
    }

    // Safety: `map_addr` is a fresh mapping of `map_len` bytes; `guard` is
    // within range and `usable` is the remainder.
    let base = unsafe { map_addr.add(guard) };
    let rc = unsafe { libc::mprotect(base, usable, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        unsafe {
            libc::munmap(map_addr, map_len);
        }
        return Err(Error::StackAlloc { size });
    }

    Ok(Stack {
        map_addr,
        map_len,
        base,
        size: usable,
    })
}

fn unmap_stack(stack: Stack) {
    // Safety: `map_addr`/`map_len` describe exactly the mapping created in
    // `map_stack`, and `stack` is being consumed so no one can use it
    // afterwards.
    unsafe {
        libc::munmap(stack.map_addr, stack.map_len);
    }
}

/// Hands out and recycles fiber stacks (`spec.md` §4.1).
///
/// `release` defers the actual `munmap` of the stack it's given: at most
/// one region sits in the "pending" slot at a time, and it is only
/// actually unmapped on the *next* `allocate` or `release` call.
#[derive(Default)]
pub struct StackPool {
    pending: RefCell<Option<Stack>>,
}

impl StackPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a stack of at least `size` usable bytes with a guard page
    /// below it. May flush the previously pending released stack to the OS
    /// as a side effect.
    pub fn allocate(&self, size: usize) -> Result<Stack> {
        self.flush_pending();
        map_stack(size)
    }

    /// Returns `stack` for later reuse. The region is *not* unmapped
    /// immediately — see the module docs — it becomes the new pending
    /// region, and whatever was pending before (if anything) is unmapped
    /// now.
    pub fn release(&self, stack: Stack) {
        let previous = self.pending.replace(Some(stack));
        if let Some(previous) = previous {
            unmap_stack(previous);
        }
    }

    fn flush_pending(&self) {
        if let Some(stack) = self.pending.borrow_mut().take() {
            unmap_stack(stack);
        }
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        self.flush_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_gives_usable_region_of_requested_size() {
        let pool = StackPool::new();
        let stack = pool.allocate(64 * 1024).unwrap();
        assert!(stack.size() >= 64 * 1024);
        // Usable region must be writable: touch both ends.
        unsafe {
            let base = stack.base() as *mut u8;
            base.write(0xAA);
            base.add(stack.size() - 1).write(0xBB);
            assert_eq!(base.read(), 0xAA);
        }
    }

    #[test]
    fn release_defers_exactly_one_pending_region() {
        let pool = StackPool::new();
        let a = pool.allocate(64 * 1024).unwrap();
        pool.release(a);
        assert!(pool.pending.borrow().is_some());
        let b = pool.allocate(64 * 1024).unwrap();
        // Allocating flushed the previously pending region.
        assert!(pool.pending.borrow().is_none());
        pool.release(b);
        assert!(pool.pending.borrow().is_some());
    }
}
