//! Blocking-style syscall wrappers (`spec.md` §4.4): each attempts the
//! non-blocking call, and on `EWOULDBLOCK`/`EINPROGRESS` registers
//! readiness with the reactor and suspends instead of actually blocking
//! the process. On resume it checks the fiber's alarm flag first — a
//! watchdog firing while suspended here means "terminate now", not
//! "retry" (`spec.md` §4.4's wrapper contract).

use super::{current_id, watchdog, with_executor};
use crate::error::{Error, Result};
use crate::reactor::Events;
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

fn terminate_if_alarmed() {
    if watchdog::alarm_received() {
        super::exit();
    }
}

/// Suspends the current fiber until `fd` is ready for `events`, then
/// returns. Checks the alarm flag on resume and terminates the fiber
/// instead of returning if it's set.
fn wait_for(fd: RawFd, events: Events) -> Result<()> {
    let id = current_id();
    let handle = with_executor(|ex| ex.reactor_mut().register(fd, events, move |_ev| super::resume(id)));
    super::suspend_self();
    with_executor(|ex| ex.reactor_mut().unregister(handle));
    terminate_if_alarmed();
    Ok(())
}

pub fn wait_readable(fd: RawFd) -> Result<()> {
    wait_for(fd, Events::READABLE)
}

pub fn wait_writable(fd: RawFd) -> Result<()> {
    wait_for(fd, Events::WRITABLE)
}

fn retry_on_would_block<T>(fd: RawFd, events: Events, mut attempt: impl FnMut() -> io::Result<T>) -> Result<T> {
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) => wait_for(fd, events)?,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EWOULDBLOCK) | Some(libc::EAGAIN) | Some(libc::EINPROGRESS) | Some(libc::EINTR)
    )
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads into `buf`, suspending the caller while `fd` isn't yet readable.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    retry_on_would_block(fd, Events::READABLE, || {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

/// Writes `buf`, suspending the caller while `fd` isn't yet writable.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    retry_on_would_block(fd, Events::WRITABLE, || {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

/// Accepts a connection on listening socket `fd`, returning the new
/// (already non-blocking) descriptor and its peer address.
pub fn accept(fd: RawFd) -> Result<(RawFd, libc::sockaddr_in)> {
    retry_on_would_block(fd, Events::READABLE, || {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let conn = unsafe { libc::accept(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        set_nonblocking(conn)?;
        Ok((conn, addr))
    })
}

/// Connects `fd` to `addr`, suspending until the connection completes or
/// fails.
pub fn connect(fd: RawFd, addr: &libc::sockaddr_in) -> Result<()> {
    let rc = unsafe {
        libc::connect(
            fd,
            addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(Error::Io(err));
    }
    wait_writable(fd)?;

    let mut sockerr: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut sockerr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if sockerr != 0 {
        return Err(Error::Io(io::Error::from_raw_os_error(sockerr)));
    }
    Ok(())
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> Result<usize> {
    retry_on_would_block(fd, Events::WRITABLE, || {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<usize> {
    retry_on_would_block(fd, Events::READABLE, || {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

pub fn sendto(fd: RawFd, buf: &[u8], flags: libc::c_int, dest: &libc::sockaddr_in) -> Result<usize> {
    retry_on_would_block(fd, Events::WRITABLE, || {
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                dest as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

pub fn recvfrom(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> Result<(usize, libc::sockaddr_in)> {
    retry_on_would_block(fd, Events::READABLE, || {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok((n as usize, addr))
        }
    })
}

pub fn sendmsg(fd: RawFd, msg: &libc::msghdr, flags: libc::c_int) -> Result<usize> {
    retry_on_would_block(fd, Events::WRITABLE, || {
        let n = unsafe { libc::sendmsg(fd, msg as *const libc::msghdr, flags) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

pub fn recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: libc::c_int) -> Result<usize> {
    retry_on_would_block(fd, Events::READABLE, || {
        let n = unsafe { libc::recvmsg(fd, msg as *mut libc::msghdr, flags) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}

/// `poll(2)`, suspension-aware: a zero-timeout poll is tried first; if
/// nothing is ready and a non-zero (or no) timeout was requested, a
/// reactor timer is armed (unless `timeout` is `None`, meaning wait
/// forever) and every descriptor is registered, then the caller suspends.
/// On resume the function loops back to the zero-timeout poll rather than
/// trusting the wake-up reason, so it always returns fresh `revents`.
pub fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> Result<usize> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::Io(e));
        }
        if rc > 0 {
            return Ok(rc as usize);
        }
        match timeout {
            None => suspend_until_any_ready(fds),
            Some(d) if d.is_zero() => return Ok(0),
            Some(d) => {
                if suspend_until_any_ready_or_timeout(fds, d)? {
                    continue;
                }
                return Ok(0);
            }
        }
    }
}

fn register_all(fds: &[libc::pollfd], id: super::FiberId) -> Vec<crate::reactor::ReadinessHandle> {
    fds.iter()
        .map(|pfd| {
            let events = Events::from_bits_truncate(pfd.events);
            with_executor(|ex| ex.reactor_mut().register(pfd.fd, events, move |_ev| super::resume(id)))
        })
        .collect()
}

fn suspend_until_any_ready(fds: &[libc::pollfd]) -> Result<()> {
    let id = current_id();
    let handles = register_all(fds, id);
    super::suspend_self();
    with_executor(|ex| {
        for handle in handles {
            ex.reactor_mut().unregister(handle);
        }
    });
    terminate_if_alarmed();
    Ok(())
}

/// Returns `true` if woken by readiness (caller should re-poll), `false`
/// if woken because the timeout elapsed.
fn suspend_until_any_ready_or_timeout(fds: &[libc::pollfd], timeout: Duration) -> Result<bool> {
    let id = current_id();
    let timed_out = Rc::new(Cell::new(false));
    let timed_out_in_timer = timed_out.clone();
    let timer = with_executor(|ex| {
        ex.reactor_mut().set_timer(timeout, move || {
            timed_out_in_timer.set(true);
            super::resume(id);
        })
    });
    let handles = register_all(fds, id);

    super::suspend_self();

    with_executor(|ex| {
        for handle in handles {
            ex.reactor_mut().unregister(handle);
        }
        ex.reactor_mut().cancel_timer(timer);
    });
    terminate_if_alarmed();
    Ok(!timed_out.get())
}

/// The three file-descriptor sets `select(2)` distinguishes, expressed as
/// plain slices rather than bitmaps.
pub struct SelectSets<'a> {
    pub read: &'a [RawFd],
    pub write: &'a [RawFd],
    pub except: &'a [RawFd],
}

#[derive(Debug, Default)]
pub struct SelectReady {
    pub read: Vec<RawFd>,
    pub write: Vec<RawFd>,
    pub except: Vec<RawFd>,
}

/// `select(2)`, implemented on top of [`poll`] per the spec's explicit
/// "select is implemented on top of poll" design choice: translate the
/// set triple into a poll-descriptor array, poll once, translate back.
pub fn select(sets: SelectSets, timeout: Option<Duration>) -> Result<SelectReady> {
    let mut fds = Vec::with_capacity(sets.read.len() + sets.write.len() + sets.except.len());
    for &fd in sets.read {
        fds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
    }
    for &fd in sets.write {
        fds.push(libc::pollfd { fd, events: libc::POLLOUT, revents: 0 });
    }
    for &fd in sets.except {
        fds.push(libc::pollfd { fd, events: libc::POLLPRI, revents: 0 });
    }

    poll(&mut fds, timeout)?;

    let mut ready = SelectReady::default();
    for pfd in &fds {
        if pfd.revents & libc::POLLIN != 0 {
            ready.read.push(pfd.fd);
        }
        if pfd.revents & libc::POLLOUT != 0 {
            ready.write.push(pfd.fd);
        }
        if pfd.revents & libc::POLLPRI != 0 {
            ready.except.push(pfd.fd);
        }
    }
    Ok(ready)
}

/// Suspends the current fiber for at least `duration`, measured by the
/// reactor's clock.
pub fn sleep(duration: Duration) {
    if duration.is_zero() {
        yield_now();
        return;
    }
    let id = current_id();
    let timer = with_executor(|ex| ex.reactor_mut().set_timer(duration, move || super::resume(id)));
    super::suspend_self();
    with_executor(|ex| ex.reactor_mut().cancel_timer(timer));
    terminate_if_alarmed();
}

pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms))
}

/// Alias kept for parity with the wrapper names the spec lists
/// (`nanosleep`); this runtime's clock only resolves to milliseconds, so
/// it behaves identically to [`sleep`].
pub fn nanosleep(duration: Duration) {
    sleep(duration)
}

pub fn millisleep(ms: u64) {
    sleep_ms(ms)
}

/// Suspends the current fiber until the next reactor tick's prepoll step,
/// then resumes — a bare yield with no I/O or timer attached.
pub fn yield_now() {
    let id = current_id();
    with_executor(|ex| {
        ex.reactor_mut().register_prepoll_once(move || super::resume(id));
    });
    super::suspend_self();
    terminate_if_alarmed();
}
