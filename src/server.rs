//! Generic listener/daemonization harness (`spec.md` §4.8).
//!
//! Binds a listening socket, optionally chroots and drops privileges,
//! optionally daemonizes, then starts a listener fiber that accept-loops
//! and spawns a caller-supplied processor fiber per connection. The
//! caller drives everything afterwards with the "while any fiber is
//! live, tick" main loop — this harness doesn't hide that loop, it just
//! sets up the listener and hands control back.

use crate::error::{Error, Result};
use crate::fiber;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

const DEFAULT_PORT: u16 = 80;
const ROOT_DIR: &[u8] = b"/\0";
const DEV_NULL: &[u8] = b"/dev/null\0";

/// Builder for the harness's startup sequence, mirroring the teacher's
/// `FiberAttr`-style `new()` + setters + `Default` shape.
pub struct ServerConfig {
    port: u16,
    address: Ipv4Addr,
    chroot_dir: Option<String>,
    user: Option<String>,
    daemonize: bool,
    backtrace_on_segv: bool,
}

impl ServerConfig {
    pub fn new() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            address: Ipv4Addr::UNSPECIFIED,
            chroot_dir: None,
            user: None,
            daemonize: false,
            backtrace_on_segv: false,
        }
    }

    /// Parses `-p PORT` and `-a ADDRESS` out of `args`, leaving every other
    /// argument untouched — any further option parsing is the caller's
    /// responsibility (`spec.md` §6).
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Self::new();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "-p" => {
                    if let Some(v) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                        config.port = v;
                        i += 1;
                    }
                }
                "-a" => {
                    if let Some(v) = args.get(i + 1).and_then(|s| s.parse().ok()) {
                        config.address = v;
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        config
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(mut self, address: Ipv4Addr) -> Self {
        self.address = address;
        self
    }

    pub fn chroot(mut self, dir: impl Into<String>) -> Self {
        self.chroot_dir = Some(dir.into());
        self
    }

    pub fn drop_privileges_to(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn daemonize(mut self, yes: bool) -> Self {
        self.daemonize = yes;
        self
    }

    pub fn install_segv_backtrace_handler(mut self, yes: bool) -> Self {
        self.backtrace_on_segv = yes;
        self
    }

    /// Runs the harness's startup sequence: bind, chroot/setuid, daemonize,
    /// install the segfault handler, spawn the listener fiber. Returns
    /// once the listener fiber is spawned; the caller still owns the main
    /// loop.
    pub fn start<F>(self, processor: F) -> Result<()>
    where
        F: Fn(RawFd) + Clone + 'static,
    {
        let listen_fd = bind_listener(self.address, self.port)?;

        if let Some(dir) = &self.chroot_dir {
            do_chroot(dir)?;
        }
        if let Some(user) = &self.user {
            drop_privileges(user)?;
        }
        if self.backtrace_on_segv {
            install_segv_handler();
        }
        if self.daemonize {
            do_daemonize()?;
        }

        log::info!("listening on {}:{}", self.address, self.port);

        fiber::Builder::new()
            .name("listener")
            .start(move || listener_loop(listen_fd, processor))?;

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_listener(address: Ipv4Addr, port: u16) -> Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::Bind {
                addr: format!("{address}:{port}"),
                source: std::io::Error::last_os_error(),
            });
        }

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from(address).to_be() },
            sin_zero: [0; 8],
        };
        let rc = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if rc != 0 {
            let source = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Bind { addr: format!("{address}:{port}"), source });
        }

        if libc::listen(fd, 128) != 0 {
            let source = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Bind { addr: format!("{address}:{port}"), source });
        }

        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);

        Ok(fd)
    }
}

fn do_chroot(dir: &str) -> Result<()> {
    let c_dir = CString::new(dir).expect("chroot dir contains an interior NUL");
    let rc = unsafe { libc::chroot(c_dir.as_ptr()) };
    if rc != 0 {
        return Err(Error::Chroot {
            dir: dir.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    if unsafe { libc::chdir(ROOT_DIR.as_ptr() as *const libc::c_char) } != 0 {
        return Err(Error::Chroot {
            dir: dir.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn drop_privileges(user: &str) -> Result<()> {
    let c_user = CString::new(user).expect("user name contains an interior NUL");
    let pwd = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pwd.is_null() {
        return Err(Error::UnknownUser(user.to_string()));
    }
    let uid = unsafe { (*pwd).pw_uid };
    let gid = unsafe { (*pwd).pw_gid };
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(Error::SetUid { uid, source: std::io::Error::last_os_error() });
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(Error::SetUid { uid, source: std::io::Error::last_os_error() });
    }
    Ok(())
}

fn do_daemonize() -> Result<()> {
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            return Err(Error::Daemonize { source: std::io::Error::last_os_error() });
        }
        if pid > 0 {
            std::process::exit(0);
        }
        if libc::setsid() < 0 {
            return Err(Error::Daemonize { source: std::io::Error::last_os_error() });
        }
        if libc::chdir(ROOT_DIR.as_ptr() as *const libc::c_char) != 0 {
            return Err(Error::Daemonize { source: std::io::Error::last_os_error() });
        }

        let devnull = libc::open(DEV_NULL.as_ptr() as *const libc::c_char, libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }
    Ok(())
}

extern "C" fn segv_handler(_sig: libc::c_int) {
    let bt = backtrace::Backtrace::new();
    eprintln!("received SIGSEGV, backtrace:\n{bt:?}");
    std::process::exit(1);
}

fn install_segv_handler() {
    unsafe {
        libc::signal(libc::SIGSEGV, segv_handler as libc::sighandler_t);
    }
}

fn listener_loop<F>(listen_fd: RawFd, processor: F)
where
    F: Fn(RawFd) + Clone + 'static,
{
    loop {
        match fiber::accept(listen_fd) {
            Ok((conn_fd, _addr)) => {
                let processor = processor.clone();
                if let Err(e) = fiber::Builder::new().name("connection").start(move || processor(conn_fd)) {
                    log::error!("failed to spawn connection fiber: {e}");
                    unsafe {
                        libc::close(conn_fd);
                    }
                }
            }
            Err(e) => {
                log::error!("accept() failed: {e}");
            }
        }
    }
}

/// Runs the harness's main loop: tick the reactor until no fiber is left
/// running, then check for leaked reactor registrations (`spec.md` §8 —
/// "a surviving registration at process exit is a defect").
pub fn run_until_idle() {
    while fiber::count() > 0 {
        fiber::tick();
    }
    fiber::check_for_leaks_at_shutdown();
}
