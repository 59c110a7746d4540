//! A minimal TCP echo server built on the fiber runtime: one fiber per
//! connection, reading and writing back until the peer closes.
//!
//! ```text
//! echo_server -p 7878
//! ```

fn main() {
    pth::log::init(log::LevelFilter::Info);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = pth::server::ServerConfig::from_args(&args);

    config
        .start(echo)
        .unwrap_or_else(|e| {
            log::error!("failed to start server: {e}");
            std::process::exit(1);
        });

    pth::server::run_until_idle();
}

fn echo(fd: std::os::unix::io::RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        match pth::fiber::read(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if pth::fiber::write(fd, &buf[..n]).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("connection {fd} read error: {e}");
                break;
            }
        }
    }
    unsafe {
        libc::close(fd);
    }
}
