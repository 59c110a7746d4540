//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//! use pth::log::Logger;
//!
//! static LOGGER: Logger = Logger::new();
//! log::set_logger(&LOGGER).unwrap();
//! log::set_max_level(LevelFilter::Debug);
//! info!("listener fiber started");
//! ```

use log::{Level, Log, Metadata, Record};

/// [`Log`](https://docs.rs/log/latest/log/trait.Log.html) implementation
/// that timestamps every record with the reactor's monotonic millisecond
/// clock ([`crate::clock::now_ms`]) and writes it to stderr.
///
/// This plays the role the teacher's `TarantoolLogger` plays wrapping
/// Tarantool's `say()`, except there is no C logging sink underneath here:
/// this crate has no persistent state and defines no wire/file format
/// (`spec.md` §6), so a plain stderr line is the whole story.
pub struct Logger;

impl Logger {
    #[inline(always)]
    pub const fn new() -> Self {
        Logger
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for Logger {
    #[inline(always)]
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "[{:>8}ms] {:<5} {}: {}",
            crate::clock::now_ms(),
            level_tag(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Installs [`Logger`] as the global `log` sink at the given max level.
/// Idempotent: safe to call more than once, later calls are no-ops.
pub fn init(level: log::LevelFilter) {
    static LOGGER: Logger = Logger::new();
    // `set_logger` errors if a logger is already installed; that's fine,
    // it just means an earlier `init()` call (or the embedding application)
    // already took care of it.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
